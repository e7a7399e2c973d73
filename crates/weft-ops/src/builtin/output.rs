use std::cmp::Ordering;
use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::{Implementation, InputView, Invocation};
use weft_core::types::{Definition, Operation, OperationOutput, Primitive, Stage};

pub fn get_single_spec() -> Definition {
    Definition::new(
        "get_single_spec",
        Primitive::List(Box::new(Primitive::String)),
    )
}

pub fn get_single_output() -> Definition {
    Definition::new("get_single_output", Primitive::Map)
}

pub fn group_by_spec() -> Definition {
    Definition::new("group_by_spec", Primitive::Map)
}

pub fn group_by_output() -> Definition {
    Definition::new("group_by_output", Primitive::Map)
}

pub fn associate_spec() -> Definition {
    Definition::new("associate_spec", Primitive::List(Box::new(Primitive::String)))
}

pub fn associate_output() -> Definition {
    Definition::new("associate_output", Primitive::Map)
}

/// Most recent value of each named definition. Names with no Input in the
/// view are left out.
pub fn select_latest(view: &dyn InputView, names: &[String]) -> Map<String, Value> {
    names
        .iter()
        .filter_map(|name| view.latest(name).map(|i| (name.clone(), i.value.clone())))
        .collect()
}

fn spec_names(call: &Invocation) -> Result<Vec<String>> {
    let spec = call.value("spec").unwrap_or(Value::Null);
    serde_json::from_value(spec).map_err(|e| {
        WeftError::implementation(
            call.operation.name.clone(),
            &call.context,
            format!("spec must be a list of definition names: {}", e),
        )
    })
}

/// Take a list of wanted definition names and output the most recent
/// value for each.
pub struct GetSingle;

impl GetSingle {
    pub fn operation() -> Operation {
        Operation::new("get_single")
            .input("spec", get_single_spec())
            .output("output", get_single_output())
            .stage(Stage::Output)
    }
}

impl Implementation for GetSingle {
    fn invoke(&self, call: Invocation) -> BoxFuture<'_, Result<OperationOutput>> {
        Box::pin(async move {
            let names = spec_names(&call)?;
            debug!(context = %call.context, spec = ?names, "get_single");
            let want = select_latest(call.view.as_ref(), &names);
            Ok(OperationOutput::single("output", Value::Object(want)))
        })
    }
}

/// One entry of a `group_by` spec.
#[derive(Debug, Deserialize)]
struct GroupSpec {
    /// Definition whose Inputs form the groups.
    group: String,
    /// Definition whose values are collected under each group.
    by: String,
    /// Stands in for a group with no values.
    #[serde(default)]
    fill: Option<Value>,
}

/// Order JSON scalars the way a reader expects: numbers numerically,
/// strings lexically, anything else by its rendering.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Collect values of one definition under Inputs of an ancestor
/// definition. Spec `{name: {group, by, fill?}}` yields `{name: [..]}`
/// with values laid out group by group, groups sorted by value.
pub struct GroupBy;

impl GroupBy {
    pub fn operation() -> Operation {
        Operation::new("group_by")
            .input("spec", group_by_spec())
            .output("output", group_by_output())
            .stage(Stage::Output)
    }
}

impl Implementation for GroupBy {
    fn invoke(&self, call: Invocation) -> BoxFuture<'_, Result<OperationOutput>> {
        Box::pin(async move {
            let spec = call.value("spec").unwrap_or(Value::Null);
            let specs: BTreeMap<String, GroupSpec> =
                serde_json::from_value(spec).map_err(|e| {
                    WeftError::implementation(
                        call.operation.name.clone(),
                        &call.context,
                        format!("group_by spec must map names to {{group, by}}: {}", e),
                    )
                })?;
            debug!(context = %call.context, outputs = specs.len(), "group_by");

            let view = call.view.as_ref();
            let mut want = Map::new();
            for (name, spec) in specs {
                let mut groups = view.inputs(&spec.group);
                groups.sort_by(|a, b| compare_values(&a.value, &b.value));
                let members: Vec<_> = view
                    .inputs(&spec.by)
                    .into_iter()
                    .map(|item| {
                        let lineage = view.ancestors(&item.uid);
                        (item, lineage)
                    })
                    .collect();

                let mut values = Vec::new();
                for group in &groups {
                    let before = values.len();
                    values.extend(
                        members
                            .iter()
                            .filter(|(_, lineage)| lineage.iter().any(|p| p.uid == group.uid))
                            .map(|(item, _)| item.value.clone()),
                    );
                    if values.len() == before {
                        values.extend(spec.fill.clone());
                    }
                }
                want.insert(name, Value::Array(values));
            }
            Ok(OperationOutput::single("output", Value::Object(want)))
        })
    }
}

/// Pair every value of one definition with the value of a chosen ancestor
/// definition: spec `[key, value]` yields `{value: {key_value: value}}`.
pub struct Associate;

impl Associate {
    pub fn operation() -> Operation {
        Operation::new("associate")
            .input("spec", associate_spec())
            .output("output", associate_output())
            .stage(Stage::Output)
    }
}

impl Implementation for Associate {
    fn invoke(&self, call: Invocation) -> BoxFuture<'_, Result<OperationOutput>> {
        Box::pin(async move {
            let names = spec_names(&call)?;
            let [key, value] = names.as_slice() else {
                return Err(WeftError::implementation(
                    call.operation.name.clone(),
                    &call.context,
                    "associate spec must name exactly two definitions",
                ));
            };

            let mut want = Map::new();
            for item in call.view.inputs(value) {
                let ancestor = call
                    .view
                    .ancestors(&item.uid)
                    .into_iter()
                    .find(|p| &p.definition.name == key);
                if let Some(parent) = ancestor {
                    let k = match &parent.value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    want.insert(k, item.value.clone());
                }
            }

            let mut out = Map::new();
            out.insert(value.clone(), Value::Object(want));
            Ok(OperationOutput::single("output", Value::Object(out)))
        })
    }
}
