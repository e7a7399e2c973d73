use futures::future::BoxFuture;
use serde_json::{Map, Value};

use weft_core::error::{Result, WeftError};
use weft_core::traits::{Implementation, Invocation};
use weft_core::types::{Definition, Operation, OperationOutput, Primitive};

pub fn mapping() -> Definition {
    Definition::new("mapping", Primitive::Map)
}

pub fn mapping_traverse() -> Definition {
    Definition::new("mapping_traverse", Primitive::List(Box::new(Primitive::String)))
}

pub fn mapping_key() -> Definition {
    Definition::new("key", Primitive::String)
}

pub fn mapping_value() -> Definition {
    Definition::new("value", Primitive::Any)
}

/// Walk `traverse` keys into a nested mapping.
pub fn traverse<'a>(mapping: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(mapping, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Extract a value from a mapping by a list of keys.
pub struct MappingExtract;

impl MappingExtract {
    pub fn operation() -> Operation {
        Operation::new("mapping_extract")
            .input("mapping", mapping())
            .input("traverse", mapping_traverse())
            .output("value", mapping_value())
    }
}

impl Implementation for MappingExtract {
    fn invoke(&self, call: Invocation) -> BoxFuture<'_, Result<OperationOutput>> {
        Box::pin(async move {
            let fail = |message: String| {
                WeftError::implementation(call.operation.name.clone(), &call.context, message)
            };
            let source = call.value("mapping").unwrap_or(Value::Null);
            let path: Vec<String> = serde_json::from_value(call.value("traverse").unwrap_or(Value::Null))
                .map_err(|e| fail(format!("traverse must be a list of keys: {}", e)))?;
            let found = traverse(&source, &path)
                .ok_or_else(|| fail(format!("no value at {}", path.join("."))))?;
            Ok(OperationOutput::single("value", found.clone()))
        })
    }
}

/// Build a single-entry mapping from a key and a value.
pub struct MappingCreate;

impl MappingCreate {
    pub fn operation() -> Operation {
        Operation::new("mapping_create")
            .input("key", mapping_key())
            .input("value", mapping_value())
            .output("mapping", mapping())
    }
}

impl Implementation for MappingCreate {
    fn invoke(&self, call: Invocation) -> BoxFuture<'_, Result<OperationOutput>> {
        Box::pin(async move {
            let key = match call.value("key") {
                Some(Value::String(k)) => k,
                _ => {
                    return Err(WeftError::implementation(
                        call.operation.name.clone(),
                        &call.context,
                        "key must be a string",
                    ))
                }
            };
            let mut map = Map::new();
            map.insert(key, call.value("value").unwrap_or(Value::Null));
            Ok(OperationOutput::single("mapping", Value::Object(map)))
        })
    }
}
