use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, WeftError};

/// Opaque, caller-supplied identifier of a logical execution context.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh context id for ad hoc single runs.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ContextId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ContextId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of a single Input.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputUid(pub String);

impl InputUid {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InputUid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for InputUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse type tag of a Definition. Checked shallowly, never structurally
/// beyond list element tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Primitive {
    String,
    Bytes,
    Boolean,
    Integer,
    Float,
    List(Box<Primitive>),
    Map,
    #[default]
    Any,
}

impl Primitive {
    /// Whether `value` is acceptable for this primitive.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Primitive::Any => true,
            Primitive::String => value.is_string(),
            Primitive::Bytes => {
                value.is_string()
                    || value.as_array().is_some_and(|items| {
                        items
                            .iter()
                            .all(|b| b.as_u64().is_some_and(|n| n <= u8::MAX as u64))
                    })
            }
            Primitive::Boolean => value.is_boolean(),
            Primitive::Integer => value.is_i64() || value.is_u64(),
            Primitive::Float => value.is_number(),
            Primitive::List(inner) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|item| inner.accepts(item))),
            Primitive::Map => value.is_object(),
        }
    }
}

impl FromStr for Primitive {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(inner) = s
            .strip_prefix("list<")
            .and_then(|rest| rest.strip_suffix('>'))
        {
            return Ok(Primitive::List(Box::new(inner.parse()?)));
        }
        match s {
            "string" | "str" => Ok(Primitive::String),
            "bytes" => Ok(Primitive::Bytes),
            "boolean" | "bool" => Ok(Primitive::Boolean),
            "integer" | "int" => Ok(Primitive::Integer),
            "float" => Ok(Primitive::Float),
            "list" | "array" => Ok(Primitive::List(Box::new(Primitive::Any))),
            "map" | "mapping" => Ok(Primitive::Map),
            "any" | "generic" => Ok(Primitive::Any),
            other => Err(WeftError::Graph(format!("unknown primitive '{}'", other))),
        }
    }
}

impl TryFrom<String> for Primitive {
    type Error = WeftError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Primitive> for String {
    fn from(p: Primitive) -> Self {
        p.to_string()
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Primitive::String => write!(f, "string"),
            Primitive::Bytes => write!(f, "bytes"),
            Primitive::Boolean => write!(f, "boolean"),
            Primitive::Integer => write!(f, "integer"),
            Primitive::Float => write!(f, "float"),
            Primitive::List(inner) => write!(f, "list<{}>", inner),
            Primitive::Map => write!(f, "map"),
            Primitive::Any => write!(f, "any"),
        }
    }
}

/// Named, typed value descriptor connecting operation outputs to inputs.
///
/// Identity is by name: two definitions with the same name compare equal
/// regardless of their other fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    pub name: String,
    #[serde(default)]
    pub primitive: Primitive,
    /// Inputs of this definition are locked per uid while in use.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub lock: bool,
    /// Value bound to optional parameters when no Input exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Definition {
    pub fn new(name: impl Into<String>, primitive: Primitive) -> Self {
        Self {
            name: name.into(),
            primitive,
            lock: false,
            default: None,
        }
    }

    /// Mark inputs of this definition as exclusive.
    pub fn with_lock(mut self) -> Self {
        self.lock = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Check a value against this definition's primitive.
    pub fn check(&self, value: &Value) -> Result<()> {
        if self.primitive.accepts(value) {
            Ok(())
        } else {
            Err(WeftError::PrimitiveMismatch {
                definition: self.name.clone(),
                expected: self.primitive.to_string(),
            })
        }
    }
}

impl PartialEq for Definition {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Definition {}

impl Hash for Definition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// When an operation runs within a context's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Participates in the fixpoint loop.
    #[default]
    Processing,
    /// Runs once after the context is quiescent.
    Cleanup,
    /// Runs once after cleanup; results are returned, not merged.
    Output,
}

/// A named unit of work with typed inputs, outputs and run conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Definition>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Definition>,
    /// Each condition needs at least one truthy Input before the operation runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Definition>,
    /// Parameters bound to every current Input of their definition.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub expand: BTreeSet<String>,
    /// Parameters that may be unbound.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub optional: BTreeSet<String>,
    /// Outputs whose array values are merged as one Input per element.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub expand_outputs: BTreeSet<String>,
    /// Where each parameter may take Inputs from. Parameters not listed
    /// take any Input of their definition.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sources: BTreeMap<String, Vec<Source>>,
    #[serde(default)]
    pub stage: Stage,
    /// Retries after a failed invocation; falls back to the orchestrator default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<Value>,
}

impl Operation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            conditions: vec![],
            expand: BTreeSet::new(),
            optional: BTreeSet::new(),
            expand_outputs: BTreeSet::new(),
            sources: BTreeMap::new(),
            stage: Stage::Processing,
            retry: None,
            config_schema: None,
        }
    }

    pub fn input(mut self, param: impl Into<String>, definition: Definition) -> Self {
        self.inputs.insert(param.into(), definition);
        self
    }

    pub fn output(mut self, name: impl Into<String>, definition: Definition) -> Self {
        self.outputs.insert(name.into(), definition);
        self
    }

    pub fn condition(mut self, definition: Definition) -> Self {
        if !self.conditions.contains(&definition) {
            self.conditions.push(definition);
        }
        self
    }

    /// Bind `param` to all current Inputs of its definition.
    pub fn expand(mut self, param: impl Into<String>) -> Self {
        self.expand.insert(param.into());
        self
    }

    pub fn optional(mut self, param: impl Into<String>) -> Self {
        self.optional.insert(param.into());
        self
    }

    pub fn expand_output(mut self, name: impl Into<String>) -> Self {
        self.expand_outputs.insert(name.into());
        self
    }

    /// Restrict `param` to Inputs from `source`. Repeat to allow several.
    pub fn source(mut self, param: impl Into<String>, source: Source) -> Self {
        let sources = self.sources.entry(param.into()).or_default();
        if !sources.contains(&source) {
            sources.push(source);
        }
        self
    }

    /// Whether `input` may bind to `param`.
    pub fn accepts(&self, param: &str, input: &Input) -> bool {
        match self.sources.get(param) {
            Some(sources) if !sources.is_empty() => sources.iter().any(|s| s.admits(input)),
            _ => true,
        }
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    pub fn retry(mut self, retries: u32) -> Self {
        self.retry = Some(retries);
        self
    }

    pub fn config_schema(mut self, schema: Value) -> Self {
        self.config_schema = Some(schema);
        self
    }

    /// Every definition this operation references.
    pub fn definitions(&self) -> impl Iterator<Item = &Definition> {
        self.inputs
            .values()
            .chain(self.outputs.values())
            .chain(self.conditions.iter())
    }
}

/// Which operation output produced an Input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub operation: String,
    pub output: String,
}

/// An allowed producer of a parameter's Inputs, written `seed` or
/// `operation.output`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Source {
    /// Values supplied by the caller, seeded or injected.
    Seed,
    Output { operation: String, output: String },
}

impl Source {
    pub fn output(operation: impl Into<String>, output: impl Into<String>) -> Self {
        Source::Output {
            operation: operation.into(),
            output: output.into(),
        }
    }

    pub fn admits(&self, input: &Input) -> bool {
        match (self, &input.origin) {
            (Source::Seed, None) => true,
            (Source::Output { operation, output }, Some(origin)) => {
                &origin.operation == operation && &origin.output == output
            }
            _ => false,
        }
    }
}

impl FromStr for Source {
    type Err = WeftError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "seed" {
            return Ok(Source::Seed);
        }
        match s.split_once('.') {
            Some((operation, output)) if !operation.is_empty() && !output.is_empty() => {
                Ok(Source::output(operation, output))
            }
            _ => Err(WeftError::Graph(format!(
                "source '{}' is neither 'seed' nor 'operation.output'",
                s
            ))),
        }
    }
}

impl TryFrom<String> for Source {
    type Error = WeftError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Source> for String {
    fn from(s: Source) -> Self {
        s.to_string()
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Seed => write!(f, "seed"),
            Source::Output { operation, output } => write!(f, "{}.{}", operation, output),
        }
    }
}

/// A concrete value tagged with its Definition and provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Input {
    pub uid: InputUid,
    pub value: Value,
    pub definition: Definition,
    /// Inputs that caused this one to be produced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<InputUid>,
    /// `None` for seed inputs supplied by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}

impl Input {
    /// A caller-supplied value with no provenance.
    pub fn seed(definition: Definition, value: Value) -> Self {
        Self {
            uid: InputUid::generate(),
            value,
            definition,
            parents: vec![],
            origin: None,
        }
    }

    /// A value produced by an operation output.
    pub fn derived(
        definition: Definition,
        value: Value,
        parents: Vec<InputUid>,
        origin: Origin,
    ) -> Self {
        Self {
            uid: InputUid::generate(),
            value,
            definition,
            parents,
            origin: Some(origin),
        }
    }

    pub fn is_truthy(&self) -> bool {
        truthy(&self.value)
    }
}

/// Truthiness of a JSON value: null, false, zero and empty containers are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// What a parameter is bound to.
#[derive(Debug, Clone)]
pub enum Binding {
    One(Arc<Input>),
    /// An `expand` parameter: every current Input, oldest first.
    Many(Vec<Arc<Input>>),
    /// An unbound optional parameter.
    Default(Value),
}

impl Binding {
    /// The value passed to the implementation.
    pub fn value(&self) -> Value {
        match self {
            Binding::One(input) => input.value.clone(),
            Binding::Many(inputs) => Value::Array(inputs.iter().map(|i| i.value.clone()).collect()),
            Binding::Default(value) => value.clone(),
        }
    }

    pub fn inputs(&self) -> Vec<&Arc<Input>> {
        match self {
            Binding::One(input) => vec![input],
            Binding::Many(inputs) => inputs.iter().collect(),
            Binding::Default(_) => vec![],
        }
    }
}

/// Binding of an operation's parameters to specific Inputs in one context.
#[derive(Debug, Clone)]
pub struct ParameterSet {
    pub context: ContextId,
    pub operation: String,
    pub bindings: BTreeMap<String, Binding>,
}

impl ParameterSet {
    pub fn new(context: ContextId, operation: impl Into<String>) -> Self {
        Self {
            context,
            operation: operation.into(),
            bindings: BTreeMap::new(),
        }
    }

    pub fn bind(mut self, param: impl Into<String>, binding: Binding) -> Self {
        self.bindings.insert(param.into(), binding);
        self
    }

    pub fn get(&self, param: &str) -> Option<&Binding> {
        self.bindings.get(param)
    }

    /// Parameter name → value, as handed to implementations.
    pub fn values(&self) -> serde_json::Map<String, Value> {
        self.bindings
            .iter()
            .map(|(k, b)| (k.clone(), b.value()))
            .collect()
    }

    /// All bound Inputs, in parameter order.
    pub fn inputs(&self) -> Vec<Arc<Input>> {
        self.bindings
            .values()
            .flat_map(|b| b.inputs().into_iter().cloned())
            .collect()
    }

    pub fn uids(&self) -> Vec<InputUid> {
        self.inputs().into_iter().map(|i| i.uid.clone()).collect()
    }

    /// Ordered (parameter, uids) pairs identifying this binding.
    pub fn identity(&self) -> Vec<(&str, Vec<&str>)> {
        self.bindings
            .iter()
            .map(|(k, b)| {
                let uids = match b {
                    Binding::One(input) => vec![input.uid.as_str()],
                    Binding::Many(inputs) => inputs.iter().map(|i| i.uid.as_str()).collect(),
                    Binding::Default(_) => vec![],
                };
                (k.as_str(), uids)
            })
            .collect()
    }

    /// Human-readable provenance for logs.
    pub fn provenance(&self) -> String {
        self.bindings
            .iter()
            .map(|(k, b)| {
                let sources = b
                    .inputs()
                    .iter()
                    .map(|i| {
                        let origin = i
                            .origin
                            .as_ref()
                            .map(|o| format!("{}.{}", o.operation, o.output))
                            .unwrap_or_else(|| "seed".to_string());
                        format!("{}={} ({})", i.uid, i.value, origin)
                    })
                    .collect::<Vec<_>>();
                if sources.is_empty() {
                    format!("{}: default {}", k, b.value())
                } else {
                    format!("{}: [{}]", k, sources.join(", "))
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Result of an operation body.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutput {
    /// Output name → value.
    Outputs(serde_json::Map<String, Value>),
    /// Ran successfully with nothing to report.
    NoOutput,
}

impl OperationOutput {
    pub fn from_pairs<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Outputs(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn single(key: impl Into<String>, value: Value) -> Self {
        Self::from_pairs([(key.into(), value)])
    }

    pub fn is_empty(&self) -> bool {
        match self {
            OperationOutput::Outputs(map) => map.is_empty(),
            OperationOutput::NoOutput => true,
        }
    }
}
