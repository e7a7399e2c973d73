use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WeftError};
use crate::types::{ContextId, Source};

/// A seed value in a graph document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedInput {
    pub definition: String,
    pub value: Value,
    /// Target context; flow-wide seeds go to every context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextId>,
}

impl SeedInput {
    pub fn new(definition: impl Into<String>, value: Value) -> Self {
        Self {
            definition: definition.into(),
            value,
            context: None,
        }
    }

    pub fn for_context(mut self, context: impl Into<ContextId>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Operation name → parameter → allowed sources.
pub type Routes = BTreeMap<String, BTreeMap<String, Vec<Source>>>;

/// Decoded graph definition: operations by name, seeds, the output
/// specification and optional input routing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    pub operations: Vec<String>,
    #[serde(default)]
    pub seed: Vec<SeedInput>,
    #[serde(default)]
    pub output_spec: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flow: Routes,
}

impl GraphDocument {
    /// Load a document from a `.json` or `.toml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") | None => Self::from_json(&content),
            Some(other) => Err(WeftError::Config(format!(
                "unsupported graph format '.{}' (expected .json or .toml)",
                other
            ))),
        }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| WeftError::Config(e.to_string()))
    }

    /// Seeds that apply to `context`: flow-wide seeds first, then its own.
    pub fn seeds_for<'a>(&'a self, context: &'a ContextId) -> impl Iterator<Item = &'a SeedInput> {
        self.seed
            .iter()
            .filter(|s| s.context.is_none())
            .chain(self.seed.iter().filter(move |s| s.context.as_ref() == Some(context)))
    }

    /// Contexts named explicitly by seeds, in first-seen order.
    pub fn seeded_contexts(&self) -> Vec<ContextId> {
        let mut out: Vec<ContextId> = Vec::new();
        for ctx in self.seed.iter().filter_map(|s| s.context.as_ref()) {
            if !out.contains(ctx) {
                out.push(ctx.clone());
            }
        }
        out
    }
}
