use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::{Result, WeftError};
use crate::types::{Definition, Operation};

/// Registry of every Definition known to a run.
///
/// Populated from operation declarations before a run starts; Inputs and
/// parameters referencing a name outside the registry are rejected.
#[derive(Default)]
pub struct DefinitionRegistry {
    definitions: RwLock<BTreeMap<String, Definition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from all definitions the operations reference.
    pub fn from_operations<'a>(operations: impl IntoIterator<Item = &'a Operation>) -> Result<Self> {
        let registry = Self::new();
        for op in operations {
            for def in op.definitions() {
                registry.register(def.clone()).map_err(|e| match e {
                    WeftError::Graph(msg) => WeftError::Graph(format!("{}: {}", op.name, msg)),
                    other => other,
                })?;
            }
        }
        Ok(registry)
    }

    /// Register a definition. Re-registering the same name is a no-op unless
    /// the primitives disagree.
    pub fn register(&self, definition: Definition) -> Result<()> {
        let mut defs = self.definitions.write();
        if let Some(existing) = defs.get(&definition.name) {
            if existing.primitive != definition.primitive {
                return Err(WeftError::Graph(format!(
                    "definition '{}' declared as both {} and {}",
                    definition.name, existing.primitive, definition.primitive
                )));
            }
            return Ok(());
        }
        defs.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Definition> {
        self.definitions.read().get(name).cloned()
    }

    /// Like [`get`](Self::get) but unknown names are an error.
    pub fn require(&self, name: &str) -> Result<Definition> {
        self.get(name)
            .ok_or_else(|| WeftError::UnknownDefinition(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.definitions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.read().is_empty()
    }
}
