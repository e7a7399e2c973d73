use std::collections::HashMap;
use std::sync::Arc;

use weft_core::error::{Result, WeftError};
use weft_core::traits::Implementation;
use weft_core::types::Operation;

/// An operation declaration paired with its runnable body.
#[derive(Clone)]
pub struct RegisteredOperation {
    pub operation: Arc<Operation>,
    pub implementation: Arc<dyn Implementation>,
}

/// Registry of available operations, keyed by name.
pub struct OperationRegistry {
    entries: HashMap<String, RegisteredOperation>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register an operation under `name`. The declaration is renamed to
    /// match, so one body can be registered under several names.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        mut operation: Operation,
        implementation: impl Implementation,
    ) {
        let name = name.into();
        operation.name = name.clone();
        self.entries.insert(
            name,
            RegisteredOperation {
                operation: Arc::new(operation),
                implementation: Arc::new(implementation),
            },
        );
    }

    /// Register an operation under its own name.
    pub fn add(&mut self, operation: Operation, implementation: impl Implementation) {
        let name = operation.name.clone();
        self.register(name, operation, implementation);
    }

    /// Unregister an operation by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn lookup(&self, name: &str) -> Option<RegisteredOperation> {
        self.entries.get(name).cloned()
    }

    /// Like [`lookup`](Self::lookup) but unknown names are an error.
    pub fn require(&self, name: &str) -> Result<RegisteredOperation> {
        self.lookup(name)
            .ok_or_else(|| WeftError::UnknownOperation(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn operations(&self) -> Vec<Arc<Operation>> {
        let mut ops: Vec<Arc<Operation>> =
            self.entries.values().map(|e| e.operation.clone()).collect();
        ops.sort_by(|a, b| a.name.cmp(&b.name));
        ops
    }

    /// Create a registry with all built-in operations registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtin::register_all(&mut registry);
        registry
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
