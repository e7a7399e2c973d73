use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::Result;
use crate::types::{ContextId, Input, InputUid, Operation, OperationOutput, ParameterSet};

/// Resource object produced by an implementation's entry scope.
pub type Scope = Arc<dyn Any + Send + Sync>;

/// Read access to one context's Input Network.
pub trait InputView: Send + Sync {
    /// Inputs of a definition, oldest first.
    fn inputs(&self, definition: &str) -> Vec<Arc<Input>>;

    /// The most recently added Input of a definition.
    fn latest(&self, definition: &str) -> Option<Arc<Input>> {
        self.inputs(definition).pop()
    }

    /// Look up one Input by uid.
    fn get(&self, uid: &InputUid) -> Option<Arc<Input>>;

    /// Names of definitions with at least one Input.
    fn definitions(&self) -> BTreeSet<String>;

    /// Every transitive parent of an Input.
    fn ancestors(&self, uid: &InputUid) -> Vec<Arc<Input>>;
}

/// Everything an implementation sees for one call.
pub struct Invocation {
    pub context: ContextId,
    pub operation: Arc<Operation>,
    pub parameters: ParameterSet,
    /// Implementation-wide scope, shared across contexts.
    pub shared: Option<Scope>,
    /// Per-context scope.
    pub local: Option<Scope>,
    pub view: Arc<dyn InputView>,
}

impl Invocation {
    /// Value bound to a parameter.
    pub fn value(&self, param: &str) -> Option<Value> {
        self.parameters.get(param).map(|b| b.value())
    }

    /// All parameter values.
    pub fn values(&self) -> serde_json::Map<String, Value> {
        self.parameters.values()
    }

    /// Downcast the implementation-wide scope.
    pub fn shared<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.shared.as_ref().and_then(|s| s.downcast_ref::<T>())
    }

    /// Downcast the per-context scope.
    pub fn local<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.local.as_ref().and_then(|s| s.downcast_ref::<T>())
    }
}

/// Runnable body of an operation.
///
/// Entry scopes are opened lazily by the implementation network: `open`
/// the first time the implementation is used in a run, `open_context` the
/// first time it runs for a context. Each is closed exactly once, in
/// reverse order of opening.
pub trait Implementation: Send + Sync + 'static {
    /// Run the operation body.
    fn invoke(&self, call: Invocation) -> BoxFuture<'_, Result<OperationOutput>>;

    /// Shared resource keys this implementation must hold while running.
    fn locks(&self) -> Vec<String> {
        vec![]
    }

    /// Construct the implementation-wide scope.
    fn open(&self) -> BoxFuture<'_, Result<Option<Scope>>> {
        Box::pin(async { Ok(None) })
    }

    /// Tear down the implementation-wide scope.
    fn close(&self, scope: Option<Scope>) -> BoxFuture<'_, Result<()>> {
        let _ = scope;
        Box::pin(async { Ok(()) })
    }

    /// Construct the per-context scope.
    fn open_context(&self, context: ContextId) -> BoxFuture<'_, Result<Option<Scope>>> {
        let _ = context;
        Box::pin(async { Ok(None) })
    }

    /// Tear down the per-context scope.
    fn close_context(
        &self,
        context: ContextId,
        scope: Option<Scope>,
    ) -> BoxFuture<'_, Result<()>> {
        let _ = (context, scope);
        Box::pin(async { Ok(()) })
    }
}
