use std::future::Future;

use futures::future::BoxFuture;

use weft_core::error::Result;
use weft_core::traits::{Implementation, Invocation};
use weft_core::types::OperationOutput;

type InvokeFn = dyn Fn(Invocation) -> BoxFuture<'static, Result<OperationOutput>> + Send + Sync;

/// Implementation backed by an async closure.
///
/// Suited to stateless operation bodies; anything holding resources should
/// implement [`Implementation`] directly and use its entry scopes.
pub struct FnImplementation {
    f: Box<InvokeFn>,
    locks: Vec<String>,
}

impl FnImplementation {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<OperationOutput>> + Send + 'static,
    {
        Self {
            f: Box::new(move |call| Box::pin(f(call))),
            locks: vec![],
        }
    }

    /// Declare shared resource keys held while the closure runs.
    pub fn with_locks<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locks = keys.into_iter().map(Into::into).collect();
        self
    }
}

impl Implementation for FnImplementation {
    fn invoke(&self, call: Invocation) -> BoxFuture<'_, Result<OperationOutput>> {
        (self.f)(call)
    }

    fn locks(&self) -> Vec<String> {
        self.locks.clone()
    }
}
