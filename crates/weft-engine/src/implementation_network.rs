use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

use weft_core::error::{Result, WeftError};
use weft_core::traits::{Implementation, InputView, Invocation, Scope};
use weft_core::types::{ContextId, Operation, OperationOutput, ParameterSet};

type ScopeCell = Arc<OnceCell<Option<Scope>>>;

/// Lazily opened scopes plus the order they were opened in.
#[derive(Default)]
struct Scopes {
    cells: Mutex<HashMap<String, ScopeCell>>,
    opened: Mutex<Vec<String>>,
}

impl Scopes {
    fn cell(&self, name: &str) -> ScopeCell {
        self.cells
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Drain opened scopes, most recent first.
    fn drain(&self) -> Vec<(String, Option<Scope>)> {
        let order: Vec<String> = std::mem::take(&mut *self.opened.lock());
        let mut cells = self.cells.lock();
        order
            .into_iter()
            .rev()
            .map(|name| {
                let scope = cells
                    .remove(&name)
                    .and_then(|cell| cell.get().cloned())
                    .flatten();
                (name, scope)
            })
            .collect()
    }
}

/// Holds the runnable body of every operation in a flow and manages their
/// two tiers of entry scope.
///
/// The implementation-wide scope is opened the first time an
/// implementation is invoked and closed by [`close`](Self::close). The
/// per-context scope is opened the first time it runs for a context and
/// closed by [`close_context`](Self::close_context). Both close in reverse
/// order of opening.
pub struct ImplementationNetwork {
    implementations: HashMap<String, Arc<dyn Implementation>>,
    shared: Scopes,
    contexts: Mutex<HashMap<ContextId, Arc<Scopes>>>,
    retry_delay: Duration,
}

impl ImplementationNetwork {
    pub fn new(implementations: HashMap<String, Arc<dyn Implementation>>) -> Self {
        Self {
            implementations,
            shared: Scopes::default(),
            contexts: Mutex::new(HashMap::new()),
            retry_delay: Duration::from_millis(50),
        }
    }

    /// Pause between retries of a failed invocation.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Implementation>> {
        self.implementations
            .get(name)
            .cloned()
            .ok_or_else(|| WeftError::UnknownOperation(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.implementations.contains_key(name)
    }

    /// Resource keys an implementation declares.
    pub fn locks(&self, name: &str) -> Vec<String> {
        self.implementations
            .get(name)
            .map(|i| i.locks())
            .unwrap_or_default()
    }

    /// Implementations whose shared scope is open, in opening order.
    pub fn opened(&self) -> Vec<String> {
        self.shared.opened.lock().clone()
    }

    async fn shared_scope(
        &self,
        name: &str,
        implementation: &Arc<dyn Implementation>,
    ) -> Result<Option<Scope>> {
        let cell = self.shared.cell(name);
        let scope = cell
            .get_or_try_init(|| async {
                let scope = implementation.open().await?;
                self.shared.opened.lock().push(name.to_string());
                debug!(operation = name, "Opened implementation scope");
                Ok::<_, WeftError>(scope)
            })
            .await?;
        Ok(scope.clone())
    }

    async fn context_scope(
        &self,
        context: &ContextId,
        name: &str,
        implementation: &Arc<dyn Implementation>,
    ) -> Result<Option<Scope>> {
        let scopes = self
            .contexts
            .lock()
            .entry(context.clone())
            .or_default()
            .clone();
        let cell = scopes.cell(name);
        let scope = cell
            .get_or_try_init(|| async {
                let scope = implementation.open_context(context.clone()).await?;
                scopes.opened.lock().push(name.to_string());
                debug!(context = %context, operation = name, "Opened context scope");
                Ok::<_, WeftError>(scope)
            })
            .await?;
        Ok(scope.clone())
    }

    /// Invoke an operation, retrying up to `retries` more times. Failures
    /// are logged with the full parameter set provenance and returned as
    /// [`WeftError::Implementation`].
    pub async fn invoke(
        &self,
        operation: Arc<Operation>,
        parameters: ParameterSet,
        view: Arc<dyn InputView>,
        retries: u32,
    ) -> Result<OperationOutput> {
        let name = operation.name.clone();
        let context = parameters.context.clone();
        let implementation = self.get(&name)?;
        let shared = self.shared_scope(&name, &implementation).await?;
        let local = self
            .context_scope(&context, &name, &implementation)
            .await?;

        let mut attempt = 0u32;
        loop {
            let call = Invocation {
                context: context.clone(),
                operation: operation.clone(),
                parameters: parameters.clone(),
                shared: shared.clone(),
                local: local.clone(),
                view: view.clone(),
            };
            match implementation.invoke(call).await {
                Ok(output) => return Ok(output),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(
                        context = %context,
                        operation = %name,
                        attempt,
                        retries,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    error!(
                        context = %context,
                        operation = %name,
                        attempts = attempt + 1,
                        provenance = %parameters.provenance(),
                        error = %e,
                        "Operation failed"
                    );
                    return Err(match e {
                        e @ WeftError::Implementation { .. } => e,
                        other => WeftError::implementation(&name, &context, other.to_string()),
                    });
                }
            }
        }
    }

    /// Close every per-context scope of `context`. All scopes are closed
    /// even if one fails; the first error is returned.
    pub async fn close_context(&self, context: &ContextId) -> Result<()> {
        let Some(scopes) = self.contexts.lock().remove(context) else {
            return Ok(());
        };
        let mut first_error = None;
        for (name, scope) in scopes.drain() {
            let Some(implementation) = self.implementations.get(&name) else {
                continue;
            };
            debug!(context = %context, operation = %name, "Closing context scope");
            if let Err(e) = implementation.close_context(context.clone(), scope).await {
                warn!(
                    context = %context,
                    operation = %name,
                    error = %e,
                    "Context scope close failed"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Close every remaining context scope, then every implementation-wide
    /// scope.
    pub async fn close(&self) -> Result<()> {
        let mut first_error = None;
        let remaining: Vec<ContextId> = self.contexts.lock().keys().cloned().collect();
        for context in remaining {
            if let Err(e) = self.close_context(&context).await {
                first_error.get_or_insert(e);
            }
        }
        for (name, scope) in self.shared.drain() {
            let Some(implementation) = self.implementations.get(&name) else {
                continue;
            };
            debug!(operation = %name, "Closing implementation scope");
            if let Err(e) = implementation.close(scope).await {
                warn!(operation = %name, error = %e, "Implementation scope close failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
