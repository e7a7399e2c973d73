//! Shared test doubles for Weft crates.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;

use weft_core::error::{Result, WeftError};
use weft_core::traits::{Implementation, InputView, Invocation, Scope};
use weft_core::types::{
    Binding, ContextId, Definition, Input, InputUid, Operation, OperationOutput, ParameterSet,
    Primitive,
};

pub fn int_def(name: &str) -> Definition {
    Definition::new(name, Primitive::Integer)
}

pub fn bool_def(name: &str) -> Definition {
    Definition::new(name, Primitive::Boolean)
}

pub fn str_def(name: &str) -> Definition {
    Definition::new(name, Primitive::String)
}

/// In-memory [`InputView`] for exercising implementations without an
/// input network.
#[derive(Default)]
pub struct MemoryView {
    inputs: Mutex<Vec<Arc<Input>>>,
}

impl MemoryView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, input: Input) -> Arc<Input> {
        let input = Arc::new(input);
        self.inputs.lock().push(input.clone());
        input
    }
}

impl InputView for MemoryView {
    fn inputs(&self, definition: &str) -> Vec<Arc<Input>> {
        self.inputs
            .lock()
            .iter()
            .filter(|i| i.definition.name == definition)
            .cloned()
            .collect()
    }

    fn get(&self, uid: &InputUid) -> Option<Arc<Input>> {
        self.inputs.lock().iter().find(|i| &i.uid == uid).cloned()
    }

    fn definitions(&self) -> BTreeSet<String> {
        self.inputs
            .lock()
            .iter()
            .map(|i| i.definition.name.clone())
            .collect()
    }

    fn ancestors(&self, uid: &InputUid) -> Vec<Arc<Input>> {
        let all = self.inputs.lock().clone();
        let mut out: Vec<Arc<Input>> = Vec::new();
        let mut frontier = std::collections::VecDeque::from([uid.clone()]);
        while let Some(current) = frontier.pop_front() {
            let Some(input) = all.iter().find(|i| i.uid == current) else {
                continue;
            };
            for parent in &input.parents {
                if let Some(p) = all.iter().find(|i| &i.uid == parent) {
                    if !out.iter().any(|o| o.uid == p.uid) {
                        out.push(p.clone());
                        frontier.push_back(p.uid.clone());
                    }
                }
            }
        }
        out
    }
}

/// Build an invocation binding each parameter to a fresh seed Input.
pub fn invocation(operation: &str, params: &[(&str, Definition, Value)]) -> Invocation {
    invocation_with_view(operation, params, Arc::new(MemoryView::new()))
}

/// Like [`invocation`] but records the seeds in `view`.
pub fn invocation_with_view(
    operation: &str,
    params: &[(&str, Definition, Value)],
    view: Arc<MemoryView>,
) -> Invocation {
    let context = ContextId::from("test");
    let mut op = Operation::new(operation);
    let mut ps = ParameterSet::new(context.clone(), operation);
    for (name, def, value) in params {
        op = op.input(*name, def.clone());
        let input = view.add(Input::seed(def.clone(), value.clone()));
        ps = ps.bind(*name, Binding::One(input));
    }
    Invocation {
        context,
        operation: Arc::new(op),
        parameters: ps,
        shared: None,
        local: None,
        view,
    }
}

/// Tracks how many holders are active at once and the peak.
#[derive(Default)]
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enter(self: &Arc<Self>) -> ProbeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ProbeGuard {
            probe: self.clone(),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct ProbeGuard {
    probe: Arc<ConcurrencyProbe>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.probe.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Test double resource: records `start`/`end` marks so interleaved
/// writers are visible.
#[derive(Default)]
pub struct RecordingStore {
    marks: Mutex<Vec<String>>,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark(&self, mark: impl Into<String>) {
        self.marks.lock().push(mark.into());
    }

    pub fn marks(&self) -> Vec<String> {
        self.marks.lock().clone()
    }

    /// True when every `start:x` is immediately followed by `end:x`.
    pub fn is_serialized(&self) -> bool {
        let marks = self.marks();
        marks.chunks(2).all(|pair| match pair {
            [start, end] => match (start.strip_prefix("start:"), end.strip_prefix("end:")) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            _ => false,
        })
    }
}

/// Sleeps while holding a probe and writing to a store; optionally declares
/// lock resource keys.
pub struct SlowImplementation {
    pub delay: Duration,
    pub probe: Arc<ConcurrencyProbe>,
    pub store: Arc<RecordingStore>,
    pub calls: Arc<AtomicUsize>,
    pub lock_keys: Vec<String>,
}

impl SlowImplementation {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            probe: ConcurrencyProbe::new(),
            store: RecordingStore::new(),
            calls: Arc::new(AtomicUsize::new(0)),
            lock_keys: vec![],
        }
    }

    pub fn with_locks(mut self, keys: &[&str]) -> Self {
        self.lock_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }
}

impl Implementation for SlowImplementation {
    fn invoke(&self, call: Invocation) -> BoxFuture<'_, Result<OperationOutput>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _guard = self.probe.enter();
            self.store.mark(format!("start:{}", call.context));
            tokio::time::sleep(self.delay).await;
            self.store.mark(format!("end:{}", call.context));
            Ok(OperationOutput::NoOutput)
        })
    }

    fn locks(&self) -> Vec<String> {
        self.lock_keys.clone()
    }
}

/// Fails the first `failures` calls, then returns `output`.
pub struct FlakyImplementation {
    failures: AtomicUsize,
    pub calls: Arc<AtomicUsize>,
    output: OperationOutput,
}

impl FlakyImplementation {
    pub fn new(failures: usize, output: OperationOutput) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            calls: Arc::new(AtomicUsize::new(0)),
            output,
        }
    }

    /// Never succeeds.
    pub fn always_failing() -> Self {
        Self::new(usize::MAX, OperationOutput::NoOutput)
    }
}

impl Implementation for FlakyImplementation {
    fn invoke(&self, call: Invocation) -> BoxFuture<'_, Result<OperationOutput>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                if remaining != usize::MAX {
                    self.failures.fetch_sub(1, Ordering::SeqCst);
                }
                return Err(WeftError::implementation(
                    call.operation.name.clone(),
                    &call.context,
                    "injected failure",
                ));
            }
            Ok(self.output.clone())
        })
    }
}

/// Records every lifecycle hook and invocation in order.
#[derive(Default)]
pub struct LifecycleLog {
    events: Mutex<Vec<String>>,
}

impl LifecycleLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

/// Implementation whose shared scope is a counter of invocations across
/// contexts and whose per-context scope is the context name.
pub struct LifecycleImplementation {
    pub name: String,
    pub log: Arc<LifecycleLog>,
}

impl LifecycleImplementation {
    pub fn new(name: &str, log: Arc<LifecycleLog>) -> Self {
        Self {
            name: name.to_string(),
            log,
        }
    }
}

impl Implementation for LifecycleImplementation {
    fn invoke(&self, call: Invocation) -> BoxFuture<'_, Result<OperationOutput>> {
        Box::pin(async move {
            let shared = call
                .shared::<AtomicUsize>()
                .map(|c| c.fetch_add(1, Ordering::SeqCst) + 1)
                .unwrap_or(0);
            let local = call.local::<String>().cloned().unwrap_or_default();
            self.log.push(format!("invoke:{}:{}", self.name, local));
            Ok(OperationOutput::single("seen", Value::from(shared as u64)))
        })
    }

    fn open(&self) -> BoxFuture<'_, Result<Option<Scope>>> {
        Box::pin(async move {
            self.log.push(format!("open:{}", self.name));
            let scope: Scope = Arc::new(AtomicUsize::new(0));
            Ok(Some(scope))
        })
    }

    fn close(&self, scope: Option<Scope>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let used = scope
                .as_ref()
                .and_then(|s| s.downcast_ref::<AtomicUsize>())
                .map(|c| c.load(Ordering::SeqCst))
                .unwrap_or(0);
            self.log.push(format!("close:{}:{}", self.name, used));
            Ok(())
        })
    }

    fn open_context(&self, context: ContextId) -> BoxFuture<'_, Result<Option<Scope>>> {
        Box::pin(async move {
            self.log.push(format!("open_context:{}:{}", self.name, context));
            let scope: Scope = Arc::new(context.to_string());
            Ok(Some(scope))
        })
    }

    fn close_context(
        &self,
        context: ContextId,
        _scope: Option<Scope>,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.log.push(format!("close_context:{}:{}", self.name, context));
            Ok(())
        })
    }
}
