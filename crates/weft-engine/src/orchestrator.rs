use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::config::{ErrorPolicy, OrchestratorConfig};
use weft_core::error::{Result, WeftError};
use weft_core::event::{ContextStatus, EventBus, RunEvent};
use weft_core::graph::SeedInput;
use weft_core::traits::InputView;
use weft_core::types::{
    ContextId, Input, Operation, OperationOutput, Origin, ParameterSet, Stage,
};

use crate::dataflow::DataFlow;
use crate::implementation_network::ImplementationNetwork;
use crate::input_network::InputNetwork;
use crate::lock_network::{LockKey, LockNetwork};
use crate::operation_network::{OperationNetwork, ReadyOperation};
use crate::redundancy::{Fingerprint, RedundancyChecker};

/// Final result of one context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextOutcome {
    pub context: ContextId,
    #[serde(flatten)]
    pub status: ContextStatus,
    /// Requested output values, empty unless the context completed.
    pub outputs: Map<String, Value>,
    /// Invocations dispatched for this context.
    pub invocations: usize,
}

impl ContextOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Where a context is in its run. Logged on every transition.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Seeded,
    Scheduling,
    Dispatching,
    Merging,
    Quiescent,
    Collected,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Seeded => "seeded",
            Phase::Scheduling => "scheduling",
            Phase::Dispatching => "dispatching",
            Phase::Merging => "merging",
            Phase::Quiescent => "quiescent",
            Phase::Collected => "collected",
        }
    }
}

fn enter(context: &ContextId, phase: Phase) {
    debug!(context = %context, phase = phase.as_str(), "Context phase");
}

enum Ending {
    Collected(Map<String, Value>),
    Failed(WeftError),
    Cancelled,
}

struct ContextRun {
    outcome: ContextOutcome,
    error: Option<WeftError>,
}

/// One finished invocation.
struct Completed {
    operation: Arc<Operation>,
    parameters: ParameterSet,
    elapsed_ms: u64,
    result: Result<OperationOutput>,
}

/// Everything one run shares across its contexts.
struct RunState {
    config: OrchestratorConfig,
    flow: Arc<DataFlow>,
    inputs: Arc<InputNetwork>,
    operations: OperationNetwork,
    redundancy: RedundancyChecker,
    locks: LockNetwork,
    implementations: ImplementationNetwork,
    workers: Arc<Semaphore>,
    context_slots: Option<Arc<Semaphore>>,
    events: Arc<EventBus>,
    cancel: CancellationToken,
    /// Contexts that stopped accepting Inputs.
    closed: Mutex<HashSet<ContextId>>,
}

impl RunState {
    /// Close a context if nothing was added since `generation`. Injection
    /// takes the same lock, so an Input is either seen here or refused.
    fn close_if_idle(&self, context: &ContextId, generation: u64) -> bool {
        let mut closed = self.closed.lock();
        if self.inputs.generation(context) != generation {
            return false;
        }
        closed.insert(context.clone());
        true
    }

    fn retries_for(&self, operation: &Operation) -> u32 {
        operation.retry.unwrap_or(self.config.retries)
    }

    /// Declared resource keys plus every lockable Input the parameter set
    /// binds, directly or through its ancestors.
    fn lock_keys(&self, ready: &ReadyOperation) -> Vec<LockKey> {
        let mut keys: Vec<LockKey> = self
            .implementations
            .locks(&ready.operation.name)
            .into_iter()
            .map(LockKey::Resource)
            .collect();
        for input in ready.parameters.inputs() {
            if input.definition.lock {
                keys.push(LockKey::Input(input.uid.clone()));
            }
            for parent in self.inputs.ancestors(&ready.parameters.context, &input.uid) {
                if parent.definition.lock {
                    keys.push(LockKey::Input(parent.uid.clone()));
                }
            }
        }
        keys
    }

    /// Spawn every ready unit of work not already recorded. The fingerprint
    /// is recorded here, before the invocation starts.
    fn schedule(
        self: &Arc<Self>,
        context: &ContextId,
        ready: Vec<ReadyOperation>,
        view: &Arc<dyn InputView>,
        in_flight: &mut JoinSet<Completed>,
    ) -> usize {
        let mut dispatched = 0;
        for item in ready {
            let fingerprint = Fingerprint::compute(&item.parameters, view.as_ref());
            if !self.redundancy.record_ran(context, fingerprint.clone()) {
                continue;
            }
            if dispatched == 0 {
                enter(context, Phase::Dispatching);
            }
            debug!(
                context = %context,
                operation = %item.operation.name,
                fingerprint = fingerprint.short(),
                "Dispatching operation"
            );
            in_flight.spawn(self.clone().dispatch(item, fingerprint, view.clone()));
            dispatched += 1;
        }
        dispatched
    }

    async fn dispatch(
        self: Arc<Self>,
        ready: ReadyOperation,
        fingerprint: Fingerprint,
        view: Arc<dyn InputView>,
    ) -> Completed {
        let context = ready.parameters.context.clone();
        let holder = format!("{}:{}", ready.operation.name, fingerprint.short());
        // Locks first so invocations blocked on a resource do not hold a
        // worker slot.
        let locks = self.locks.acquire(&holder, self.lock_keys(&ready)).await;
        let permit = self.workers.clone().acquire_owned().await.ok();

        self.events.publish(RunEvent::OperationDispatched {
            context: context.clone(),
            operation: ready.operation.name.clone(),
            fingerprint: fingerprint.to_string(),
        });
        let started = Instant::now();
        let result = self
            .implementations
            .invoke(
                ready.operation.clone(),
                ready.parameters.clone(),
                view,
                self.retries_for(&ready.operation),
            )
            .await;
        drop(permit);
        self.locks.release(locks);

        Completed {
            operation: ready.operation,
            parameters: ready.parameters,
            elapsed_ms: started.elapsed().as_millis() as u64,
            result,
        }
    }

    /// Publish the outcome of a finished invocation and unwrap its output.
    fn settle(
        &self,
        context: &ContextId,
        joined: std::result::Result<Completed, JoinError>,
    ) -> Result<(Completed, OperationOutput)> {
        let mut done = joined.map_err(|e| {
            WeftError::implementation("<task>", context, format!("invocation task ended: {}", e))
        })?;
        let result = std::mem::replace(&mut done.result, Ok(OperationOutput::NoOutput));
        match result {
            Ok(output) => {
                let outputs = match &output {
                    OperationOutput::Outputs(map) => map.len(),
                    OperationOutput::NoOutput => 0,
                };
                self.events.publish(RunEvent::OperationCompleted {
                    context: context.clone(),
                    operation: done.operation.name.clone(),
                    outputs,
                    elapsed_ms: done.elapsed_ms,
                });
                Ok((done, output))
            }
            Err(e) => {
                self.events.publish(RunEvent::OperationFailed {
                    context: context.clone(),
                    operation: done.operation.name.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Turn an invocation's outputs into Inputs of its context.
    fn merge(&self, context: &ContextId, done: &Completed, output: OperationOutput) -> Result<()> {
        let OperationOutput::Outputs(values) = output else {
            return Ok(());
        };
        enter(context, Phase::Merging);
        let operation = &done.operation;
        let parents = done.parameters.uids();
        let mut produced = Vec::new();
        for (name, value) in values {
            let definition = operation
                .outputs
                .get(&name)
                .cloned()
                .ok_or_else(|| WeftError::UnknownOutput {
                    operation: operation.name.clone(),
                    output: name.clone(),
                })?;
            let origin = Origin {
                operation: operation.name.clone(),
                output: name.clone(),
            };
            match value {
                Value::Array(items) if operation.expand_outputs.contains(&name) => {
                    for item in items {
                        produced.push(Input::derived(
                            definition.clone(),
                            item,
                            parents.clone(),
                            origin.clone(),
                        ));
                    }
                }
                value => produced.push(Input::derived(definition, value, parents.clone(), origin)),
            }
        }
        self.inputs.add_all(context, produced)?;
        Ok(())
    }

    /// Run a cleanup or output stage once and wait for it. Results are
    /// keyed by operation name; an operation with a single output reports
    /// that output's value, otherwise its whole output mapping.
    async fn run_stage(
        self: &Arc<Self>,
        context: &ContextId,
        stage: Stage,
        view: &Arc<dyn InputView>,
    ) -> (usize, Result<Map<String, Value>>) {
        let ready = self.operations.operations_for_stage(context, view.as_ref(), stage);
        let mut in_flight = JoinSet::new();
        let dispatched = self.schedule(context, ready, view, &mut in_flight);
        let mut outputs = Map::new();
        let mut first_error = None;
        while let Some(joined) = in_flight.join_next().await {
            match self.settle(context, joined) {
                Ok((done, OperationOutput::Outputs(values))) => {
                    let undeclared = values
                        .keys()
                        .find(|n| !done.operation.outputs.contains_key(*n));
                    if let Some(name) = undeclared {
                        first_error.get_or_insert(WeftError::UnknownOutput {
                            operation: done.operation.name.clone(),
                            output: name.clone(),
                        });
                        continue;
                    }
                    let result = match (done.operation.outputs.len(), values.len()) {
                        (1, 1) => values.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null),
                        _ => Value::Object(values),
                    };
                    outputs.insert(done.operation.name.clone(), result);
                }
                Ok(_) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        let result = match first_error {
            Some(e) => Err(e),
            None => Ok(outputs),
        };
        (dispatched, result)
    }

    /// Drive one context from seeding to collection.
    async fn run_context(self: Arc<Self>, context: ContextId, seeds: Vec<Input>) -> ContextRun {
        let _slot = match &self.context_slots {
            Some(slots) => tokio::select! {
                permit = slots.clone().acquire_owned() => permit.ok(),
                _ = self.cancel.cancelled() => {
                    return self.finish(&context, Ending::Cancelled, 0).await;
                }
            },
            None => None,
        };

        match self.inputs.add_all(&context, seeds) {
            Ok(added) => {
                self.events.publish(RunEvent::ContextSeeded {
                    context: context.clone(),
                    inputs: added.len(),
                });
                enter(&context, Phase::Seeded);
            }
            Err(e) => return self.finish(&context, Ending::Failed(e), 0).await,
        }

        let view = self.inputs.view(&context);
        let notify = self.inputs.notifier(&context);
        let mut in_flight: JoinSet<Completed> = JoinSet::new();
        let mut invocations = 0usize;
        let mut failure: Option<WeftError> = None;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            enter(&context, Phase::Scheduling);
            let generation = self.inputs.generation(&context);
            let ready = self.operations.operations_for(&context, view.as_ref());
            invocations += self.schedule(&context, ready, &view, &mut in_flight);

            if in_flight.is_empty() {
                if self.close_if_idle(&context, generation) {
                    break;
                }
                continue;
            }

            tokio::select! {
                Some(joined) = in_flight.join_next() => {
                    let merged = self
                        .settle(&context, joined)
                        .and_then(|(done, output)| self.merge(&context, &done, output));
                    if let Err(e) = merged {
                        failure = Some(e);
                        break;
                    }
                }
                _ = notify.notified() => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        if self.cancel.is_cancelled() && failure.is_none() {
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
            return self.finish(&context, Ending::Cancelled, invocations).await;
        }

        if let Some(e) = failure {
            // Siblings already running are allowed to finish; their
            // results are discarded.
            while let Some(joined) = in_flight.join_next().await {
                let _ = self.settle(&context, joined);
            }
            return self.finish(&context, Ending::Failed(e), invocations).await;
        }

        enter(&context, Phase::Quiescent);
        self.events.publish(RunEvent::ContextQuiescent {
            context: context.clone(),
            invocations,
        });

        let (ran, cleanup) = self.run_stage(&context, Stage::Cleanup, &view).await;
        invocations += ran;
        if let Err(e) = cleanup {
            return self.finish(&context, Ending::Failed(e), invocations).await;
        }

        let (ran, staged) = self.run_stage(&context, Stage::Output, &view).await;
        invocations += ran;
        let staged = match staged {
            Ok(staged) => staged,
            Err(e) => return self.finish(&context, Ending::Failed(e), invocations).await,
        };

        let mut outputs = Map::new();
        for name in self.flow.output_spec() {
            if let Some(input) = view.latest(name) {
                outputs.insert(name.clone(), input.value.clone());
            }
        }
        // A lone output operation reports its result mapping directly.
        let lone = staged.len() == 1;
        for (operation, result) in staged {
            match result {
                Value::Object(result) if lone => outputs.extend(result),
                result => {
                    outputs.insert(operation, result);
                }
            }
        }
        enter(&context, Phase::Collected);
        self.finish(&context, Ending::Collected(outputs), invocations)
            .await
    }

    async fn finish(&self, context: &ContextId, ending: Ending, invocations: usize) -> ContextRun {
        self.closed.lock().insert(context.clone());
        if let Err(e) = self.implementations.close_context(context).await {
            warn!(context = %context, error = %e, "Failed to close context scopes");
        }
        let (status, outputs, error) = match ending {
            Ending::Collected(outputs) => (ContextStatus::Completed, outputs, None),
            Ending::Failed(e) => (
                ContextStatus::Failed {
                    error: e.to_string(),
                },
                Map::new(),
                Some(e),
            ),
            Ending::Cancelled => (ContextStatus::Cancelled, Map::new(), None),
        };
        match &status {
            ContextStatus::Failed { error } => {
                error!(context = %context, invocations, error = %error, "Context failed")
            }
            _ => info!(context = %context, invocations, status = ?status, "Context finished"),
        }
        self.events
            .publish(RunEvent::context_finished(context.clone(), status.clone()));
        ContextRun {
            outcome: ContextOutcome {
                context: context.clone(),
                status,
                outputs,
                invocations,
            },
            error,
        }
    }
}

/// Run every context, forward outcomes, then tear down implementation
/// scopes. Under the fatal policy the first failure cancels the rest and
/// is sent last, after teardown.
async fn drive(
    state: Arc<RunState>,
    contexts: Vec<(ContextId, Vec<Input>)>,
    tx: mpsc::Sender<Result<ContextOutcome>>,
) {
    let mut running: JoinSet<ContextRun> = JoinSet::new();
    for (context, seeds) in contexts {
        running.spawn(state.clone().run_context(context, seeds));
    }

    let mut fatal: Option<WeftError> = None;
    while let Some(joined) = running.join_next().await {
        let ContextRun { outcome, error } = match joined {
            Ok(run) => run,
            Err(e) => {
                error!(error = %e, "Context task ended abnormally");
                continue;
            }
        };
        if fatal.is_some() {
            continue;
        }
        match error {
            Some(e) if state.config.error_policy == ErrorPolicy::Fatal => {
                error!(context = %outcome.context, error = %e, "Fatal context failure, cancelling run");
                state.cancel.cancel();
                fatal = Some(e);
            }
            _ => {
                let _ = tx.send(Ok(outcome)).await;
            }
        }
    }

    if let Err(e) = state.implementations.close().await {
        warn!(error = %e, "Failed to close implementation scopes");
    }
    if let Some(e) = fatal {
        let _ = tx.send(Err(e)).await;
    }
}

/// A live run: a stream of per-context outcomes plus control over the run.
///
/// Dropping the handle cancels the run.
pub struct RunHandle {
    outcomes: BoxStream<'static, Result<ContextOutcome>>,
    state: Arc<RunState>,
    contexts: HashSet<ContextId>,
}

impl RunHandle {
    /// Add an Input to a running context. The context reschedules on it.
    /// A context that already went quiescent or finished refuses it.
    pub fn inject(&self, context: &ContextId, definition: &str, value: Value) -> Result<Arc<Input>> {
        if !self.contexts.contains(context) {
            return Err(WeftError::Graph(format!(
                "context '{}' is not part of this run",
                context
            )));
        }
        let definition = self.state.flow.definitions().require(definition)?;
        let closed = self.state.closed.lock();
        if closed.contains(context) {
            return Err(WeftError::ContextClosed(context.to_string()));
        }
        self.state.inputs.add(context, Input::seed(definition, value))
    }

    /// Forget one dispatched unit of work so a running context may dispatch
    /// it again. `fingerprint` is the one carried by
    /// [`RunEvent::OperationDispatched`].
    pub fn forget(&self, context: &ContextId, fingerprint: &str) -> bool {
        let forgotten = self
            .state
            .redundancy
            .forget(context, &Fingerprint::from(fingerprint));
        if forgotten {
            self.state.inputs.notifier(context).notify_one();
        }
        forgotten
    }

    /// Stop scheduling new work. Running contexts report `Cancelled`.
    pub fn cancel(&self) {
        self.state.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.state.cancel.clone()
    }

    pub fn inputs(&self) -> &Arc<InputNetwork> {
        &self.state.inputs
    }

    /// Invocations recorded so far for a context.
    pub fn invocations(&self, context: &ContextId) -> usize {
        self.state.redundancy.count(context)
    }
}

impl Stream for RunHandle {
    type Item = Result<ContextOutcome>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.outcomes.poll_next_unpin(cx)
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.state.cancel.cancel();
    }
}

/// Drives flows to a fixpoint for many contexts at once.
pub struct Orchestrator {
    config: OrchestratorConfig,
    event_bus: Arc<EventBus>,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            config,
            event_bus: Arc::new(EventBus::default()),
            workers,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.event_bus.subscribe()
    }

    /// Cancelling this token stops every run started by this orchestrator.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start a run. Each context gets the flow-wide seeds, the flow's seeds
    /// for it, then the seeds given here. Contexts listed twice are merged.
    ///
    /// Validation errors (unknown definitions, lock ordering) are returned
    /// before anything runs. Must be called inside a tokio runtime.
    pub fn run(
        &self,
        flow: DataFlow,
        contexts: impl IntoIterator<Item = (ContextId, Vec<SeedInput>)>,
    ) -> Result<RunHandle> {
        flow.validate()?;
        let locks = LockNetwork::new(self.config.lock_order.clone());
        let lock_keys = flow.lock_keys();
        locks.validate(lock_keys.iter().map(|k| k.as_str()))?;

        let mut order: Vec<ContextId> = Vec::new();
        let mut extra: HashMap<ContextId, Vec<SeedInput>> = HashMap::new();
        for (context, seeds) in contexts {
            if !extra.contains_key(&context) {
                order.push(context.clone());
            }
            extra.entry(context).or_default().extend(seeds);
        }
        let mut seeded = Vec::with_capacity(order.len());
        for context in order {
            let given = extra.remove(&context).unwrap_or_default();
            let inputs = flow.seed_inputs(&flow.seeds_for(&context, &given))?;
            seeded.push((context, inputs));
        }

        let flow = Arc::new(flow);
        let inputs = Arc::new(
            InputNetwork::new(flow.definitions().clone())
                .with_primitive_checks(self.config.validate_primitives),
        );
        for (context, _) in &seeded {
            inputs.create_context(context);
        }
        let state = Arc::new(RunState {
            operations: OperationNetwork::new(flow.operations(), self.config.binding),
            implementations: ImplementationNetwork::new(flow.implementations()),
            redundancy: RedundancyChecker::new(),
            locks,
            inputs,
            flow,
            workers: self.workers.clone(),
            context_slots: self.config.max_contexts.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            events: self.event_bus.clone(),
            cancel: self.cancel.child_token(),
            closed: Mutex::new(HashSet::new()),
            config: self.config.clone(),
        });

        info!(
            contexts = seeded.len(),
            operations = state.operations.operations().len(),
            "Starting run"
        );
        let contexts: HashSet<ContextId> = seeded.iter().map(|(c, _)| c.clone()).collect();
        let (tx, rx) = mpsc::channel(seeded.len().max(1));
        tokio::spawn(drive(state.clone(), seeded, tx));

        let outcomes = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(RunHandle {
            outcomes,
            state,
            contexts,
        })
    }

    /// Run to completion and collect every outcome, in completion order.
    pub async fn run_collect(
        &self,
        flow: DataFlow,
        contexts: impl IntoIterator<Item = (ContextId, Vec<SeedInput>)>,
    ) -> Result<Vec<ContextOutcome>> {
        let mut handle = self.run(flow, contexts)?;
        let mut outcomes = Vec::new();
        while let Some(outcome) = handle.next().await {
            outcomes.push(outcome?);
        }
        Ok(outcomes)
    }

    /// Run the contexts named by the flow's own seeds.
    pub async fn run_flow(&self, flow: DataFlow) -> Result<Vec<ContextOutcome>> {
        let contexts: Vec<(ContextId, Vec<SeedInput>)> = flow
            .seeded_contexts()
            .into_iter()
            .map(|(context, _)| (context, vec![]))
            .collect();
        self.run_collect(flow, contexts).await
    }

    /// Run a single ad hoc context. A cancelled run is an error.
    pub async fn run_single(
        &self,
        flow: DataFlow,
        context: ContextId,
        seeds: Vec<SeedInput>,
    ) -> Result<ContextOutcome> {
        let outcome = self
            .run_collect(flow, [(context.clone(), seeds)])
            .await?
            .pop()
            .ok_or_else(|| WeftError::Cancelled(context.to_string()))?;
        match outcome.status {
            ContextStatus::Cancelled => Err(WeftError::Cancelled(context.to_string())),
            _ => Ok(outcome),
        }
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(OrchestratorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use weft_core::config::BindingPolicy;
    use weft_core::traits::{Implementation, Invocation};
    use weft_core::types::{Definition, Primitive};
    use weft_ops::builtin::output::{associate_spec, get_single_spec};
    use weft_ops::builtin::{Associate, GetSingle};
    use weft_ops::{FnImplementation, RegisteredOperation};
    use weft_test_utils::{
        bool_def, int_def, str_def, FlakyImplementation, LifecycleImplementation, LifecycleLog,
        SlowImplementation,
    };

    fn entry(operation: Operation, implementation: impl Implementation) -> RegisteredOperation {
        RegisteredOperation {
            operation: Arc::new(operation),
            implementation: Arc::new(implementation),
        }
    }

    fn int(call: &Invocation, param: &str) -> i64 {
        call.value(param).and_then(|v| v.as_i64()).unwrap_or_default()
    }

    fn add() -> RegisteredOperation {
        entry(
            Operation::new("add")
                .input("a", int_def("a"))
                .input("b", int_def("b"))
                .output("sum", int_def("sum")),
            FnImplementation::new(|call| async move {
                let sum = int(&call, "a") + int(&call, "b");
                Ok(OperationOutput::single("sum", json!(sum)))
            }),
        )
    }

    fn seeds(pairs: &[(&str, Value)]) -> Vec<SeedInput> {
        pairs
            .iter()
            .map(|(name, value)| SeedInput::new(*name, value.clone()))
            .collect()
    }

    fn ctx(id: &str) -> ContextId {
        ContextId::from(id)
    }

    fn by_context(outcomes: Vec<ContextOutcome>) -> HashMap<String, ContextOutcome> {
        outcomes
            .into_iter()
            .map(|o| (o.context.to_string(), o))
            .collect()
    }

    #[tokio::test]
    async fn test_add_collects_sum() {
        let flow = DataFlow::new(vec![add()]).unwrap().with_output_spec(["sum"]);
        let outcome = Orchestrator::default()
            .run_single(flow, ctx("c"), seeds(&[("a", json!(40)), ("b", json!(2))]))
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(Value::Object(outcome.outputs), json!({"sum": 42}));
        assert_eq!(outcome.invocations, 1);
    }

    #[tokio::test]
    async fn test_self_feeding_operation_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let double = entry(
            Operation::new("double")
                .input("x", int_def("x"))
                .output("x", int_def("x")),
            FnImplementation::new(move |call| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(OperationOutput::single("x", json!(int(&call, "x") * 2))) }
            }),
        );
        let flow = DataFlow::new(vec![double]).unwrap().with_output_spec(["x"]);
        let outcome = Orchestrator::default()
            .run_single(flow, ctx("c"), seeds(&[("x", json!(1))]))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.outputs["x"], json!(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shared_resource_serializes_contexts() {
        let delay = Duration::from_millis(50);
        let slow = SlowImplementation::new(delay).with_locks(&["store"]);
        let (probe, store) = (slow.probe.clone(), slow.store.clone());
        let flow = DataFlow::new(vec![entry(
            Operation::new("write").input("item", int_def("item")),
            slow,
        )])
        .unwrap();

        let started = Instant::now();
        let outcomes = Orchestrator::default()
            .run_collect(
                flow,
                [
                    (ctx("c1"), seeds(&[("item", json!(1))])),
                    (ctx("c2"), seeds(&[("item", json!(2))])),
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(started.elapsed() >= delay * 2);
        assert_eq!(probe.peak(), 1);
        assert!(store.is_serialized());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lockable_definition_serializes_operations() {
        let delay = Duration::from_millis(30);
        let credit = SlowImplementation::new(delay);
        let mut debit = SlowImplementation::new(delay);
        debit.probe = credit.probe.clone();
        let probe = credit.probe.clone();
        let account = Definition::new("account", Primitive::Integer).with_lock();
        let flow = DataFlow::new(vec![
            entry(Operation::new("credit").input("account", account.clone()), credit),
            entry(Operation::new("debit").input("account", account), debit),
        ])
        .unwrap();

        let outcome = Orchestrator::default()
            .run_single(flow, ctx("c"), seeds(&[("account", json!(7))]))
            .await
            .unwrap();
        assert_eq!(outcome.invocations, 2);
        assert_eq!(probe.peak(), 1);
    }

    #[tokio::test]
    async fn test_contexts_isolated() {
        let flow = DataFlow::new(vec![add()]).unwrap().with_output_spec(["sum"]);
        let outcomes = Orchestrator::default()
            .run_collect(
                flow,
                [
                    (ctx("c1"), seeds(&[("a", json!(1)), ("b", json!(2))])),
                    (ctx("c2"), seeds(&[("a", json!(10)), ("b", json!(20))])),
                ],
            )
            .await
            .unwrap();
        let outcomes = by_context(outcomes);
        assert_eq!(outcomes["c1"].outputs["sum"], json!(3));
        assert_eq!(outcomes["c2"].outputs["sum"], json!(30));
    }

    #[tokio::test]
    async fn test_condition_gates_operation() {
        let emit = entry(
            Operation::new("emit")
                .input("a", int_def("a"))
                .condition(bool_def("go"))
                .output("out", int_def("out")),
            FnImplementation::new(|call| async move {
                Ok(OperationOutput::single("out", json!(int(&call, "a"))))
            }),
        );
        let flow = DataFlow::new(vec![emit]).unwrap().with_output_spec(["out"]);
        let outcomes = Orchestrator::default()
            .run_collect(
                flow,
                [
                    (ctx("off"), seeds(&[("a", json!(1)), ("go", json!(false))])),
                    (ctx("on"), seeds(&[("a", json!(1)), ("go", json!(true))])),
                ],
            )
            .await
            .unwrap();
        let outcomes = by_context(outcomes);
        assert!(outcomes["off"].outputs.is_empty());
        assert_eq!(outcomes["off"].invocations, 0);
        assert_eq!(outcomes["on"].outputs["out"], json!(1));
    }

    fn failing_flow() -> DataFlow {
        DataFlow::new(vec![
            add(),
            entry(
                Operation::new("fail").input("bad", int_def("bad")),
                FlakyImplementation::always_failing(),
            ),
        ])
        .unwrap()
        .with_output_spec(["sum"])
    }

    #[tokio::test]
    async fn test_failure_isolated_to_context() {
        let outcomes = Orchestrator::default()
            .run_collect(
                failing_flow(),
                [
                    (ctx("bad"), seeds(&[("bad", json!(1))])),
                    (ctx("good"), seeds(&[("a", json!(1)), ("b", json!(1))])),
                ],
            )
            .await
            .unwrap();
        let outcomes = by_context(outcomes);
        assert!(matches!(
            outcomes["bad"].status,
            ContextStatus::Failed { ref error } if error.contains("fail")
        ));
        assert!(outcomes["bad"].outputs.is_empty());
        assert!(outcomes["good"].is_success());
        assert_eq!(outcomes["good"].outputs["sum"], json!(2));
    }

    #[tokio::test]
    async fn test_fatal_policy_fails_run() {
        let config = OrchestratorConfig {
            error_policy: ErrorPolicy::Fatal,
            ..Default::default()
        };
        let result = Orchestrator::new(config)
            .run_collect(
                failing_flow(),
                [
                    (ctx("bad"), seeds(&[("bad", json!(1))])),
                    (ctx("good"), seeds(&[("a", json!(1)), ("b", json!(1))])),
                ],
            )
            .await;
        assert!(matches!(result, Err(WeftError::Implementation { .. })));
    }

    #[tokio::test]
    async fn test_unknown_output_fails_context() {
        let flow = DataFlow::new(vec![entry(
            Operation::new("liar").input("a", int_def("a")),
            FnImplementation::new(|_| async { Ok(OperationOutput::single("bogus", json!(1))) }),
        )])
        .unwrap();
        let outcome = Orchestrator::default()
            .run_single(flow, ctx("c"), seeds(&[("a", json!(1))]))
            .await
            .unwrap();
        assert!(matches!(outcome.status, ContextStatus::Failed { ref error } if error.contains("bogus")));
    }

    #[tokio::test]
    async fn test_cancel_stops_running_context() {
        let slow = SlowImplementation::new(Duration::from_secs(30));
        let flow = DataFlow::new(vec![entry(
            Operation::new("wait").input("a", int_def("a")),
            slow,
        )])
        .unwrap();
        let orchestrator = Orchestrator::default();
        let mut handle = orchestrator
            .run(flow, [(ctx("c"), seeds(&[("a", json!(1))]))])
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome.status, ContextStatus::Cancelled);
        assert!(handle.next().await.is_none());
    }

    #[tokio::test]
    async fn test_operation_retry() {
        let flaky = FlakyImplementation::new(1, OperationOutput::single("out", json!(5)));
        let calls = flaky.calls.clone();
        let flow = DataFlow::new(vec![entry(
            Operation::new("flaky")
                .input("a", int_def("a"))
                .output("out", int_def("out"))
                .retry(1),
            flaky,
        )])
        .unwrap()
        .with_output_spec(["out"]);
        let outcome = Orchestrator::default()
            .run_single(flow, ctx("c"), seeds(&[("a", json!(1))]))
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.outputs["out"], json!(5));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_scopes_closed_after_run() {
        let log = LifecycleLog::new();
        let flow = DataFlow::new(vec![entry(
            Operation::new("probe")
                .input("a", int_def("a"))
                .output("seen", int_def("seen")),
            LifecycleImplementation::new("probe", log.clone()),
        )])
        .unwrap();
        Orchestrator::default()
            .run_collect(
                flow,
                [
                    (ctx("c1"), seeds(&[("a", json!(1))])),
                    (ctx("c2"), seeds(&[("a", json!(2))])),
                ],
            )
            .await
            .unwrap();

        let events = log.events();
        assert_eq!(log.count("open:probe"), 1);
        assert_eq!(log.count("open_context:probe"), 2);
        assert_eq!(log.count("close_context:probe"), 2);
        assert_eq!(events.last().map(String::as_str), Some("close:probe:2"));
    }

    #[tokio::test]
    async fn test_output_stage_operation() {
        let flow = DataFlow::new(vec![add(), entry(GetSingle::operation(), GetSingle)])
            .unwrap()
            .with_seed(vec![SeedInput::new(get_single_spec().name, json!(["sum"]))]);
        let outcome = Orchestrator::default()
            .run_single(flow, ctx("c"), seeds(&[("a", json!(40)), ("b", json!(2))]))
            .await
            .unwrap();
        assert_eq!(Value::Object(outcome.outputs), json!({"sum": 42}));
    }

    #[tokio::test]
    async fn test_several_output_operations_keyed_by_name() {
        let flow = DataFlow::new(vec![
            add(),
            entry(GetSingle::operation(), GetSingle),
            entry(Associate::operation(), Associate),
        ])
        .unwrap()
        .with_seed(vec![
            SeedInput::new(get_single_spec().name, json!(["sum"])),
            SeedInput::new(associate_spec().name, json!(["a", "sum"])),
        ]);
        let outcome = Orchestrator::default()
            .run_single(flow, ctx("c"), seeds(&[("a", json!(40)), ("b", json!(2))]))
            .await
            .unwrap();
        assert_eq!(
            Value::Object(outcome.outputs),
            json!({
                "get_single": {"sum": 42},
                "associate": {"sum": {"40": 42}},
            })
        );
    }

    #[tokio::test]
    async fn test_expanded_outputs_and_all_combinations() {
        let split = entry(
            Operation::new("split")
                .input("text", str_def("text"))
                .output("words", str_def("word"))
                .expand_output("words"),
            FnImplementation::new(|call| async move {
                let text = call.value("text").unwrap_or_default();
                let words: Vec<Value> = text
                    .as_str()
                    .unwrap_or_default()
                    .split_whitespace()
                    .map(|w| json!(w))
                    .collect();
                Ok(OperationOutput::single("words", Value::Array(words)))
            }),
        );
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let count = entry(
            Operation::new("count").input("word", str_def("word")),
            FnImplementation::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(OperationOutput::NoOutput) }
            }),
        );
        let config = OrchestratorConfig {
            binding: BindingPolicy::AllCombinations,
            ..Default::default()
        };
        let flow = DataFlow::new(vec![split, count]).unwrap();
        let mut handle = Orchestrator::new(config)
            .run(flow, [(ctx("c"), seeds(&[("text", json!("a b c"))]))])
            .unwrap();
        let outcome = handle.next().await.unwrap().unwrap();
        assert_eq!(outcome.invocations, 4);
        assert_eq!(handle.inputs().inputs(&ctx("c"), "word").len(), 3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_operation_without_inputs_starts_itself() {
        let flow = DataFlow::new(vec![entry(
            Operation::new("start").output("x", int_def("x")),
            FnImplementation::new(|_| async { Ok(OperationOutput::single("x", json!(7))) }),
        )])
        .unwrap()
        .with_output_spec(["x"]);
        let outcome = Orchestrator::default()
            .run_single(flow, ctx("c"), vec![])
            .await
            .unwrap();
        assert_eq!(outcome.outputs["x"], json!(7));
        assert_eq!(outcome.invocations, 1);
    }

    #[tokio::test]
    async fn test_inject_into_running_context() {
        let echo = entry(
            Operation::new("echo")
                .input("req", int_def("req"))
                .output("resp", int_def("resp")),
            FnImplementation::new(|call| async move {
                Ok(OperationOutput::single("resp", json!(int(&call, "req"))))
            }),
        );
        let hold = entry(
            Operation::new("hold").input("go", int_def("go")),
            SlowImplementation::new(Duration::from_millis(200)),
        );
        let flow = DataFlow::new(vec![echo, hold])
            .unwrap()
            .with_output_spec(["resp"]);
        let mut handle = Orchestrator::default()
            .run(flow, [(ctx("c"), seeds(&[("go", json!(1))]))])
            .unwrap();

        handle.inject(&ctx("c"), "req", json!(5)).unwrap();
        assert!(matches!(
            handle.inject(&ctx("elsewhere"), "req", json!(5)),
            Err(WeftError::Graph(_))
        ));
        assert!(matches!(
            handle.inject(&ctx("c"), "nope", json!(5)),
            Err(WeftError::UnknownDefinition(_))
        ));

        let outcome = handle.next().await.unwrap().unwrap();
        assert_eq!(outcome.outputs["resp"], json!(5));
    }

    #[tokio::test]
    async fn test_inject_into_finished_context_refused() {
        let flow = DataFlow::new(vec![add()]).unwrap().with_output_spec(["sum"]);
        let mut handle = Orchestrator::default()
            .run(flow, [(ctx("c"), seeds(&[("a", json!(1)), ("b", json!(2))]))])
            .unwrap();

        let outcome = handle.next().await.unwrap().unwrap();
        assert_eq!(outcome.status, ContextStatus::Completed);
        assert!(matches!(
            handle.inject(&ctx("c"), "a", json!(2)),
            Err(WeftError::ContextClosed(c)) if c == "c"
        ));
        assert_eq!(handle.inputs().inputs(&ctx("c"), "a").len(), 1);
    }

    #[tokio::test]
    async fn test_forget_forces_reevaluation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let tick = entry(
            Operation::new("tick").input("a", int_def("a")),
            FnImplementation::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(OperationOutput::NoOutput) }
            }),
        );
        let hold = entry(
            Operation::new("hold").input("go", int_def("go")),
            SlowImplementation::new(Duration::from_millis(300)),
        );
        let flow = DataFlow::new(vec![tick, hold]).unwrap();
        let orchestrator = Orchestrator::default();
        let mut rx = orchestrator.subscribe();
        let mut handle = orchestrator
            .run(flow, [(ctx("c"), seeds(&[("a", json!(1)), ("go", json!(1))]))])
            .unwrap();

        let fingerprint = loop {
            if let RunEvent::OperationDispatched {
                operation,
                fingerprint,
                ..
            } = rx.recv().await.unwrap()
            {
                if operation == "tick" {
                    break fingerprint;
                }
            }
        };
        assert!(handle.forget(&ctx("c"), &fingerprint));
        assert!(!handle.forget(&ctx("c"), "not-a-fingerprint"));

        let outcome = handle.next().await.unwrap().unwrap();
        assert!(outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_events_published() {
        let orchestrator = Orchestrator::default();
        let mut rx = orchestrator.subscribe();
        let flow = DataFlow::new(vec![add()]).unwrap();
        orchestrator
            .run_single(flow, ctx("c"), seeds(&[("a", json!(1)), ("b", json!(2))]))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.context(), &ctx("c"));
            let json = serde_json::to_value(&event).unwrap();
            kinds.push(json["event"].as_str().unwrap_or_default().to_string());
        }
        assert_eq!(kinds.first().map(String::as_str), Some("context_seeded"));
        assert!(kinds.iter().any(|k| k == "operation_dispatched"));
        assert!(kinds.iter().any(|k| k == "operation_completed"));
        assert!(kinds.iter().any(|k| k == "context_quiescent"));
        assert_eq!(kinds.last().map(String::as_str), Some("context_finished"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_max_contexts_bounds_running_contexts() {
        let slow = SlowImplementation::new(Duration::from_millis(20));
        let probe = slow.probe.clone();
        let flow = DataFlow::new(vec![entry(
            Operation::new("wait").input("a", int_def("a")),
            slow,
        )])
        .unwrap();
        let config = OrchestratorConfig {
            max_contexts: Some(1),
            ..Default::default()
        };
        let contexts = (0..3).map(|i| (ctx(&format!("c{}", i)), seeds(&[("a", json!(i))])));
        let outcomes = Orchestrator::new(config).run_collect(flow, contexts).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(probe.peak(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_budget_bounds_invocations() {
        let delay = Duration::from_millis(30);
        let slow = SlowImplementation::new(delay);
        let probe = slow.probe.clone();
        let flow = DataFlow::new(vec![entry(
            Operation::new("wait").input("a", int_def("a")),
            slow,
        )])
        .unwrap();
        let config = OrchestratorConfig {
            max_concurrency: 2,
            ..Default::default()
        };
        let contexts = (0..5).map(|i| (ctx(&format!("c{}", i)), seeds(&[("a", json!(i))])));

        let started = Instant::now();
        let outcomes = Orchestrator::new(config).run_collect(flow, contexts).await.unwrap();
        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|o| o.invocations == 1));
        assert!(probe.peak() <= 2);
        assert!(started.elapsed() >= delay * 3);
    }

    #[tokio::test]
    async fn test_lock_order_validated_before_run() {
        let config = OrchestratorConfig {
            lock_order: vec!["other".into()],
            ..Default::default()
        };
        let flow = DataFlow::new(vec![entry(
            Operation::new("write").input("a", int_def("a")),
            SlowImplementation::new(Duration::from_millis(1)).with_locks(&["store"]),
        )])
        .unwrap();
        assert!(matches!(
            Orchestrator::new(config).run(flow, [(ctx("c"), vec![])]),
            Err(WeftError::DeadlockRisk(_))
        ));
    }
}
