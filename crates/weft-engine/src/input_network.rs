use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::trace;

use weft_core::definition::DefinitionRegistry;
use weft_core::error::Result;
use weft_core::traits::InputView;
use weft_core::types::{ContextId, Input, InputUid};

#[derive(Default)]
struct ContextState {
    by_definition: HashMap<String, Vec<Arc<Input>>>,
    by_uid: HashMap<InputUid, Arc<Input>>,
    /// Bumped on every add; lets the scheduler detect inputs that arrived
    /// while it was computing readiness.
    generation: u64,
}

/// One context's partition of the network.
struct ContextInputs {
    state: RwLock<ContextState>,
    notify: Arc<Notify>,
}

impl ContextInputs {
    fn new() -> Self {
        Self {
            state: RwLock::new(ContextState::default()),
            notify: Arc::new(Notify::new()),
        }
    }

    fn insert(&self, input: Arc<Input>) {
        let mut state = self.state.write();
        state
            .by_definition
            .entry(input.definition.name.clone())
            .or_default()
            .push(input.clone());
        state.by_uid.insert(input.uid.clone(), input);
        state.generation += 1;
    }

    fn inputs(&self, definition: &str) -> Vec<Arc<Input>> {
        self.state
            .read()
            .by_definition
            .get(definition)
            .cloned()
            .unwrap_or_default()
    }

    fn latest(&self, definition: &str) -> Option<Arc<Input>> {
        self.state
            .read()
            .by_definition
            .get(definition)
            .and_then(|v| v.last().cloned())
    }

    fn get(&self, uid: &InputUid) -> Option<Arc<Input>> {
        self.state.read().by_uid.get(uid).cloned()
    }

    fn definitions(&self) -> BTreeSet<String> {
        self.state.read().by_definition.keys().cloned().collect()
    }

    fn ancestors(&self, uid: &InputUid) -> Vec<Arc<Input>> {
        let state = self.state.read();
        let mut out = Vec::new();
        let mut seen: HashSet<InputUid> = HashSet::new();
        let mut frontier: VecDeque<InputUid> = state
            .by_uid
            .get(uid)
            .map(|i| i.parents.iter().cloned().collect())
            .unwrap_or_default();
        while let Some(next) = frontier.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(parent) = state.by_uid.get(&next) {
                frontier.extend(parent.parents.iter().cloned());
                out.push(parent.clone());
            }
        }
        out
    }
}

/// Per-context store of every Input seen during a run.
///
/// Inputs are append-only. The "current" value of a definition is the most
/// recently added Input for it; older ones stay for provenance. Every add
/// wakes the context's scheduler through its [`Notify`].
pub struct InputNetwork {
    registry: Arc<DefinitionRegistry>,
    validate_primitives: bool,
    contexts: RwLock<HashMap<ContextId, Arc<ContextInputs>>>,
}

impl InputNetwork {
    pub fn new(registry: Arc<DefinitionRegistry>) -> Self {
        Self {
            registry,
            validate_primitives: true,
            contexts: RwLock::new(HashMap::new()),
        }
    }

    /// Toggle primitive checks on add.
    pub fn with_primitive_checks(mut self, enabled: bool) -> Self {
        self.validate_primitives = enabled;
        self
    }

    pub fn registry(&self) -> &Arc<DefinitionRegistry> {
        &self.registry
    }

    fn entry(&self, context: &ContextId) -> Arc<ContextInputs> {
        if let Some(existing) = self.contexts.read().get(context) {
            return existing.clone();
        }
        self.contexts
            .write()
            .entry(context.clone())
            .or_insert_with(|| Arc::new(ContextInputs::new()))
            .clone()
    }

    fn existing(&self, context: &ContextId) -> Option<Arc<ContextInputs>> {
        self.contexts.read().get(context).cloned()
    }

    /// Create an empty partition for `context`. Idempotent.
    pub fn create_context(&self, context: &ContextId) {
        self.entry(context);
    }

    pub fn contains_context(&self, context: &ContextId) -> bool {
        self.contexts.read().contains_key(context)
    }

    pub fn contexts(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = self.contexts.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolve an Input against the registry: its definition must be known
    /// and, when checks are on, its value must fit the primitive. The
    /// registered definition replaces the one the Input carried.
    fn admit(&self, mut input: Input) -> Result<Input> {
        let definition = self.registry.require(&input.definition.name)?;
        if self.validate_primitives {
            definition.check(&input.value)?;
        }
        input.definition = definition;
        Ok(input)
    }

    /// Add one Input to a context and wake its scheduler.
    pub fn add(&self, context: &ContextId, input: Input) -> Result<Arc<Input>> {
        let input = Arc::new(self.admit(input)?);
        let entry = self.entry(context);
        entry.insert(input.clone());
        trace!(
            context = %context,
            definition = %input.definition.name,
            uid = %input.uid,
            "Input added"
        );
        entry.notify.notify_one();
        Ok(input)
    }

    /// Add several Inputs. Nothing is added unless all of them are valid.
    pub fn add_all(
        &self,
        context: &ContextId,
        inputs: impl IntoIterator<Item = Input>,
    ) -> Result<Vec<Arc<Input>>> {
        let admitted = inputs
            .into_iter()
            .map(|i| self.admit(i).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        if admitted.is_empty() {
            return Ok(admitted);
        }
        let entry = self.entry(context);
        for input in &admitted {
            entry.insert(input.clone());
        }
        entry.notify.notify_one();
        Ok(admitted)
    }

    /// Inputs of a definition in a context, oldest first.
    pub fn inputs(&self, context: &ContextId, definition: &str) -> Vec<Arc<Input>> {
        self.existing(context)
            .map(|c| c.inputs(definition))
            .unwrap_or_default()
    }

    pub fn latest(&self, context: &ContextId, definition: &str) -> Option<Arc<Input>> {
        self.existing(context).and_then(|c| c.latest(definition))
    }

    /// Definitions with at least one Input in a context.
    pub fn definitions(&self, context: &ContextId) -> BTreeSet<String> {
        self.existing(context)
            .map(|c| c.definitions())
            .unwrap_or_default()
    }

    pub fn get(&self, context: &ContextId, uid: &InputUid) -> Option<Arc<Input>> {
        self.existing(context).and_then(|c| c.get(uid))
    }

    /// Every transitive parent of an Input, nearest first.
    pub fn ancestors(&self, context: &ContextId, uid: &InputUid) -> Vec<Arc<Input>> {
        self.existing(context)
            .map(|c| c.ancestors(uid))
            .unwrap_or_default()
    }

    /// Number of adds seen by a context so far.
    pub fn generation(&self, context: &ContextId) -> u64 {
        self.existing(context)
            .map(|c| c.state.read().generation)
            .unwrap_or(0)
    }

    pub fn len(&self, context: &ContextId) -> usize {
        self.existing(context)
            .map(|c| c.state.read().by_uid.len())
            .unwrap_or(0)
    }

    /// Woken whenever an Input is added to `context`.
    pub fn notifier(&self, context: &ContextId) -> Arc<Notify> {
        self.entry(context).notify.clone()
    }

    /// Read-only view of one context, handed to implementations.
    pub fn view(&self, context: &ContextId) -> Arc<dyn InputView> {
        Arc::new(ContextView {
            inputs: self.entry(context),
        })
    }
}

/// [`InputView`] over one context partition.
pub struct ContextView {
    inputs: Arc<ContextInputs>,
}

impl InputView for ContextView {
    fn inputs(&self, definition: &str) -> Vec<Arc<Input>> {
        self.inputs.inputs(definition)
    }

    fn latest(&self, definition: &str) -> Option<Arc<Input>> {
        self.inputs.latest(definition)
    }

    fn get(&self, uid: &InputUid) -> Option<Arc<Input>> {
        self.inputs.get(uid)
    }

    fn definitions(&self) -> BTreeSet<String> {
        self.inputs.definitions()
    }

    fn ancestors(&self, uid: &InputUid) -> Vec<Arc<Input>> {
        self.inputs.ancestors(uid)
    }
}
