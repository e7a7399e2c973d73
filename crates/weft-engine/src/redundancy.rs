use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha384};

use weft_core::traits::InputView;
use weft_core::types::{ContextId, Input, ParameterSet};

/// Stable identity of one (context, operation, parameter set) unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash the context, operation name and, per parameter in name order,
    /// the uids of the bound Inputs.
    ///
    /// An Input the operation produced itself stands in for the
    /// same-definition Inputs it was produced from, so feeding an
    /// operation's output back into it does not count as new work.
    pub fn compute(parameters: &ParameterSet, view: &dyn InputView) -> Self {
        let mut hasher = Sha384::new();
        hasher.update(parameters.context.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(parameters.operation.as_bytes());
        for (param, binding) in &parameters.bindings {
            hasher.update([1u8]);
            hasher.update(param.as_bytes());
            for uid in lineage(&parameters.operation, &binding.inputs(), view) {
                hasher.update([2u8]);
                hasher.update(uid.as_bytes());
            }
        }
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest.iter() {
            let _ = write!(hex, "{:02x}", byte);
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters, for logs.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(hex: &str) -> Self {
        Self(hex.to_string())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Uids identifying `bound` for `operation`, in binding order.
fn lineage(operation: &str, bound: &[&Arc<Input>], view: &dyn InputView) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for input in bound {
        let mut stack: Vec<Arc<Input>> = vec![Arc::clone(input)];
        let mut resolved: Vec<String> = Vec::new();
        while let Some(current) = stack.pop() {
            let self_made = current
                .origin
                .as_ref()
                .is_some_and(|o| o.operation == operation);
            let sources: Vec<Arc<Input>> = if self_made {
                current
                    .parents
                    .iter()
                    .filter_map(|uid| view.get(uid))
                    .filter(|p| p.definition.name == current.definition.name)
                    .collect()
            } else {
                vec![]
            };
            if sources.is_empty() {
                resolved.push(current.uid.as_str().to_string());
            } else {
                stack.extend(sources.into_iter().rev());
            }
        }
        for uid in resolved {
            if !out.contains(&uid) {
                out.push(uid);
            }
        }
    }
    out
}

type Ran = Arc<Mutex<HashSet<Fingerprint>>>;

/// Per-context memo of dispatched work.
///
/// `record_ran` is the single check-and-insert point: a caller that gets
/// `true` back owns the unit of work; every later caller gets `false`.
#[derive(Default)]
pub struct RedundancyChecker {
    contexts: Mutex<HashMap<ContextId, Ran>>,
}

impl RedundancyChecker {
    pub fn new() -> Self {
        Self::default()
    }

    fn ran(&self, context: &ContextId) -> Ran {
        self.contexts
            .lock()
            .entry(context.clone())
            .or_default()
            .clone()
    }

    pub fn already_ran(&self, context: &ContextId, fingerprint: &Fingerprint) -> bool {
        self.ran(context).lock().contains(fingerprint)
    }

    /// Record a unit of work. Returns `false` if it was already recorded.
    pub fn record_ran(&self, context: &ContextId, fingerprint: Fingerprint) -> bool {
        self.ran(context).lock().insert(fingerprint)
    }

    /// Drop one fingerprint so the same work may be dispatched again.
    pub fn forget(&self, context: &ContextId, fingerprint: &Fingerprint) -> bool {
        self.ran(context).lock().remove(fingerprint)
    }

    pub fn clear_context(&self, context: &ContextId) {
        self.contexts.lock().remove(context);
    }

    pub fn count(&self, context: &ContextId) -> usize {
        self.contexts
            .lock()
            .get(context)
            .map(|r| r.lock().len())
            .unwrap_or(0)
    }
}
