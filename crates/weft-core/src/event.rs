use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::ContextId;

/// Terminal state of one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ContextStatus {
    Completed,
    Failed { error: String },
    Cancelled,
}

impl ContextStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ContextStatus::Completed)
    }
}

/// Something that happened during an orchestrator run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    ContextSeeded {
        context: ContextId,
        inputs: usize,
    },
    OperationDispatched {
        context: ContextId,
        operation: String,
        fingerprint: String,
    },
    OperationCompleted {
        context: ContextId,
        operation: String,
        outputs: usize,
        elapsed_ms: u64,
    },
    OperationFailed {
        context: ContextId,
        operation: String,
        error: String,
    },
    ContextQuiescent {
        context: ContextId,
        invocations: usize,
    },
    ContextFinished {
        context: ContextId,
        status: ContextStatus,
        at: DateTime<Utc>,
    },
}

impl RunEvent {
    /// A `ContextFinished` event stamped now.
    pub fn context_finished(context: ContextId, status: ContextStatus) -> Self {
        RunEvent::ContextFinished {
            context,
            status,
            at: Utc::now(),
        }
    }

    pub fn context(&self) -> &ContextId {
        match self {
            RunEvent::ContextSeeded { context, .. }
            | RunEvent::OperationDispatched { context, .. }
            | RunEvent::OperationCompleted { context, .. }
            | RunEvent::OperationFailed { context, .. }
            | RunEvent::ContextQuiescent { context, .. }
            | RunEvent::ContextFinished { context, .. } => context,
        }
    }
}

/// Fan-out of [`RunEvent`]s to any number of observers.
///
/// Observers that fall more than `capacity` events behind lose the oldest
/// ones and see `RecvError::Lagged`; the orchestrator never waits on them.
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Send to current observers. Returns how many received it; zero is
    /// normal when nobody is watching the run.
    pub fn publish(&self, event: RunEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    pub fn observers(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
