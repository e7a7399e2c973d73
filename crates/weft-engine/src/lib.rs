pub mod dataflow;
pub mod implementation_network;
pub mod input_network;
pub mod lock_network;
pub mod operation_network;
pub mod orchestrator;
pub mod redundancy;

pub use dataflow::DataFlow;
pub use implementation_network::ImplementationNetwork;
pub use input_network::{ContextView, InputNetwork};
pub use lock_network::{LockHandle, LockKey, LockNetwork};
pub use operation_network::{OperationNetwork, ReadyOperation};
pub use orchestrator::{ContextOutcome, Orchestrator, RunHandle};
pub use redundancy::{Fingerprint, RedundancyChecker};
