pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod graph;
pub mod traits;
pub mod types;

pub use config::WeftConfig;
pub use definition::DefinitionRegistry;
pub use error::{Result, WeftError};
pub use event::{ContextStatus, EventBus, RunEvent};
pub use graph::{GraphDocument, SeedInput};
pub use traits::{Implementation, InputView, Invocation, Scope};
pub use types::*;
