pub mod builtin;
pub mod func;
pub mod registry;

pub use func::FnImplementation;
pub use registry::{OperationRegistry, RegisteredOperation};
