use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Graph errors
    #[error("Unknown definition: {0}")]
    UnknownDefinition(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Operation {operation} produced undeclared output: {output}")]
    UnknownOutput { operation: String, output: String },

    #[error("Value does not match primitive {expected} of definition {definition}")]
    PrimitiveMismatch { definition: String, expected: String },

    #[error("Graph validation failed: {0}")]
    Graph(String),

    // Run errors
    #[error("Operation {operation} failed in context {context}: {message}")]
    Implementation {
        operation: String,
        context: String,
        message: String,
    },

    #[error("Lock ordering violation: {0}")]
    DeadlockRisk(String),

    #[error("Run cancelled: {0}")]
    Cancelled(String),

    #[error("Context {0} has finished and accepts no more inputs")]
    ContextClosed(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeftError {
    /// Shorthand for an implementation failure.
    pub fn implementation(
        operation: impl Into<String>,
        context: impl std::fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Self::Implementation {
            operation: operation.into(),
            context: context.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_implementation_display() {
        let e = WeftError::implementation("add", "ctx1", "boom");
        assert_eq!(e.to_string(), "Operation add failed in context ctx1: boom");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let e: WeftError = io.into();
        assert!(matches!(e, WeftError::Io(_)));
    }
}
