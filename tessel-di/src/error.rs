//! Error types for the binding container

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for container operations
pub type DiResult<T> = Result<T, DiError>;

/// Errors that can occur while binding or resolving values.
///
/// The enum is `Clone` because a single in-flight singleton resolution
/// hands the same outcome to every caller waiting on it.
#[derive(Error, Debug, Clone)]
pub enum DiError {
    /// No context in the chain owns a binding for the key
    #[error("Binding not found: {key} (requested from context '{context}')")]
    BindingNotFound { key: String, context: String },

    /// Mutation attempted on a locked context
    #[error("Context '{context}' is locked - cannot modify binding '{key}'")]
    LockedContext { context: String, key: String },

    /// The context has been closed
    #[error("Context '{0}' is closed")]
    ContextClosed(String),

    /// Circular dependency detected
    #[error("Circular dependency detected: {path}")]
    CircularDependency { path: String },

    /// The non-suspending path met a strategy that needs to suspend
    #[error("Binding '{key}' requires asynchronous resolution - use get() instead of get_sync()")]
    AsyncResolutionRequired { key: String },

    /// Key already bound locally and the context rejects duplicates
    #[error("Duplicate binding: '{key}' is already bound in context '{context}'")]
    DuplicateBinding { context: String, key: String },

    /// The binding exists but no strategy was configured
    #[error("Binding '{0}' has no resolution strategy")]
    UnboundKey(String),

    /// The resolved value is not of the requested type
    #[error("Type mismatch for '{key}': expected {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    /// A required positional argument was not supplied
    #[error("Missing argument at position {index} for {target}")]
    MissingArgument { target: String, index: usize },

    /// Failure raised by a factory, constructor, interceptor or disposer
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),

    /// Configuration error
    #[cfg(feature = "config")]
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("DI error: {0}")]
    Other(String),
}

impl DiError {
    /// Wrap an arbitrary failure raised by user code
    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        DiError::Failed(Arc::new(error.into()))
    }

    /// Whether this error means the key is absent from the whole chain
    pub fn is_not_found(&self) -> bool {
        matches!(self, DiError::BindingNotFound { .. })
    }
}

impl From<anyhow::Error> for DiError {
    fn from(error: anyhow::Error) -> Self {
        DiError::Failed(Arc::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_keeps_message() {
        let err = DiError::failed(anyhow::anyhow!("datastore offline"));
        assert_eq!(err.to_string(), "datastore offline");
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_not_found_display() {
        let err = DiError::BindingNotFound {
            key: "services.mailer".to_string(),
            context: "request".to_string(),
        };
        assert!(err.is_not_found());
        assert!(err.to_string().contains("services.mailer"));
    }
}
