use thiserror::Error;

/// Result alias used across the container.
pub type Result<T, E = ContextError> = std::result::Result<T, E>;

/// Structured errors raised by bindings, contexts and the resolver.
///
/// Every variant is recoverable: the context that produced it stays usable.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("invalid binding key '{key}': {reason}")]
    InvalidBindingKey { key: String, reason: String },

    #[error("the key '{key}' is not bound to any value in context '{context}'")]
    BindingNotFound { key: String, context: String },

    #[error("cannot rebind key '{key}' to a locked binding")]
    BindingIsLocked { key: String },

    #[error("no value was configured for binding '{key}'")]
    NoValueConfigured { key: String },

    #[error(
        "pending values are not allowed for constant binding '{key}'; \
         register an async factory via `to_dynamic_value()` instead"
    )]
    InvalidConstantValue { key: String },

    #[error("circular dependency detected: {path}")]
    CircularDependency { path: String },

    #[error("cannot resolve injected argument '{target}': {reason}")]
    ResolutionError { target: String, reason: String },

    #[error("cannot get '{key}' synchronously: the value is a promise")]
    AsyncResolutionRequired { key: String },

    #[error("tag must be a string or an object (but not array): {tag}")]
    InvalidTagArgument { tag: String },

    #[error("property '{path}' not found on the value of binding '{key}'")]
    PropertyNotFound { key: String, path: String },

    #[error("no constructor registered for class '{class}'")]
    NoConstructorFound { class: String },

    #[error("value of '{key}' has type {actual}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("context '{name}' is closed")]
    ContextClosed { name: String },

    #[error("binding '{key}' ({binding_type}) does not support proxy with interceptors")]
    ProxyNotSupported { key: String, binding_type: String },

    #[error("resolution session is inconsistent: {0}")]
    InvalidSessionState(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ContextError {
    pub(crate) fn invalid_key(key: &str, reason: impl Into<String>) -> Self {
        ContextError::InvalidBindingKey {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
