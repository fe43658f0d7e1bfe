//! Handler Error Types

/// Failure reported by a registered event handler
///
/// Handler failures drive the retry/dead-letter policy; the message text is
/// only used for logging.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}
