//! Error types for context management.
//!
//! A remote failure arrives as a [`ModelError`] (status, machine-readable
//! code/type, free text). An [`ErrorClassifier`](crate::api::ErrorClassifier)
//! sorts it into an [`ErrorKind`], and the crate surfaces it as a
//! [`ContextError`]. All error types are `Clone` so one result can be shared
//! by every caller joined to a single-flight run.

use std::fmt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure reported by the model-calling collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelError {
    /// HTTP status, if the failure came from an HTTP response.
    pub status: Option<u16>,
    /// Machine-readable error code (e.g. `context_length_exceeded`).
    pub code: Option<String>,
    /// Machine-readable error type (e.g. `invalid_request_error`).
    pub error_type: Option<String>,
    /// Free-text message.
    pub message: String,
    /// The call observed cancellation and gave up.
    pub cancelled: bool,
}

impl ModelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// A failure caused by the caller's cancellation signal.
    pub fn cancelled() -> Self {
        Self {
            message: "request cancelled".into(),
            cancelled: true,
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.status {
            write!(f, "HTTP {status}: ")?;
        }
        write!(f, "{}", self.message)?;
        match (&self.code, &self.error_type) {
            (Some(code), _) => write!(f, " ({code})"),
            (None, Some(error_type)) => write!(f, " ({error_type})"),
            (None, None) => Ok(()),
        }
    }
}

impl std::error::Error for ModelError {}

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request exceeded the model's size/length limits.
    ContextTooLarge,
    /// Cooperative cancellation was observed.
    Cancelled,
    /// The tool-call / tool-result sequence was invalid.
    ProtocolMismatch,
    /// Anything else. Never recovered.
    Unclassified,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ContextTooLarge => write!(f, "context_too_large"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::ProtocolMismatch => write!(f, "protocol_mismatch"),
            ErrorKind::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// The primary error type for context-management operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContextError {
    /// The remote call was rejected for exceeding size/length limits.
    #[error("context too large: {0}")]
    ContextTooLarge(ModelError),

    /// Cooperative cancellation was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// Tool-call / tool-result sequence is invalid.
    #[error("tool-call sequence mismatch: {0}")]
    ProtocolMismatch(String),

    /// Unclassified model failure. Always propagated as-is.
    #[error("model call failed: {0}")]
    Model(ModelError),
}

impl ContextError {
    /// Wrap a model failure according to an already-computed kind.
    pub fn from_kind(kind: ErrorKind, err: ModelError) -> Self {
        match kind {
            ErrorKind::ContextTooLarge => ContextError::ContextTooLarge(err),
            ErrorKind::Cancelled => ContextError::Cancelled,
            ErrorKind::ProtocolMismatch => ContextError::ProtocolMismatch(err.to_string()),
            ErrorKind::Unclassified => ContextError::Model(err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ContextError::ContextTooLarge(_) => ErrorKind::ContextTooLarge,
            ContextError::Cancelled => ErrorKind::Cancelled,
            ContextError::ProtocolMismatch(_) => ErrorKind::ProtocolMismatch,
            ContextError::Model(_) => ErrorKind::Unclassified,
        }
    }

    pub fn is_context_too_large(&self) -> bool {
        matches!(self, ContextError::ContextTooLarge(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ContextError::Cancelled)
    }

    /// The underlying model failure, when there is one.
    pub fn model_error(&self) -> Option<&ModelError> {
        match self {
            ContextError::ContextTooLarge(err) | ContextError::Model(err) => Some(err),
            ContextError::Cancelled | ContextError::ProtocolMismatch(_) => None,
        }
    }
}

/// A specialized `Result` type for context-management operations.
pub type Result<T> = std::result::Result<T, ContextError>;

/// Fail with [`ContextError::Cancelled`] if `token` has fired.
pub fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(ContextError::Cancelled)
    } else {
        Ok(())
    }
}
