use thiserror::Error;

pub type Result<T> = std::result::Result<T, MonaError>;

/// Errors surfaced by the client.
///
/// Which of these reach the caller as `Err` is governed by the
/// `raise_*_exceptions` options; with the defaults only construction-time
/// misconfiguration is returned as an error and everything else is logged
/// and reported through failure-shaped results.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MonaError {
    /// Credentials rejected or the authentication server unreachable after
    /// all retries.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// A message or batch could not be delivered.
    #[error("export error: {0}")]
    Export(String),

    /// An auxiliary service endpoint answered with a non-2xx status or a
    /// malformed body.
    #[error("service error: {0}")]
    Service(String),

    /// A message or option failed client-side validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// The client options are inconsistent for the selected auth mode.
    #[error("initialization error: {0}")]
    Initialization(String),

    /// Network-level failure. Mapped into one of the categories above
    /// before it reaches callers of the public operations.
    #[error("transport error: {0}")]
    Transport(String),

    /// The async worker running the call was cancelled.
    #[error("task error: {0}")]
    Task(String),
}

impl MonaError {
    /// Wrap any displayable error as a transport failure.
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Human readable message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Authentication(m)
            | Self::Export(m)
            | Self::Service(m)
            | Self::Validation(m)
            | Self::Initialization(m)
            | Self::Transport(m)
            | Self::Task(m) => m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_category() {
        let err = MonaError::Export("chunk 0 rejected".to_string());
        assert_eq!(err.to_string(), "export error: chunk 0 rejected");
        assert_eq!(err.message(), "chunk 0 rejected");
    }

    #[test]
    fn transport_wraps_display() {
        let err = MonaError::transport("connection refused");
        assert_eq!(err, MonaError::Transport("connection refused".to_string()));
    }
}
