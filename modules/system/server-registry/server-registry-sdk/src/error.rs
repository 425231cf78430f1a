//! Error types for the server registry.

use thiserror::Error;

/// Errors surfaced by every registry backend.
///
/// The registry reports backend state; it does not retry on its own. Callers
/// decide backoff and give-up thresholds based on [`RegistryError::is_retryable`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Bad or missing backend parameters. Fatal at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A registration attempt could not be persisted by the backend.
    #[error("registration failed: {0}")]
    Registration(String),

    /// The backend session or connection is lost.
    ///
    /// Callers should trigger a reconnect or fail the surrounding operation.
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// The registry was used after `close()`.
    #[error("registry is closed")]
    Closed,

    /// The call carried an empty or malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl RegistryError {
    /// Whether a caller may retry the failed call after a backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Registration(_) | Self::Unavailable(_))
    }

    /// Whether the error signals a lost backend session.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RegistryError::Registration("lost".to_owned()).is_retryable());
        assert!(RegistryError::Unavailable("down".to_owned()).is_retryable());
        assert!(!RegistryError::Closed.is_retryable());
        assert!(!RegistryError::Configuration("x".to_owned()).is_retryable());
        assert!(!RegistryError::InvalidArgument("x".to_owned()).is_retryable());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(RegistryError::Closed.to_string(), "registry is closed");
        assert_eq!(
            RegistryError::Unavailable("session expired".to_owned()).to_string(),
            "registry unavailable: session expired"
        );
    }
}
