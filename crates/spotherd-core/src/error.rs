//! Error types for spotherd
//!
//! Failures are classified at the provider boundary into the kinds of the
//! status-entry contract; the reconciler turns them into journal entries
//! without re-inspecting provider specifics.

use thiserror::Error;

use crate::types::StatusKind;

/// Result type for spotherd operations
pub type Result<T> = std::result::Result<T, SpotherdError>;

/// Classified error type for spotherd operations
#[derive(Error, Debug)]
pub enum SpotherdError {
    /// Invalid, cyclic or incomplete pool configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The provider's spot instance quota is exhausted
    #[error("maximum spot instance count exceeded: {0}")]
    MaxSpotInstanceCountExceeded(String),

    /// Transient network / TLS / endpoint failure; retried by the next tick
    #[error("temporary failure: {0}")]
    Temporary(String),

    /// The local inventory and the cloud view cannot be reconciled
    #[error("inconsistent inventory: {0}")]
    Inconsistent(String),

    /// Record store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Key-value cache failure
    #[error("cache error: {0}")]
    Cache(String),

    /// Anything else
    #[error("unclassified error: {0}")]
    Unclassified(String),
}

impl SpotherdError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn temporary(msg: impl Into<String>) -> Self {
        Self::Temporary(msg.into())
    }

    pub fn unclassified(msg: impl Into<String>) -> Self {
        Self::Unclassified(msg.into())
    }

    /// The status-entry kind this failure is journaled under.
    pub fn status_kind(&self) -> StatusKind {
        match self {
            Self::Config(_) => StatusKind::ConfigError,
            Self::MaxSpotInstanceCountExceeded(_) => StatusKind::MaxSpotInstanceCountExceeded,
            Self::Temporary(_) => StatusKind::TemporaryFailure,
            _ => StatusKind::Unclassified,
        }
    }

    /// Critical failures halt reconciliation of the pool until an operator
    /// clears the entry; non-critical ones are retracted on the next
    /// successful launch.
    pub fn is_critical(&self) -> bool {
        matches!(
            self.status_kind(),
            StatusKind::ConfigError | StatusKind::Unclassified
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            SpotherdError::config("x").status_kind(),
            StatusKind::ConfigError
        );
        assert_eq!(
            SpotherdError::temporary("x").status_kind(),
            StatusKind::TemporaryFailure
        );
        assert_eq!(
            SpotherdError::MaxSpotInstanceCountExceeded("x".into()).status_kind(),
            StatusKind::MaxSpotInstanceCountExceeded
        );
        assert_eq!(
            SpotherdError::Inconsistent("x".into()).status_kind(),
            StatusKind::Unclassified
        );
    }

    #[test]
    fn test_criticality() {
        assert!(SpotherdError::config("x").is_critical());
        assert!(SpotherdError::unclassified("x").is_critical());
        assert!(!SpotherdError::temporary("x").is_critical());
        assert!(!SpotherdError::MaxSpotInstanceCountExceeded("x".into()).is_critical());
    }
}
