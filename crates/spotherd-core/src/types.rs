//! Core types shared across spotherd components

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tag key carrying the owning pool id on every managed cloud instance.
pub const POOL_ID_TAG: &str = "SpotherdPoolId";

/// Tag key of the handoff marker between the launcher and the reconciler.
///
/// An instance that does not carry this tag (with a positive value) is still
/// inside the spawning window: another worker is managing it and the update
/// pass must leave it alone.
pub const UPDATABLE_TAG: &str = "SpotherdUpdatable";

/// Unique identifier for an instance pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(pub u32);

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical instance state.
///
/// Providers translate their own state words into this enum. The wire value
/// is a 16-bit code whose high byte is opaque and must be masked off;
/// `Requested` is the local-only pseudo-state of an unfulfilled spot request
/// and never comes back from a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Spot request submitted, not yet fulfilled (local-only)
    Requested,
    /// Instance is pending
    Pending,
    /// Instance is running
    Running,
    /// Instance is shutting down
    ShuttingDown,
    /// Instance is terminated
    Terminated,
    /// Instance is stopping
    Stopping,
    /// Instance is stopped
    Stopped,
}

impl InstanceState {
    /// The canonical status code for this state.
    pub fn status_code(self) -> i32 {
        match self {
            Self::Requested => -1,
            Self::Pending => 0,
            Self::Running => 16,
            Self::ShuttingDown => 32,
            Self::Terminated => 48,
            Self::Stopping => 64,
            Self::Stopped => 80,
        }
    }

    /// Translate a provider status word.
    ///
    /// The low byte is the canonical code; the high byte is an opaque
    /// internal value and is ignored.
    pub fn from_status_code(code: i32) -> Option<Self> {
        match code & 0xff {
            0 => Some(Self::Pending),
            16 => Some(Self::Running),
            32 => Some(Self::ShuttingDown),
            48 => Some(Self::Terminated),
            64 => Some(Self::Stopping),
            80 => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Check if the instance is gone or going: its record must be deleted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }

    /// Check if the instance counts as live capacity in the ordinary sense.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Requested | Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Requested => "requested",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// Kind of a pool status entry. These strings are an external contract,
/// surfaced to operator UIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusKind {
    Unclassified,
    ConfigError,
    MaxSpotInstanceCountExceeded,
    TemporaryFailure,
    PriceTooLow,
}

impl StatusKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unclassified => "unclassified",
            Self::ConfigError => "config-error",
            Self::MaxSpotInstanceCountExceeded => "max-spot-instance-count-exceeded",
            Self::TemporaryFailure => "temporary-failure",
            Self::PriceTooLow => "price-too-low",
        }
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An instance pool: a named set of interchangeable instances managed to a
/// target core count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub enabled: bool,
    /// When every instance of the pool was last recycled
    pub last_cycled: Option<DateTime<Utc>>,
    /// Root of this pool's configuration chain
    pub config: crate::config::ConfigId,
}

/// A cloud instance owned by a pool.
///
/// `provider_id` is the cloud-assigned instance id, or the spot request id
/// while the request is still unfulfilled (`status == Requested`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Record id, assigned by storage on insert
    pub id: u64,
    pub provider_id: String,
    pub pool: PoolId,
    pub region: String,
    pub zone: String,
    pub status: InstanceState,
    /// Core count of this instance
    pub size: u32,
    pub hostname: Option<String>,
    pub created: DateTime<Utc>,
}

/// One entry in a pool's status journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatusEntry {
    pub pool: PoolId,
    pub kind: StatusKind,
    /// Critical entries halt reconciliation until an operator intervenes
    pub is_critical: bool,
    pub message: String,
    pub created: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_round_trip() {
        for state in [
            InstanceState::Pending,
            InstanceState::Running,
            InstanceState::ShuttingDown,
            InstanceState::Terminated,
            InstanceState::Stopping,
            InstanceState::Stopped,
        ] {
            assert_eq!(InstanceState::from_status_code(state.status_code()), Some(state));
        }
    }

    #[test]
    fn test_high_byte_is_masked() {
        // The high byte of the provider state word is opaque.
        assert_eq!(InstanceState::from_status_code(0x0110), Some(InstanceState::Running));
        assert_eq!(InstanceState::from_status_code(0x4230), Some(InstanceState::Terminated));
        assert_eq!(InstanceState::from_status_code(0xff00), Some(InstanceState::Pending));
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(InstanceState::from_status_code(7), None);
    }

    #[test]
    fn test_requested_never_comes_from_a_provider() {
        assert_eq!(InstanceState::from_status_code(-1), None);
    }

    #[test]
    fn test_is_active() {
        assert!(InstanceState::Requested.is_active());
        assert!(InstanceState::Pending.is_active());
        assert!(InstanceState::Running.is_active());
        assert!(!InstanceState::Stopped.is_active());
        assert!(!InstanceState::Terminated.is_active());
    }

    #[test]
    fn test_status_kind_strings() {
        assert_eq!(StatusKind::ConfigError.as_str(), "config-error");
        assert_eq!(
            StatusKind::MaxSpotInstanceCountExceeded.as_str(),
            "max-spot-instance-count-exceeded"
        );
        assert_eq!(StatusKind::PriceTooLow.to_string(), "price-too-low");
    }
}
