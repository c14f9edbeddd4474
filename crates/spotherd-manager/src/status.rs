//! Pool status journal
//!
//! Append-only log of structured entries explaining why a pool is not at
//! capacity. Critical entries halt reconciliation of the pool until an
//! operator clears them; the transient kinds are retracted automatically
//! the first time an instance launches successfully into the pool.

use std::sync::Arc;

use chrono::Utc;
use spotherd_core::{PoolId, PoolStatusEntry, Result, SpotherdError, StatusKind};
use tracing::warn;

use crate::storage::Storage;

/// Journal handle over the record store.
#[derive(Clone)]
pub struct StatusJournal {
    storage: Arc<dyn Storage>,
}

impl StatusJournal {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Append an entry.
    pub async fn record(
        &self,
        pool: PoolId,
        kind: StatusKind,
        is_critical: bool,
        message: impl Into<String>,
    ) -> Result<()> {
        let message = message.into();
        warn!("[Pool {pool}] {kind}: {message}");
        self.storage
            .append_status_entry(&PoolStatusEntry {
                pool,
                kind,
                is_critical,
                message,
                created: Utc::now(),
            })
            .await
    }

    /// Append an entry for a classified failure, with criticality taken
    /// from the error kind.
    pub async fn record_failure(&self, pool: PoolId, err: &SpotherdError) -> Result<()> {
        self.record(pool, err.status_kind(), err.is_critical(), err.to_string())
            .await
    }

    /// Append an entry unless one of the same kind already exists for the
    /// pool. Returns whether an entry was written.
    pub async fn record_once(
        &self,
        pool: PoolId,
        kind: StatusKind,
        is_critical: bool,
        message: impl Into<String>,
    ) -> Result<bool> {
        let existing = self.storage.status_entries(pool).await?;
        if existing.iter().any(|e| e.kind == kind) {
            return Ok(false);
        }
        self.record(pool, kind, is_critical, message).await?;
        Ok(true)
    }

    /// Whether any critical entry exists for the pool. Reconciliation is a
    /// no-op while this holds.
    pub async fn has_critical(&self, pool: PoolId) -> Result<bool> {
        self.storage.has_critical_entries(pool).await
    }

    /// Delete every entry of one kind for the pool.
    pub async fn retract(&self, pool: PoolId, kind: StatusKind) -> Result<()> {
        self.storage.delete_status_entries(pool, kind).await
    }

    /// Delete the transient-failure kinds after a successful launch.
    pub async fn retract_transient(&self, pool: PoolId) -> Result<()> {
        self.retract(pool, StatusKind::MaxSpotInstanceCountExceeded)
            .await?;
        self.retract(pool, StatusKind::TemporaryFailure).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn journal() -> StatusJournal {
        StatusJournal::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_record_once_suppresses_duplicates() {
        let journal = journal();
        let pool = PoolId(1);

        assert!(journal
            .record_once(pool, StatusKind::PriceTooLow, false, "too expensive")
            .await
            .unwrap());
        assert!(!journal
            .record_once(pool, StatusKind::PriceTooLow, false, "too expensive")
            .await
            .unwrap());

        let entries = journal.storage.status_entries(pool).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_criticality_follows_kind() {
        let journal = journal();
        let pool = PoolId(1);

        journal
            .record_failure(pool, &SpotherdError::temporary("endpoint down"))
            .await
            .unwrap();
        assert!(!journal.has_critical(pool).await.unwrap());

        journal
            .record_failure(pool, &SpotherdError::unclassified("request failed"))
            .await
            .unwrap();
        assert!(journal.has_critical(pool).await.unwrap());
    }

    #[tokio::test]
    async fn test_retract_transient_leaves_critical_entries() {
        let journal = journal();
        let pool = PoolId(1);

        journal
            .record(pool, StatusKind::TemporaryFailure, false, "a")
            .await
            .unwrap();
        journal
            .record(pool, StatusKind::MaxSpotInstanceCountExceeded, false, "b")
            .await
            .unwrap();
        journal
            .record(pool, StatusKind::Unclassified, true, "c")
            .await
            .unwrap();

        journal.retract_transient(pool).await.unwrap();

        let entries = journal.storage.status_entries(pool).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, StatusKind::Unclassified);
    }
}
