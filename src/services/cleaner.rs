//! src/services/cleaner.rs
//!
//! Reclaims destination storage for generations that have been `DISOWNED`
//! for at least the grace period. Only disowned rows are ever visited, so an
//! in-flight copy (`PENDING`) can never be mistaken for a candidate.

use crate::services::{
    clock::Clock,
    mapping_store::{DEFAULT_PAGE_SIZE, MappingError, MappingStore, MappingStoreExt},
    object_store::Replica,
};
use futures::TryStreamExt;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Grace period a generation stays disowned before reclamation.
    pub disowned_lag: Duration,
    pub page_size: u32,
    /// How long a reclaimed generation is remembered, so late redeliveries
    /// of its creation are ignored.
    pub reclaimed_retention: Duration,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            disowned_lag: Duration::from_secs(10),
            page_size: DEFAULT_PAGE_SIZE,
            reclaimed_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum CleanerError {
    #[error("scanning disowned generations failed: {0}")]
    Scan(#[from] MappingError),
}

/// Tally of a single sweep.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Generations disowned at or before this instant were eligible.
    pub cutoff: i64,
    pub scanned: u64,
    pub reclaimed: u64,
    /// Destination deletes that failed; their records were left untouched.
    pub object_failures: u64,
    /// Record deletes that failed after the object was gone; retried next sweep.
    pub record_failures: u64,
    /// Reclaimed generations forgotten after the retention horizon.
    pub purged: u64,
}

#[derive(Clone)]
pub struct Cleaner {
    store: Arc<dyn MappingStore>,
    replica: Replica,
    clock: Arc<dyn Clock>,
    config: CleanerConfig,
}

impl Cleaner {
    pub fn new(
        store: Arc<dyn MappingStore>,
        replica: Replica,
        clock: Arc<dyn Clock>,
        config: CleanerConfig,
    ) -> Self {
        Self {
            store,
            replica,
            clock,
            config,
        }
    }

    /// Run one sweep over every eligible generation, oldest first.
    ///
    /// Per-record failures are counted and skipped; only a failing scan
    /// aborts the sweep.
    pub async fn run_once(&self) -> Result<SweepReport, CleanerError> {
        let now = self.clock.now_millis();
        let cutoff = now.saturating_sub(millis(self.config.disowned_lag));

        info!(
            "Cleaner start: now={} cutoff={} lag={:?}",
            now, cutoff, self.config.disowned_lag
        );

        let mut report = SweepReport {
            cutoff,
            ..SweepReport::default()
        };
        let mut candidates = self.store.disowned_stream(cutoff, self.config.page_size);

        while let Some(record) = candidates.try_next().await? {
            report.scanned += 1;

            if let Err(err) = self.replica.remove(&record.dst_key).await {
                warn!(
                    "failed to delete copy {} of ({}, {}): {}",
                    record.dst_key, record.src_key, record.created_at, err
                );
                report.object_failures += 1;
                continue;
            }

            match self.store.delete(&record.src_key, record.created_at).await {
                Ok(()) => {
                    report.reclaimed += 1;
                    debug!(
                        "reclaimed ({}, {}) copy {}",
                        record.src_key, record.created_at, record.dst_key
                    );
                }
                Err(err) => {
                    warn!(
                        "copy {} deleted but record ({}, {}) remains until next sweep: {}",
                        record.dst_key, record.src_key, record.created_at, err
                    );
                    report.record_failures += 1;
                }
            }
        }

        let horizon = now.saturating_sub(millis(self.config.reclaimed_retention));
        match self.store.purge_reclaimed(horizon).await {
            Ok(purged) => report.purged = purged,
            Err(err) => warn!("failed to purge reclaimed generations: {}", err),
        }

        info!(
            "Cleaner done: scanned={} reclaimed={} object_failures={} record_failures={} purged={}",
            report.scanned,
            report.reclaimed,
            report.object_failures,
            report.record_failures,
            report.purged
        );
        Ok(report)
    }

    /// Sweep on a fixed interval forever. Failed sweeps are logged and the
    /// next tick tries again.
    pub async fn run_every(self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                warn!("sweep failed: {}", err);
            }
        }
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::record::{BackupRecord, BackupStatus, StatusUpdate},
        services::{
            clock::ManualClock, mapping_store::SqliteMappingStore, object_store::FsObjectStore,
        },
    };

    #[tokio::test]
    async fn test_sweep_skips_live_generations() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteMappingStore::in_memory().await.unwrap());
        let fs = Arc::new(FsObjectStore::new(dir.path()));
        let clock = Arc::new(ManualClock::new(1_000_000));

        store.put_if_absent(&BackupRecord::pending("p", 1)).await.unwrap();
        store.put_if_absent(&BackupRecord::pending("a", 1)).await.unwrap();
        store
            .conditional_update_status("a", 1, StatusUpdate::activate())
            .await
            .unwrap();

        let cleaner = Cleaner::new(
            store.clone(),
            Replica::new(fs.clone(), fs),
            clock,
            CleanerConfig::default(),
        );
        let report = cleaner.run_once().await.unwrap();
        assert_eq!(report.scanned, 0);
        assert_eq!(
            store.get("p", 1).await.unwrap().unwrap().status,
            BackupStatus::Pending
        );
        assert_eq!(
            store.get("a", 1).await.unwrap().unwrap().status,
            BackupStatus::Active
        );
    }
}
