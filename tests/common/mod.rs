pub mod mocks;

use backup_replicator::{
    models::record::BackupStatus,
    services::{
        cleaner::{Cleaner, CleanerConfig},
        clock::ManualClock,
        mapping_store::{MappingStore, SqliteMappingStore},
        object_store::{FsObjectStore, ObjectStore, Replica},
        replicator::{Replicator, ReplicatorConfig},
    },
};
use bytes::Bytes;
use mocks::{CountingStore, FlakyMappingStore};
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

/// Isolated pipeline: in-memory mapping table, temp-dir object stores and
/// a manual clock starting at zero.
#[allow(dead_code)]
pub struct TestEnv {
    pub sqlite: Arc<SqliteMappingStore>,
    pub store: Arc<FlakyMappingStore>,
    pub source: Arc<FsObjectStore>,
    pub destination: Arc<CountingStore>,
    pub clock: Arc<ManualClock>,
    _src_dir: TempDir,
    _dst_dir: TempDir,
}

#[allow(dead_code)]
impl TestEnv {
    pub async fn new() -> Self {
        let src_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let dst_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let sqlite = Arc::new(
            SqliteMappingStore::in_memory()
                .await
                .expect("Failed to open in-memory mapping store"),
        );
        Self {
            store: Arc::new(FlakyMappingStore::new(sqlite.clone())),
            sqlite,
            source: Arc::new(FsObjectStore::new(src_dir.path())),
            destination: Arc::new(CountingStore::new(FsObjectStore::new(dst_dir.path()))),
            clock: Arc::new(ManualClock::new(0)),
            _src_dir: src_dir,
            _dst_dir: dst_dir,
        }
    }

    pub fn replica(&self) -> Replica {
        Replica::new(self.source.clone(), self.destination.clone())
    }

    pub fn replicator(&self, max_active: usize) -> Replicator {
        Replicator::new(
            self.store.clone(),
            self.replica(),
            self.clock.clone(),
            ReplicatorConfig {
                max_active,
                copy_backoff: Duration::from_millis(1),
                ..ReplicatorConfig::default()
            },
        )
    }

    pub fn cleaner(&self, lag_secs: u64, page_size: u32) -> Cleaner {
        Cleaner::new(
            self.store.clone(),
            self.replica(),
            self.clock.clone(),
            CleanerConfig {
                disowned_lag: Duration::from_secs(lag_secs),
                page_size,
                ..CleanerConfig::default()
            },
        )
    }

    pub async fn put_source(&self, key: &str, body: &'static [u8]) {
        let stream = futures::stream::iter(vec![Ok(Bytes::from_static(body))]);
        self.source
            .put_stream(key, Box::pin(stream))
            .await
            .expect("Failed to write source object");
    }

    /// `(created_at, status)` of every generation of `src_key`, oldest first.
    pub async fn generations(&self, src_key: &str) -> Vec<(i64, BackupStatus)> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT created_at, status FROM backup_records WHERE src_key = ? ORDER BY created_at",
        )
        .bind(src_key)
        .fetch_all(self.sqlite.pool())
        .await
        .expect("Failed to list generations");
        rows.into_iter()
            .map(|(created_at, status)| (created_at, status.parse().expect("valid status")))
            .collect()
    }

    pub async fn active_count(&self, src_key: &str) -> usize {
        self.generations(src_key)
            .await
            .iter()
            .filter(|(_, status)| *status == BackupStatus::Active)
            .count()
    }

    pub async fn disowned_at(&self, src_key: &str, created_at: i64) -> Option<i64> {
        self.store
            .get(src_key, created_at)
            .await
            .expect("Failed to read record")
            .and_then(|record| record.disowned_at)
    }
}
