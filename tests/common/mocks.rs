//! Store wrappers that count calls and inject failures.

use async_trait::async_trait;
use backup_replicator::{
    models::record::{BackupRecord, BackupStatus, StatusUpdate},
    services::{
        mapping_store::{
            MappingError, MappingResult, MappingStore, PageRequest, RecordPage, SqliteMappingStore,
        },
        object_store::{ByteStream, FsObjectStore, ObjectStore, StorageError, StorageResult},
    },
};
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

/// Object store that counts writes and deletes and can refuse deletes.
pub struct CountingStore {
    inner: FsObjectStore,
    pub puts: AtomicUsize,
    pub deletes: AtomicUsize,
    pub fail_deletes: AtomicBool,
}

#[allow(dead_code)]
impl CountingStore {
    pub fn new(inner: FsObjectStore) -> Self {
        Self {
            inner,
            puts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn open(&self, key: &str) -> StorageResult<ByteStream> {
        self.inner.open(key).await
    }

    async fn put_stream(&self, key: &str, stream: ByteStream) -> StorageResult<u64> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put_stream(key, stream).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "injected delete failure",
            )));
        }
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key).await
    }

    fn backend_name(&self) -> &'static str {
        "counting"
    }
}

/// Mapping store that can fail the next N record deletions and can refuse
/// every `ACTIVE -> DISOWNED` update as if another writer got there first.
pub struct FlakyMappingStore {
    inner: Arc<SqliteMappingStore>,
    pub failing_deletes: AtomicUsize,
    pub refuse_disown_active: AtomicBool,
}

#[allow(dead_code)]
impl FlakyMappingStore {
    pub fn new(inner: Arc<SqliteMappingStore>) -> Self {
        Self {
            inner,
            failing_deletes: AtomicUsize::new(0),
            refuse_disown_active: AtomicBool::new(false),
        }
    }

    pub fn refuse_disown_active(&self, refuse: bool) {
        self.refuse_disown_active.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_next_deletes(&self, count: usize) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl MappingStore for FlakyMappingStore {
    async fn put_if_absent(&self, record: &BackupRecord) -> MappingResult<()> {
        self.inner.put_if_absent(record).await
    }

    async fn get(&self, src_key: &str, created_at: i64) -> MappingResult<Option<BackupRecord>> {
        self.inner.get(src_key, created_at).await
    }

    async fn conditional_update_status(
        &self,
        src_key: &str,
        created_at: i64,
        update: StatusUpdate,
    ) -> MappingResult<BackupRecord> {
        if self.refuse_disown_active.load(Ordering::SeqCst)
            && update.expected() == BackupStatus::Active
            && update.new_status() == BackupStatus::Disowned
        {
            return Err(MappingError::PreconditionFailed {
                src_key: src_key.to_string(),
                created_at,
                expected: BackupStatus::Active,
            });
        }
        self.inner
            .conditional_update_status(src_key, created_at, update)
            .await
    }

    async fn query_by_source_status(
        &self,
        src_key: &str,
        status: BackupStatus,
        page: PageRequest,
    ) -> MappingResult<RecordPage> {
        self.inner.query_by_source_status(src_key, status, page).await
    }

    async fn query_disowned_older_than(
        &self,
        cutoff: i64,
        page: PageRequest,
    ) -> MappingResult<RecordPage> {
        self.inner.query_disowned_older_than(cutoff, page).await
    }

    async fn delete(&self, src_key: &str, created_at: i64) -> MappingResult<()> {
        let remaining = self.failing_deletes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_deletes.store(remaining - 1, Ordering::SeqCst);
            return Err(sqlx::Error::PoolTimedOut.into());
        }
        self.inner.delete(src_key, created_at).await
    }

    async fn purge_reclaimed(&self, cutoff: i64) -> MappingResult<u64> {
        self.inner.purge_reclaimed(cutoff).await
    }
}
