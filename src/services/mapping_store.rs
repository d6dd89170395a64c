//! src/services/mapping_store.rs
//!
//! Durable mapping table of backup generations. Every mutation is a single
//! conditional row write keyed by `(src_key, created_at)`; these writes are
//! the only coordination between concurrent Replicator and Cleaner runs.
//!
//! Two secondary indices back the queries:
//! - `(src_key, status_created_at)` for per-key lookups by status
//! - `(status, disowned_at)` for the Cleaner's age-ordered sweep
//!
//! Removing a disowned generation leaves a row in `reclaimed_generations`
//! so a late redelivery of its creation cannot bring it back. Those rows are
//! purged once they are older than any plausible redelivery.

use crate::models::record::{
    BackupRecord, BackupRow, BackupStatus, CorruptRecord, StatusUpdate, status_sort_key,
};
use async_trait::async_trait;
use futures::{
    Future, StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use sqlx::{
    QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqlitePoolOptions},
};
use std::{str::FromStr, sync::Arc};
use thiserror::Error;

/// Default number of records per page.
pub const DEFAULT_PAGE_SIZE: u32 = 100;
/// Upper bound on records fetched by a single query.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Schema, embedded so every binary and test uses the same definition.
const INIT_MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

const RECORD_COLUMNS: &str =
    "src_key, created_at, status, status_created_at, disowned_at, dst_key";

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("record ({src_key}, {created_at}) already exists")]
    AlreadyExists { src_key: String, created_at: i64 },
    #[error("record ({src_key}, {created_at}) is not {expected}")]
    PreconditionFailed {
        src_key: String,
        created_at: i64,
        expected: BackupStatus,
    },
    #[error("record ({src_key}, {created_at}) was already reclaimed")]
    Reclaimed { src_key: String, created_at: i64 },
    #[error("corrupt record: {0}")]
    Corrupt(#[from] CorruptRecord),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl MappingError {
    /// Lost an idempotency race: someone already did this write.
    pub fn is_race(&self) -> bool {
        matches!(
            self,
            Self::AlreadyExists { .. }
                | Self::Reclaimed { .. }
                | Self::PreconditionFailed { .. }
        )
    }
}

pub type MappingResult<T> = Result<T, MappingError>;

/// Keyset position after the last record of a page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordCursor {
    /// `created_at` for per-key queries, `disowned_at` for the age query.
    pub sort_value: i64,
    pub src_key: String,
    pub created_at: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub after: Option<RecordCursor>,
    pub limit: u32,
}

impl PageRequest {
    pub fn first(limit: u32) -> Self {
        Self { after: None, limit }
    }

    /// Limit clamped to `1..=MAX_PAGE_SIZE`.
    pub fn normalized_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::first(DEFAULT_PAGE_SIZE)
    }
}

/// One page of records plus the cursor for the next one, if any.
#[derive(Clone, Debug, Default)]
pub struct RecordPage {
    pub records: Vec<BackupRecord>,
    pub next: Option<RecordCursor>,
}

/// Mapping table contract.
#[async_trait]
pub trait MappingStore: Send + Sync + 'static {
    /// Insert a new generation. Fails with `AlreadyExists` on duplicates and
    /// with `Reclaimed` when the generation was already removed.
    async fn put_if_absent(&self, record: &BackupRecord) -> MappingResult<()>;

    /// Point read of a generation.
    async fn get(&self, src_key: &str, created_at: i64) -> MappingResult<Option<BackupRecord>>;

    /// Apply `update` only if the record is currently in `update.expected()`.
    /// Fails with `PreconditionFailed` otherwise, including when the record
    /// no longer exists.
    async fn conditional_update_status(
        &self,
        src_key: &str,
        created_at: i64,
        update: StatusUpdate,
    ) -> MappingResult<BackupRecord>;

    /// Records of `src_key` in `status`, oldest first.
    async fn query_by_source_status(
        &self,
        src_key: &str,
        status: BackupStatus,
        page: PageRequest,
    ) -> MappingResult<RecordPage>;

    /// `DISOWNED` records with `disowned_at <= cutoff` across all keys,
    /// oldest first.
    async fn query_disowned_older_than(
        &self,
        cutoff: i64,
        page: PageRequest,
    ) -> MappingResult<RecordPage>;

    /// Remove a generation. Removing an absent record succeeds. A removed
    /// `DISOWNED` generation is remembered until purged.
    async fn delete(&self, src_key: &str, created_at: i64) -> MappingResult<()>;

    /// Forget removed generations disowned at or before `cutoff`.
    /// Returns how many were forgotten.
    async fn purge_reclaimed(&self, cutoff: i64) -> MappingResult<u64>;

    /// Lightweight connectivity probe.
    async fn health_check(&self) -> MappingResult<()> {
        Ok(())
    }
}

/// Lazy, restartable record sequences built on the paged queries.
///
/// Each call starts a fresh scan. Automatically implemented for every
/// `MappingStore`.
pub trait MappingStoreExt: MappingStore {
    fn source_status_stream<'a>(
        &'a self,
        src_key: &'a str,
        status: BackupStatus,
        page_size: u32,
    ) -> BoxStream<'a, MappingResult<BackupRecord>> {
        paged_records(page_size, move |page| {
            self.query_by_source_status(src_key, status, page)
        })
    }

    fn disowned_stream<'a>(
        &'a self,
        cutoff: i64,
        page_size: u32,
    ) -> BoxStream<'a, MappingResult<BackupRecord>> {
        paged_records(page_size, move |page| {
            self.query_disowned_older_than(cutoff, page)
        })
    }
}

impl<T: MappingStore + ?Sized> MappingStoreExt for T {}

/// Flatten successive pages into a stream of records, stopping after the
/// first page without a continuation cursor.
fn paged_records<'a, F, Fut>(
    page_size: u32,
    fetch: F,
) -> BoxStream<'a, MappingResult<BackupRecord>>
where
    F: Fn(PageRequest) -> Fut + Send + 'a,
    Fut: Future<Output = MappingResult<RecordPage>> + Send + 'a,
{
    stream::try_unfold(
        (fetch, Some(PageRequest::first(page_size))),
        move |(fetch, request)| async move {
            let Some(request) = request else {
                return Ok::<_, MappingError>(None);
            };
            let page = fetch(request).await?;
            let next = page.next.map(|cursor| PageRequest {
                after: Some(cursor),
                limit: page_size,
            });
            Ok(Some((page.records, (fetch, next))))
        },
    )
    .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, MappingError>)))
    .try_flatten()
    .boxed()
}

/// SQLite-backed mapping table.
#[derive(Clone)]
pub struct SqliteMappingStore {
    /// Shared SQLite connection pool.
    db: Arc<SqlitePool>,
}

impl SqliteMappingStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open (creating if missing) the database at `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> MappingResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> MappingResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(Arc::new(pool));
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Run the embedded schema statement by statement. Safe to repeat.
    pub async fn migrate(&self) -> MappingResult<()> {
        let statements = INIT_MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        tracing::info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            tracing::debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    fn into_page(
        rows: Vec<BackupRow>,
        limit: u32,
        cursor_of: fn(&BackupRecord) -> Option<i64>,
    ) -> MappingResult<RecordPage> {
        let limit = limit as usize;
        let has_more = rows.len() > limit;
        let records = rows
            .into_iter()
            .take(limit)
            .map(BackupRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let next = match records.last() {
            Some(last) if has_more => {
                let sort_value = cursor_of(last).ok_or_else(|| CorruptRecord::DisownedAt {
                    src_key: last.src_key.clone(),
                    created_at: last.created_at,
                    status: last.status,
                    disowned_at: last.disowned_at,
                })?;
                Some(RecordCursor {
                    sort_value,
                    src_key: last.src_key.clone(),
                    created_at: last.created_at,
                })
            }
            _ => None,
        };

        Ok(RecordPage { records, next })
    }
}

#[async_trait]
impl MappingStore for SqliteMappingStore {
    async fn put_if_absent(&self, record: &BackupRecord) -> MappingResult<()> {
        let result = sqlx::query(
            "INSERT INTO backup_records
                (src_key, created_at, status, status_created_at, disowned_at, dst_key)
             SELECT ?, ?, ?, ?, ?, ?
             WHERE NOT EXISTS (
                 SELECT 1 FROM reclaimed_generations WHERE src_key = ? AND created_at = ?
             )
             ON CONFLICT (src_key, created_at) DO NOTHING",
        )
        .bind(&record.src_key)
        .bind(record.created_at)
        .bind(record.status.as_str())
        .bind(record.status_created_at())
        .bind(record.disowned_at)
        .bind(&record.dst_key)
        .bind(&record.src_key)
        .bind(record.created_at)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let reclaimed = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM reclaimed_generations WHERE src_key = ? AND created_at = ?",
        )
        .bind(&record.src_key)
        .bind(record.created_at)
        .fetch_one(&*self.db)
        .await?;

        if reclaimed > 0 {
            Err(MappingError::Reclaimed {
                src_key: record.src_key.clone(),
                created_at: record.created_at,
            })
        } else {
            Err(MappingError::AlreadyExists {
                src_key: record.src_key.clone(),
                created_at: record.created_at,
            })
        }
    }

    async fn get(&self, src_key: &str, created_at: i64) -> MappingResult<Option<BackupRecord>> {
        let row = sqlx::query_as::<_, BackupRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM backup_records WHERE src_key = ? AND created_at = ?"
        ))
        .bind(src_key)
        .bind(created_at)
        .fetch_optional(&*self.db)
        .await?;

        Ok(row.map(BackupRecord::try_from).transpose()?)
    }

    async fn conditional_update_status(
        &self,
        src_key: &str,
        created_at: i64,
        update: StatusUpdate,
    ) -> MappingResult<BackupRecord> {
        let row = sqlx::query_as::<_, BackupRow>(&format!(
            "UPDATE backup_records
             SET status = ?, status_created_at = ?, disowned_at = ?
             WHERE src_key = ? AND created_at = ? AND status = ?
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(update.new_status().as_str())
        .bind(status_sort_key(update.new_status(), created_at))
        .bind(update.disowned_at())
        .bind(src_key)
        .bind(created_at)
        .bind(update.expected().as_str())
        .fetch_optional(&*self.db)
        .await?;

        match row {
            Some(row) => Ok(BackupRecord::try_from(row)?),
            None => Err(MappingError::PreconditionFailed {
                src_key: src_key.to_string(),
                created_at,
                expected: update.expected(),
            }),
        }
    }

    async fn query_by_source_status(
        &self,
        src_key: &str,
        status: BackupStatus,
        page: PageRequest,
    ) -> MappingResult<RecordPage> {
        let limit = page.normalized_limit();
        // '$' sorts right after '#', bounding the range to this status.
        let lower = match &page.after {
            Some(cursor) => status_sort_key(status, cursor.created_at),
            None => format!("{}#", status.as_str()),
        };
        let upper = format!("{}$", status.as_str());

        let rows = sqlx::query_as::<_, BackupRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM backup_records
             WHERE src_key = ? AND status_created_at > ? AND status_created_at < ?
             ORDER BY status_created_at ASC
             LIMIT ?"
        ))
        .bind(src_key)
        .bind(lower)
        .bind(upper)
        .bind(i64::from(limit) + 1)
        .fetch_all(&*self.db)
        .await?;

        Self::into_page(rows, limit, |record| Some(record.created_at))
    }

    async fn query_disowned_older_than(
        &self,
        cutoff: i64,
        page: PageRequest,
    ) -> MappingResult<RecordPage> {
        let limit = page.normalized_limit();

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {RECORD_COLUMNS} FROM backup_records WHERE status = "
        ));
        builder.push_bind(BackupStatus::Disowned.as_str());
        builder.push(" AND disowned_at <= ");
        builder.push_bind(cutoff);

        if let Some(cursor) = &page.after {
            builder.push(" AND (disowned_at, src_key, created_at) > (");
            builder.push_bind(cursor.sort_value);
            builder.push(", ");
            builder.push_bind(cursor.src_key.clone());
            builder.push(", ");
            builder.push_bind(cursor.created_at);
            builder.push(")");
        }

        builder.push(" ORDER BY disowned_at ASC, src_key ASC, created_at ASC LIMIT ");
        builder.push_bind(i64::from(limit) + 1);

        let rows: Vec<BackupRow> = builder.build_query_as().fetch_all(&*self.db).await?;

        Self::into_page(rows, limit, |record| record.disowned_at)
    }

    async fn delete(&self, src_key: &str, created_at: i64) -> MappingResult<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO reclaimed_generations (src_key, created_at, disowned_at)
             SELECT src_key, created_at, disowned_at FROM backup_records
             WHERE src_key = ? AND created_at = ? AND status = 'DISOWNED'
             ON CONFLICT (src_key, created_at) DO NOTHING",
        )
        .bind(src_key)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM backup_records WHERE src_key = ? AND created_at = ?")
            .bind(src_key)
            .bind(created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if result.rows_affected() == 0 {
            tracing::debug!("record ({}, {}) already removed", src_key, created_at);
        }
        Ok(())
    }

    async fn purge_reclaimed(&self, cutoff: i64) -> MappingResult<u64> {
        let result = sqlx::query("DELETE FROM reclaimed_generations WHERE disowned_at <= ?")
            .bind(cutoff)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> MappingResult<()> {
        let value = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        if value != 1 {
            return Err(MappingError::Sqlx(sqlx::Error::Protocol(format!(
                "unexpected probe result: {}",
                value
            ))));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteMappingStore {
        SqliteMappingStore::in_memory().await.unwrap()
    }

    async fn insert_active(store: &SqliteMappingStore, key: &str, created_at: i64) {
        store
            .put_if_absent(&BackupRecord::pending(key, created_at))
            .await
            .unwrap();
        store
            .conditional_update_status(key, created_at, StatusUpdate::activate())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_if_absent_rejects_duplicates() {
        let store = store().await;
        let record = BackupRecord::pending("a", 100);
        store.put_if_absent(&record).await.unwrap();

        let err = store.put_if_absent(&record).await.unwrap_err();
        assert!(matches!(err, MappingError::AlreadyExists { created_at: 100, .. }));
        assert!(err.is_race());
        assert_eq!(store.get("a", 100).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_conditional_update_checks_expected_status() {
        let store = store().await;
        store.put_if_absent(&BackupRecord::pending("a", 1)).await.unwrap();

        let active = store
            .conditional_update_status("a", 1, StatusUpdate::activate())
            .await
            .unwrap();
        assert_eq!(active.status, BackupStatus::Active);

        let err = store
            .conditional_update_status("a", 1, StatusUpdate::activate())
            .await
            .unwrap_err();
        assert!(matches!(err, MappingError::PreconditionFailed { .. }));

        let disowned = store
            .conditional_update_status(
                "a",
                1,
                StatusUpdate::disown(BackupStatus::Active, 50).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(disowned.status, BackupStatus::Disowned);
        assert_eq!(disowned.disowned_at, Some(50));
    }

    #[tokio::test]
    async fn test_conditional_update_on_missing_record() {
        let store = store().await;
        let err = store
            .conditional_update_status("ghost", 1, StatusUpdate::activate())
            .await
            .unwrap_err();
        assert!(err.is_race());
    }

    #[tokio::test]
    async fn test_status_created_at_follows_status() {
        let store = store().await;
        insert_active(&store, "a", 7).await;
        let stored: String = sqlx::query_scalar(
            "SELECT status_created_at FROM backup_records WHERE src_key = 'a'",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(stored, "ACTIVE#0000000000007");
    }

    #[tokio::test]
    async fn test_disowned_at_check_constraint() {
        let store = store().await;
        let mut record = BackupRecord::pending("a", 1);
        record.disowned_at = Some(5);
        let err = store.put_if_absent(&record).await.unwrap_err();
        assert!(matches!(err, MappingError::Sqlx(_)));
    }

    #[tokio::test]
    async fn test_query_by_source_status_pages_oldest_first() {
        let store = store().await;
        for t in [30, 10, 20, 40, 50] {
            insert_active(&store, "a", t).await;
        }
        insert_active(&store, "b", 15).await;
        store.put_if_absent(&BackupRecord::pending("a", 25)).await.unwrap();

        let first = store
            .query_by_source_status("a", BackupStatus::Active, PageRequest::first(2))
            .await
            .unwrap();
        let times: Vec<i64> = first.records.iter().map(|r| r.created_at).collect();
        assert_eq!(times, vec![10, 20]);

        let all: Vec<i64> = store
            .source_status_stream("a", BackupStatus::Active, 2)
            .map_ok(|r| r.created_at)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all, vec![10, 20, 30, 40, 50]);

        let pending: Vec<BackupRecord> = store
            .source_status_stream("a", BackupStatus::Pending, 10)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].created_at, 25);
    }

    #[tokio::test]
    async fn test_disowned_query_respects_cutoff_and_order() {
        let store = store().await;
        let disowned = [("a", 1, 300), ("b", 2, 100), ("c", 3, 100), ("d", 4, 900)];
        for (key, created_at, disowned_at) in disowned {
            insert_active(&store, key, created_at).await;
            store
                .conditional_update_status(
                    key,
                    created_at,
                    StatusUpdate::disown(BackupStatus::Active, disowned_at).unwrap(),
                )
                .await
                .unwrap();
        }
        insert_active(&store, "e", 5).await;

        let keys: Vec<String> = store
            .disowned_stream(300, 1)
            .map_ok(|r| r.src_key)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(keys, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = store().await;
        store.put_if_absent(&BackupRecord::pending("a", 1)).await.unwrap();
        store.delete("a", 1).await.unwrap();
        store.delete("a", 1).await.unwrap();
        assert_eq!(store.get("a", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reclaimed_generation_cannot_be_reinserted() {
        let store = store().await;
        insert_active(&store, "a", 1).await;
        store
            .conditional_update_status(
                "a",
                1,
                StatusUpdate::disown(BackupStatus::Active, 500).unwrap(),
            )
            .await
            .unwrap();
        store.delete("a", 1).await.unwrap();

        let err = store
            .put_if_absent(&BackupRecord::pending("a", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, MappingError::Reclaimed { created_at: 1, .. }));
        assert!(err.is_race());
        assert_eq!(store.get("a", 1).await.unwrap(), None);

        assert_eq!(store.purge_reclaimed(499).await.unwrap(), 0);
        assert_eq!(store.purge_reclaimed(500).await.unwrap(), 1);
        store
            .put_if_absent(&BackupRecord::pending("a", 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_deleting_live_record_leaves_no_tombstone() {
        let store = store().await;
        store.put_if_absent(&BackupRecord::pending("a", 1)).await.unwrap();
        store.delete("a", 1).await.unwrap();
        store.put_if_absent(&BackupRecord::pending("a", 1)).await.unwrap();
    }

    fn active_row(created_at: i64) -> BackupRow {
        BackupRow {
            src_key: "a".into(),
            created_at,
            status: "ACTIVE".into(),
            status_created_at: status_sort_key(BackupStatus::Active, created_at),
            disowned_at: None,
            dst_key: format!("a.copy.{}", created_at),
        }
    }

    #[test]
    fn test_page_cursor_never_defaults_sort_value() {
        let rows = vec![active_row(1), active_row(2)];
        let err = SqliteMappingStore::into_page(rows, 1, |record| record.disowned_at).unwrap_err();
        assert!(matches!(
            err,
            MappingError::Corrupt(CorruptRecord::DisownedAt { created_at: 1, .. })
        ));

        let page = SqliteMappingStore::into_page(vec![active_row(1), active_row(2)], 1, |record| {
            Some(record.created_at)
        })
        .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.next.map(|cursor| cursor.sort_value), Some(1));
    }

    #[tokio::test]
    async fn test_migrate_is_repeatable() {
        let store = store().await;
        store.migrate().await.unwrap();
        store.health_check().await.unwrap();
    }
}
