//! src/services/replicator.rs
//!
//! Turns source-store notifications into mapping-table transitions and
//! destination copies. The handler keeps no state between calls, so it can
//! be invoked concurrently and repeatedly for the same notification; all
//! coordination happens through conditional writes on the mapping table.

use crate::{
    models::{
        notification::{Notification, NotificationKind},
        record::{BackupRecord, BackupStatus, InvalidTransition, StatusUpdate},
    },
    services::{
        clock::Clock,
        mapping_store::{DEFAULT_PAGE_SIZE, MappingError, MappingStore, MappingStoreExt},
        object_store::{Replica, StorageError},
    },
};
use futures::TryStreamExt;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Retention passes allowed before a surplus of active generations is
/// reported as an invariant violation. Extra passes absorb activations
/// racing in from concurrent invocations.
pub const ENFORCEMENT_PASSES: usize = 3;

#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Retention width: maximum active generations per source key.
    pub max_active: usize,
    /// Copy attempts per invocation, at least one.
    pub copy_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub copy_backoff: Duration,
    pub page_size: u32,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            max_active: 3,
            copy_attempts: 1,
            copy_backoff: Duration::from_millis(100),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("copy of `{src_key}` to `{dst_key}` failed: {source}")]
    CopyFailed {
        src_key: String,
        dst_key: String,
        #[source]
        source: StorageError,
    },
    #[error(
        "`{src_key}` has {active} active generations after retention enforcement (max {max_active})"
    )]
    InvariantViolation {
        src_key: String,
        active: usize,
        max_active: usize,
    },
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// What handling a notification did.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplicationOutcome {
    /// The generation was copied and is now active.
    Activated {
        src_key: String,
        created_at: i64,
        dst_key: String,
        /// Older generations disowned to respect the retention width.
        retired: usize,
    },
    /// The generation was already handled; nothing changed.
    Duplicate {
        src_key: String,
        created_at: i64,
        status: BackupStatus,
    },
    /// Generations disowned by a deletion.
    Disowned { src_key: String, count: usize },
}

/// Stateless notification handler.
#[derive(Clone)]
pub struct Replicator {
    store: Arc<dyn MappingStore>,
    replica: Replica,
    clock: Arc<dyn Clock>,
    config: ReplicatorConfig,
}

impl Replicator {
    pub fn new(
        store: Arc<dyn MappingStore>,
        replica: Replica,
        clock: Arc<dyn Clock>,
        config: ReplicatorConfig,
    ) -> Self {
        Self {
            store,
            replica,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    pub async fn handle(
        &self,
        notification: &Notification,
    ) -> Result<ReplicationOutcome, ReplicationError> {
        match notification.kind {
            NotificationKind::Created => {
                self.on_created(&notification.src_key, notification.event_time)
                    .await
            }
            NotificationKind::Deleted => {
                self.on_deleted(&notification.src_key, notification.event_time)
                    .await
            }
        }
    }

    /// Record, copy, activate, then enforce the retention width.
    ///
    /// A redelivered creation whose record is still `PENDING` resumes the
    /// copy; one whose record moved on, or was already reclaimed, is a no-op.
    async fn on_created(
        &self,
        src_key: &str,
        created_at: i64,
    ) -> Result<ReplicationOutcome, ReplicationError> {
        let fresh = BackupRecord::pending(src_key, created_at);
        let record = match self.store.put_if_absent(&fresh).await {
            Ok(()) => {
                info!("recorded pending generation ({}, {})", src_key, created_at);
                fresh
            }
            Err(MappingError::Reclaimed { .. }) => {
                info!(
                    "ignoring late creation of reclaimed generation ({}, {})",
                    src_key, created_at
                );
                return Ok(ReplicationOutcome::Duplicate {
                    src_key: src_key.to_string(),
                    created_at,
                    status: BackupStatus::Disowned,
                });
            }
            Err(err) if err.is_race() => match self.store.get(src_key, created_at).await? {
                Some(existing) if existing.status == BackupStatus::Pending => {
                    debug!(
                        "resuming pending copy for ({}, {}) on redelivery",
                        src_key, created_at
                    );
                    existing
                }
                existing => {
                    let status = existing.map_or(BackupStatus::Disowned, |r| r.status);
                    debug!(
                        "duplicate creation for ({}, {}), record is {}",
                        src_key, created_at, status
                    );
                    return Ok(ReplicationOutcome::Duplicate {
                        src_key: src_key.to_string(),
                        created_at,
                        status,
                    });
                }
            },
            Err(err) => return Err(err.into()),
        };

        self.copy_with_backoff(&record).await?;

        if let Err(err) = self
            .store
            .conditional_update_status(src_key, created_at, StatusUpdate::activate())
            .await
        {
            if !err.is_race() {
                return Err(err.into());
            }
            // A concurrent duplicate activated it, or a deletion disowned it.
            let status = self
                .store
                .get(src_key, created_at)
                .await?
                .map_or(BackupStatus::Disowned, |r| r.status);
            debug!(
                "activation of ({}, {}) lost a race, record is {}",
                src_key, created_at, status
            );
            return Ok(ReplicationOutcome::Duplicate {
                src_key: src_key.to_string(),
                created_at,
                status,
            });
        }
        info!("activated ({}, {}) -> {}", src_key, created_at, record.dst_key);

        let retired = self.enforce_retention(src_key).await?;

        Ok(ReplicationOutcome::Activated {
            src_key: src_key.to_string(),
            created_at,
            dst_key: record.dst_key,
            retired,
        })
    }

    /// Disown active and pending generations created at or before the
    /// deletion. Newer generations belong to a re-creation that raced a
    /// stale delete and are left alone.
    async fn on_deleted(
        &self,
        src_key: &str,
        event_time: i64,
    ) -> Result<ReplicationOutcome, ReplicationError> {
        let now = self.clock.now_millis();
        let mut count = 0;

        for status in [BackupStatus::Active, BackupStatus::Pending] {
            let update = StatusUpdate::disown(status, now)?;
            let mut candidates =
                self.store
                    .source_status_stream(src_key, status, self.config.page_size);

            while let Some(record) = candidates.try_next().await? {
                // oldest first: everything after this one is newer too
                if record.created_at > event_time {
                    debug!(
                        "keeping ({}, {}): created after deletion at {}",
                        src_key, record.created_at, event_time
                    );
                    break;
                }
                match self
                    .store
                    .conditional_update_status(src_key, record.created_at, update)
                    .await
                {
                    Ok(_) => {
                        count += 1;
                        info!(
                            "disowned ({}, {}) after source deletion",
                            src_key, record.created_at
                        );
                    }
                    Err(err) if err.is_race() => {
                        debug!("({}, {}) already moved on: {}", src_key, record.created_at, err)
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if count == 0 {
            debug!("deletion of {} matched no live generation", src_key);
        }

        Ok(ReplicationOutcome::Disowned {
            src_key: src_key.to_string(),
            count,
        })
    }

    async fn copy_with_backoff(&self, record: &BackupRecord) -> Result<u64, ReplicationError> {
        let attempts = self.config.copy_attempts.max(1);
        let mut delay = self.config.copy_backoff;
        let mut attempt = 1;

        loop {
            match self.replica.copy(&record.src_key, &record.dst_key).await {
                Ok(size) => return Ok(size),
                Err(err @ StorageError::Io(_)) if attempt < attempts => {
                    warn!(
                        "copy attempt {}/{} for {} failed: {}; retrying in {:?}",
                        attempt, attempts, record.src_key, err, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(err) => {
                    warn!(
                        "copy of {} failed, ({}, {}) stays PENDING: {}",
                        record.src_key, record.src_key, record.created_at, err
                    );
                    return Err(ReplicationError::CopyFailed {
                        src_key: record.src_key.clone(),
                        dst_key: record.dst_key.clone(),
                        source: err,
                    });
                }
            }
        }
    }

    /// Disown the oldest active generations beyond the retention width.
    ///
    /// Recomputed from an ordered query on every call. Returns how many
    /// generations this call disowned.
    async fn enforce_retention(&self, src_key: &str) -> Result<usize, ReplicationError> {
        let max_active = self.config.max_active;
        let mut retired = 0;

        for pass in 0..=ENFORCEMENT_PASSES {
            let active: Vec<BackupRecord> = self
                .store
                .source_status_stream(src_key, BackupStatus::Active, self.config.page_size)
                .try_collect()
                .await?;

            if active.len() <= max_active {
                return Ok(retired);
            }
            if pass == ENFORCEMENT_PASSES {
                error!(
                    "{} still has {} active generations after {} retention passes (max {})",
                    src_key,
                    active.len(),
                    ENFORCEMENT_PASSES,
                    max_active
                );
                return Err(ReplicationError::InvariantViolation {
                    src_key: src_key.to_string(),
                    active: active.len(),
                    max_active,
                });
            }

            let update = StatusUpdate::disown(BackupStatus::Active, self.clock.now_millis())?;
            let excess = active.len() - max_active;
            for victim in active.iter().take(excess) {
                match self
                    .store
                    .conditional_update_status(src_key, victim.created_at, update)
                    .await
                {
                    Ok(_) => {
                        retired += 1;
                        info!(
                            "disowned ({}, {}) over retention width {}",
                            src_key, victim.created_at, max_active
                        );
                    }
                    Err(err) if err.is_race() => {
                        debug!("({}, {}) already moved on: {}", src_key, victim.created_at, err)
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Ok(retired)
    }
}
