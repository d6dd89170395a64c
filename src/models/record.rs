//! Represents one backup generation of a source object.

use crate::services::object_store::MAX_OBJECT_KEY_LEN;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Largest timestamp (epoch milliseconds) that fits the 13-digit padded
/// sort key. Anything larger would break lexical ordering of `status_created_at`.
pub const MAX_TIMESTAMP_MS: i64 = 9_999_999_999_999;

const DESTINATION_INFIX: &str = ".copy.";

/// Longest source key whose destination key still fits the object store,
/// whatever its timestamp.
pub const MAX_SOURCE_KEY_LEN: usize = MAX_OBJECT_KEY_LEN - DESTINATION_INFIX.len() - 13;

/// Lifecycle status of a backup generation.
///
/// Removal is not a status: once the Cleaner reclaims a generation the row
/// is gone.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupStatus {
    /// Destination copy in flight.
    Pending,
    /// Live backup, counted toward the retention width.
    Active,
    /// Scheduled for reclamation once the grace period elapses.
    Disowned,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Disowned => "DISOWNED",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: BackupStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active)
                | (Self::Pending, Self::Disowned)
                | (Self::Active, Self::Disowned)
        )
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown backup status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for BackupStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "ACTIVE" => Ok(Self::Active),
            "DISOWNED" => Ok(Self::Disowned),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A stored row that does not decode into a valid record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorruptRecord {
    #[error(transparent)]
    Status(#[from] UnknownStatus),
    #[error("record ({src_key}, {created_at}) is {status} with disowned_at {disowned_at:?}")]
    DisownedAt {
        src_key: String,
        created_at: i64,
        status: BackupStatus,
        disowned_at: Option<i64>,
    },
}

/// Rejected attempt to build an illegal status transition.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid status transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: BackupStatus,
    pub to: BackupStatus,
}

/// A checked status transition, applied with a conditional write.
///
/// Only legal transitions can be constructed, and `disowned_at` is carried
/// exactly when the target is `DISOWNED`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    expected: BackupStatus,
    new: BackupStatus,
    disowned_at: Option<i64>,
}

impl StatusUpdate {
    /// `PENDING -> ACTIVE`, after the destination copy succeeded.
    pub fn activate() -> Self {
        Self {
            expected: BackupStatus::Pending,
            new: BackupStatus::Active,
            disowned_at: None,
        }
    }

    /// `PENDING|ACTIVE -> DISOWNED`, stamping the start of the grace period.
    pub fn disown(from: BackupStatus, disowned_at: i64) -> Result<Self, InvalidTransition> {
        let to = BackupStatus::Disowned;
        if !from.can_transition_to(to) {
            return Err(InvalidTransition { from, to });
        }
        Ok(Self {
            expected: from,
            new: to,
            disowned_at: Some(disowned_at),
        })
    }

    pub fn expected(&self) -> BackupStatus {
        self.expected
    }

    pub fn new_status(&self) -> BackupStatus {
        self.new
    }

    pub fn disowned_at(&self) -> Option<i64> {
        self.disowned_at
    }
}

/// A single backup generation, keyed by `(src_key, created_at)`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// Source object key (partition key).
    pub src_key: String,

    /// Generation time in epoch milliseconds (sort key).
    pub created_at: i64,

    pub status: BackupStatus,

    /// Start of the grace period; set exactly while `DISOWNED`.
    pub disowned_at: Option<i64>,

    /// Destination object key holding this generation's copy.
    pub dst_key: String,
}

impl BackupRecord {
    /// A freshly observed generation, before its copy exists.
    pub fn pending(src_key: impl Into<String>, created_at: i64) -> Self {
        let src_key = src_key.into();
        let dst_key = destination_key(&src_key, created_at);
        Self {
            src_key,
            created_at,
            status: BackupStatus::Pending,
            disowned_at: None,
            dst_key,
        }
    }

    /// Derived `STATUS#createdAt` sort key for the by-source-status index.
    pub fn status_created_at(&self) -> String {
        status_sort_key(self.status, self.created_at)
    }
}

/// Destination key for a generation. Deterministic so that a retried copy
/// lands on the same object.
pub fn destination_key(src_key: &str, created_at: i64) -> String {
    format!("{}{}{}", src_key, DESTINATION_INFIX, created_at)
}

/// `STATUS#` followed by the timestamp zero-padded to 13 digits.
pub fn status_sort_key(status: BackupStatus, created_at: i64) -> String {
    format!("{}#{:013}", status.as_str(), created_at)
}

/// Raw row as stored in SQLite; status is decoded separately so a corrupt
/// value surfaces as an error instead of a panic.
#[derive(FromRow, Debug)]
pub struct BackupRow {
    pub src_key: String,
    pub created_at: i64,
    pub status: String,
    pub status_created_at: String,
    pub disowned_at: Option<i64>,
    pub dst_key: String,
}

impl TryFrom<BackupRow> for BackupRecord {
    type Error = CorruptRecord;

    /// `disowned_at` must be set exactly when the status is `DISOWNED`.
    fn try_from(row: BackupRow) -> Result<Self, Self::Error> {
        let status: BackupStatus = row.status.parse()?;
        if (status == BackupStatus::Disowned) != row.disowned_at.is_some() {
            return Err(CorruptRecord::DisownedAt {
                src_key: row.src_key,
                created_at: row.created_at,
                status,
                disowned_at: row.disowned_at,
            });
        }
        Ok(Self {
            status,
            src_key: row.src_key,
            created_at: row.created_at,
            disowned_at: row.disowned_at,
            dst_key: row.dst_key,
        })
    }
}
