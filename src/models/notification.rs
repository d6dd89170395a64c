//! Source-store change notifications and the envelopes they arrive in.
//!
//! Three shapes are accepted:
//! - the direct form `{"kind", "srcKey", "eventTime"}`
//! - an event-bus envelope (`detail-type` of `Object Created` / `Object Deleted`)
//! - a storage-event batch (`Records` with `ObjectCreated:*` / `ObjectRemoved:*`)

use crate::{
    models::record::{MAX_SOURCE_KEY_LEN, MAX_TIMESTAMP_MS},
    services::object_store::ensure_key_safe,
};
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    Created,
    Deleted,
}

/// A single change on the source store. Delivery is at-least-once and may
/// be out of order for the same key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub kind: NotificationKind,
    pub src_key: String,
    /// Epoch milliseconds.
    pub event_time: i64,
}

impl Notification {
    pub fn created(src_key: impl Into<String>, event_time: i64) -> Self {
        Self {
            kind: NotificationKind::Created,
            src_key: src_key.into(),
            event_time,
        }
    }

    pub fn deleted(src_key: impl Into<String>, event_time: i64) -> Self {
        Self {
            kind: NotificationKind::Deleted,
            src_key: src_key.into(),
            event_time,
        }
    }

    /// Reject keys the object stores would refuse, either as given or once
    /// suffixed into a destination key, and timestamps that do not fit the
    /// padded sort key.
    pub fn validate(&self) -> Result<(), NotificationError> {
        if self.src_key.len() > MAX_SOURCE_KEY_LEN {
            return Err(NotificationError::InvalidKey(self.src_key.clone()));
        }
        ensure_key_safe(&self.src_key)
            .map_err(|_| NotificationError::InvalidKey(self.src_key.clone()))?;
        if !(0..=MAX_TIMESTAMP_MS).contains(&self.event_time) {
            return Err(NotificationError::TimestampOutOfRange(self.event_time));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("malformed notification: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid source key `{0}`")]
    InvalidKey(String),
    #[error("event time {0} out of range")]
    TimestampOutOfRange(i64),
}

/// Any accepted notification body.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum NotificationEnvelope {
    Direct(Notification),
    EventBus(EventBusEvent),
    Batch(StorageEventBatch),
}

#[derive(Deserialize, Debug)]
pub struct EventBusEvent {
    #[serde(rename = "detail-type")]
    pub detail_type: String,
    pub time: DateTime<Utc>,
    pub detail: ObjectDetail,
}

#[derive(Deserialize, Debug)]
pub struct StorageEventBatch {
    #[serde(rename = "Records")]
    pub records: Vec<StorageEvent>,
}

#[derive(Deserialize, Debug)]
pub struct StorageEvent {
    #[serde(rename = "eventName")]
    pub event_name: String,
    #[serde(rename = "eventTime")]
    pub event_time: DateTime<Utc>,
    pub s3: ObjectDetail,
}

#[derive(Deserialize, Debug)]
pub struct ObjectDetail {
    pub bucket: BucketRef,
    pub object: ObjectRef,
}

#[derive(Deserialize, Debug)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Deserialize, Debug)]
pub struct ObjectRef {
    pub key: String,
}

impl NotificationEnvelope {
    /// Parse a raw JSON body.
    pub fn from_slice(body: &[u8]) -> Result<Self, NotificationError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Flatten into validated notifications.
    ///
    /// Unrecognized event types are skipped. When `source_bucket` is set,
    /// events for any other bucket are skipped as well.
    pub fn into_notifications(
        self,
        source_bucket: Option<&str>,
    ) -> Result<Vec<Notification>, NotificationError> {
        let from_source = |name: &str| source_bucket.is_none_or(|expected| expected == name);

        let notifications = match self {
            Self::Direct(notification) => vec![notification],
            Self::EventBus(event) => {
                let kind = match event.detail_type.as_str() {
                    "Object Created" => Some(NotificationKind::Created),
                    "Object Deleted" => Some(NotificationKind::Deleted),
                    _ => None,
                };
                match kind {
                    Some(kind) if from_source(&event.detail.bucket.name) => vec![Notification {
                        kind,
                        src_key: event.detail.object.key,
                        event_time: event.time.timestamp_millis(),
                    }],
                    _ => {
                        tracing::debug!(
                            "skipping event `{}` for bucket {}",
                            event.detail_type,
                            event.detail.bucket.name
                        );
                        Vec::new()
                    }
                }
            }
            Self::Batch(batch) => {
                let mut out = Vec::with_capacity(batch.records.len());
                for record in batch.records {
                    let kind = if record.event_name.starts_with("ObjectCreated") {
                        NotificationKind::Created
                    } else if record.event_name.starts_with("ObjectRemoved") {
                        NotificationKind::Deleted
                    } else {
                        tracing::debug!("skipping storage event `{}`", record.event_name);
                        continue;
                    };
                    if !from_source(&record.s3.bucket.name) {
                        tracing::debug!("skipping event for bucket {}", record.s3.bucket.name);
                        continue;
                    }
                    out.push(Notification {
                        kind,
                        src_key: decode_event_key(&record.s3.object.key)?,
                        event_time: record.event_time.timestamp_millis(),
                    });
                }
                out
            }
        };

        for notification in &notifications {
            notification.validate()?;
        }
        Ok(notifications)
    }
}

/// Storage-event keys are URL-encoded with `+` standing for a space.
fn decode_event_key(raw: &str) -> Result<String, NotificationError> {
    let plus_decoded = raw.replace('+', " ");
    percent_decode_str(&plus_decoded)
        .decode_utf8()
        .map(|key| key.into_owned())
        .map_err(|_| NotificationError::InvalidKey(raw.to_string()))
}
