//! Core data models for the backup pipeline.
//!
//! `record` maps onto the `backup_records` table via `sqlx::FromRow`;
//! `notification` describes the change events fed to the Replicator.

pub mod notification;
pub mod record;
