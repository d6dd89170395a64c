//! Versioned backup replication.
//!
//! Source-store notifications drive each backup generation through
//! `PENDING -> ACTIVE -> DISOWNED`, and a periodic sweep reclaims disowned
//! copies once their grace period has passed. The mapping table's
//! conditional writes are the only coordination between invocations.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

use axum::Router;
use services::{
    cleaner::{Cleaner, CleanerConfig},
    clock::Clock,
    mapping_store::MappingStore,
    object_store::Replica,
    replicator::{Replicator, ReplicatorConfig},
};
use std::sync::Arc;

/// Shared handler state. Holds handles only; no domain state lives here.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MappingStore>,
    pub replica: Replica,
    pub replicator: Replicator,
    pub cleaner: Cleaner,
    pub source_bucket: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn MappingStore>,
        replica: Replica,
        clock: Arc<dyn Clock>,
        replicator_config: ReplicatorConfig,
        cleaner_config: CleanerConfig,
        source_bucket: Option<String>,
    ) -> Self {
        let replicator = Replicator::new(
            store.clone(),
            replica.clone(),
            clock.clone(),
            replicator_config,
        );
        let cleaner = Cleaner::new(store.clone(), replica.clone(), clock, cleaner_config);
        Self {
            store,
            replica,
            replicator,
            cleaner,
            source_bucket: source_bucket.map(Arc::from),
        }
    }
}

/// Build the application router with its state attached.
pub fn app(state: AppState) -> Router {
    routes::routes::routes().with_state(state)
}
