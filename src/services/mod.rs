//! Replication services: the mapping table, object stores, and the
//! Replicator/Cleaner pair that drive generations through their lifecycle.

pub mod cleaner;
pub mod clock;
pub mod mapping_store;
pub mod object_store;
pub mod replicator;
