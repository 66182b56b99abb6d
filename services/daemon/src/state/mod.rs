//! Local state persistence for the daemon.
//!
//! This module provides SQLite-based storage for instance records: lifecycle
//! state, trash marker, image reference, resources and the opaque backend
//! configuration blob.
//!
//! The registry is flushed here after every committed state transition so
//! the daemon can reconstruct it after a restart.

mod store;

pub use store::{InstanceRecord, StateStore, StateStoreError};
