// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod error;
pub mod ingest;
pub mod lock;
pub mod media;
pub mod metrics;
pub mod reconcile;
pub mod store;
pub mod sync;

// ---- Re-exports for stable public API ----
pub use crate::config::SyncConfig;
pub use crate::error::{SyncError, SyncResult};
pub use crate::store::{Media, Post, Store};
pub use crate::sync::{run_once, SyncReport};
