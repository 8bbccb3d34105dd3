pub mod mirror;

pub use mirror::{FileConfig, SyncConfig};
