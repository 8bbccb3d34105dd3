// src/error.rs
use std::path::PathBuf;

/// Failure taxonomy of one sync run.
///
/// `Transient` and `Permanent` come from the remote API and are fatal for the run
/// (re-running later is the retry). `Asset` is isolated to a single media download.
/// `Store`, `Corrupt` and `Locked` are local and fatal.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("transient remote error: {0}")]
    Transient(String),

    #[error("permanent remote error: {0}")]
    Permanent(String),

    #[error("asset {file_id} could not be materialized: {reason}")]
    Asset { file_id: String, reason: String },

    #[error("malformed message {id}: {reason}")]
    Malformed { id: i64, reason: String },

    #[error("store I/O failed at {}: {source}", .path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store file {} is not a valid post array: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("another run holds the lock at {}", .0.display())]
    Locked(PathBuf),
}

impl SyncError {
    pub fn store(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Store {
            path: path.into(),
            source,
        }
    }

    /// True when re-running the process later may succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Locked(_))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
