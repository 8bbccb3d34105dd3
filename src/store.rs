//! Local post store: the JSON document read by the site generator.
//!
//! The file is always rewritten in full. Writes go to a temporary sibling which is
//! fsynced and renamed over the target, so readers see either the old or the new
//! document and never a truncated one.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// One downloaded asset as exposed to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Media {
    pub width: u32,
    pub height: u32,
    pub url: String,
    pub size: u64,
}

/// One mirrored channel post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub date: DateTime<FixedOffset>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub images: Vec<Media>,
}

/// Full post collection, ordered by id descending (newest first).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Store {
    posts: Vec<Post>,
}

impl Store {
    /// Canonicalizes arbitrary input: one record per id (the last one given wins),
    /// sorted newest first.
    pub fn from_posts(posts: Vec<Post>) -> Self {
        let mut by_id: BTreeMap<i64, Post> = BTreeMap::new();
        for p in posts {
            by_id.insert(p.id, p);
        }
        Self {
            posts: by_id.into_values().rev().collect(),
        }
    }

    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    pub fn into_posts(self) -> Vec<Post> {
        self.posts
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<&Post> {
        self.posts.iter().find(|p| p.id == id)
    }

    /// Highest post id in the store; the watermark for the next run.
    pub fn max_id(&self) -> Option<i64> {
        self.posts.iter().map(|p| p.id).max()
    }

    pub fn is_canonical(&self) -> bool {
        self.posts.windows(2).all(|w| w[0].id > w[1].id)
    }
}

/// Load the store. A missing file is the first-run state and yields an empty store.
pub fn load(path: &Path) -> SyncResult<Store> {
    let raw = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::info!(target: "store", path = %path.display(), "no store yet, starting empty");
            return Ok(Store::default());
        }
        Err(e) => return Err(SyncError::store(path, e)),
    };

    if raw.trim().is_empty() {
        return Ok(Store::default());
    }

    let posts: Vec<Post> = serde_json::from_str(&raw).map_err(|source| SyncError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let loaded = posts.len();
    let store = Store::from_posts(posts);
    if store.len() != loaded {
        tracing::warn!(
            target: "store",
            loaded,
            kept = store.len(),
            "duplicate ids in store file collapsed"
        );
    }
    Ok(store)
}

/// Serialize and atomically replace the store file.
pub fn save(path: &Path, store: &Store) -> SyncResult<()> {
    let store = if store.is_canonical() {
        store.clone()
    } else {
        Store::from_posts(store.posts.clone())
    };
    let mut json = serde_json::to_vec_pretty(&store).map_err(|source| SyncError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    json.push(b'\n');

    let staged = StagedWrite::stage(path, &json).map_err(|e| SyncError::store(path, e))?;
    staged.commit().map_err(|e| SyncError::store(path, e))?;
    tracing::debug!(target: "store", path = %path.display(), posts = store.len(), "store saved");
    Ok(())
}

/// Bytes fully written and synced to a temporary sibling of `target`, not yet visible.
/// Dropping without `commit` removes the temporary file and leaves `target` untouched.
#[derive(Debug)]
pub struct StagedWrite {
    tmp: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedWrite {
    pub fn stage(target: &Path, bytes: &[u8]) -> io::Result<Self> {
        let dir = match target.parent() {
            Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no file name"))?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let tmp = dir.join(format!(".{file_name}.{}.{nanos}.tmp", std::process::id()));

        let staged = Self {
            tmp,
            target: target.to_path_buf(),
            committed: false,
        };
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staged.tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        Ok(staged)
    }

    pub fn temp_path(&self) -> &Path {
        &self.tmp
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn commit(mut self) -> io::Result<()> {
        fs::rename(&self.tmp, &self.target)?;
        self.committed = true;
        if let Some(parent) = self.target.parent() {
            if let Ok(d) = fs::File::open(parent) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }
}

impl Drop for StagedWrite {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

/// Atomic replace of an arbitrary file (used for media and metrics textfiles too).
pub fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<()> {
    StagedWrite::stage(target, bytes)?.commit()
}
