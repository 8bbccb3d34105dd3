// src/lock.rs
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// Exclusive ownership of the store and media directory for one run.
///
/// Held as a pid file created with `create_new`; removed on drop. A lock older than
/// `stale_after` is assumed to belong to a crashed run and is taken over.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Lock file used for a given store path: `posts.json` -> `posts.json.lock`.
    pub fn path_for(store_path: &Path) -> PathBuf {
        let mut name = store_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "store".into());
        name.push(".lock");
        store_path.with_file_name(name)
    }

    pub fn acquire(path: &Path, stale_after: Duration) -> SyncResult<Self> {
        match Self::create(path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(SyncError::store(path, e)),
        }

        match age_of(path) {
            Some(age) if age >= stale_after => Self::take_over(path, stale_after),
            _ => Err(SyncError::Locked(path.to_path_buf())),
        }
    }

    /// Replace a stale lock. Takeovers are serialized through a `.takeover` guard
    /// file, and staleness is checked again under the guard: a run that lost the
    /// race finds a fresh lock and backs off instead of removing it.
    fn take_over(path: &Path, stale_after: Duration) -> SyncResult<Self> {
        let _guard = TakeoverGuard::acquire(path)?;

        match age_of(path) {
            Some(age) if age >= stale_after => {
                let holder = fs::read_to_string(path).unwrap_or_default();
                tracing::warn!(
                    target: "lock",
                    path = %path.display(),
                    holder = holder.trim(),
                    age_secs = age.as_secs(),
                    "taking over stale run lock"
                );
                match fs::remove_file(path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(SyncError::store(path, e)),
                }
            }
            Some(_) => return Err(SyncError::Locked(path.to_path_buf())),
            // Released since we looked.
            None => {}
        }

        Self::create(path).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => SyncError::Locked(path.to_path_buf()),
            _ => SyncError::store(path, e),
        })
    }

    fn create(path: &Path) -> io::Result<Self> {
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        write!(f, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn age_of(path: &Path) -> Option<Duration> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
}

/// Held while one run replaces a stale lock. A guard left behind by a crash keeps
/// reporting `Locked` until an operator removes it.
struct TakeoverGuard {
    path: PathBuf,
}

impl TakeoverGuard {
    fn acquire(lock_path: &Path) -> SyncResult<Self> {
        let mut name = lock_path.as_os_str().to_os_string();
        name.push(".takeover");
        let path = PathBuf::from(name);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(SyncError::Locked(path)),
            Err(e) => Err(SyncError::store(path, e)),
        }
    }
}

impl Drop for TakeoverGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(target: "lock", path = %self.path.display(), error = %e, "could not release run lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_sits_next_to_store() {
        assert_eq!(
            RunLock::path_for(Path::new("data/tg/posts.json")),
            PathBuf::from("data/tg/posts.json.lock")
        );
    }

    #[test]
    fn second_acquire_fails_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("posts.json.lock");
        let first = RunLock::acquire(&p, Duration::from_secs(3600)).unwrap();
        let contents = fs::read_to_string(&p).unwrap();
        assert_eq!(contents, std::process::id().to_string());

        let second = RunLock::acquire(&p, Duration::from_secs(3600));
        assert!(matches!(second, Err(SyncError::Locked(_))));

        drop(first);
        assert!(!p.exists());
        assert!(RunLock::acquire(&p, Duration::from_secs(3600)).is_ok());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("posts.json.lock");
        fs::write(&p, "99999").unwrap();
        let lock = RunLock::acquire(&p, Duration::ZERO).unwrap();
        assert_eq!(lock.path(), p.as_path());
        assert_eq!(fs::read_to_string(&p).unwrap(), std::process::id().to_string());
        assert!(!dir.path().join("posts.json.lock.takeover").exists());
    }

    #[test]
    fn takeover_in_progress_refuses_a_second_one() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("posts.json.lock");
        fs::write(&p, "99999").unwrap();
        fs::write(dir.path().join("posts.json.lock.takeover"), "").unwrap();

        let res = RunLock::acquire(&p, Duration::ZERO);
        assert!(matches!(res, Err(SyncError::Locked(ref g)) if g.ends_with("posts.json.lock.takeover")));
        assert_eq!(fs::read_to_string(&p).unwrap(), "99999");
    }

    #[test]
    fn racing_takeovers_of_one_stale_lock_admit_a_single_run() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("posts.json.lock");
        let f = fs::File::create(&p).unwrap();
        f.set_modified(std::time::SystemTime::now() - Duration::from_secs(7200))
            .unwrap();
        drop(f);

        let barrier = std::sync::Barrier::new(8);
        let won: Vec<RunLock> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        RunLock::acquire(&p, Duration::from_secs(3600))
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap().ok())
                .collect()
        });
        assert_eq!(won.len(), 1);
    }
}
