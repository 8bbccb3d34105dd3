//! Media materialization: download-once storage of post assets in a flat directory.
//!
//! Path policy: one slot per kind per post, `{post_id}.{ext}`. A post carrying two
//! assets of the same kind keeps the first and reports the second as failed
//! rather than overwriting it.
//!
//! A file the saved store already points at is never replaced in place. Refreshed
//! bytes are staged next to it and only renamed over it by [`commit_replacements`]
//! once the new store is on disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use metrics::counter;

use crate::error::{SyncError, SyncResult};
use crate::ingest::types::FeedApi;
use crate::ingest::{MediaRef, PostDraft};
use crate::store::{self, Media, Post, StagedWrite, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Photo,
    Sticker,
    AnimatedSticker,
    VideoSticker,
}

impl MediaKind {
    pub const ALL: [MediaKind; 4] = [
        MediaKind::Photo,
        MediaKind::Sticker,
        MediaKind::AnimatedSticker,
        MediaKind::VideoSticker,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            MediaKind::Photo => "jpg",
            MediaKind::Sticker => "webp",
            MediaKind::AnimatedSticker => "tgs",
            MediaKind::VideoSticker => "webm",
        }
    }
}

/// Where assets live on disk and how consumers address them.
#[derive(Debug, Clone)]
pub struct MediaLayout {
    dir: PathBuf,
    url_prefix: String,
}

impl MediaLayout {
    pub fn new(dir: impl Into<PathBuf>, url_prefix: &str) -> Self {
        Self {
            dir: dir.into(),
            url_prefix: url_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn file_name(&self, post_id: i64, kind: MediaKind) -> String {
        format!("{post_id}.{}", kind.extension())
    }

    pub fn path_for(&self, post_id: i64, kind: MediaKind) -> PathBuf {
        self.dir.join(self.file_name(post_id, kind))
    }

    pub fn url_for(&self, post_id: i64, kind: MediaKind) -> String {
        format!("{}/{}", self.url_prefix, self.file_name(post_id, kind))
    }

    /// Every path a post id may own, whatever kinds it actually had.
    pub fn all_paths_for(&self, post_id: i64) -> Vec<PathBuf> {
        MediaKind::ALL
            .iter()
            .map(|k| self.path_for(post_id, *k))
            .collect()
    }

    /// Map a stored url back to its file. Only urls under our prefix pointing at a
    /// plain file name resolve; anything else is not ours to delete.
    pub fn path_for_url(&self, url: &str) -> Option<PathBuf> {
        let name = url.strip_prefix(&self.url_prefix)?.strip_prefix('/')?;
        if name.is_empty() || name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return None;
        }
        Some(self.dir.join(name))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializePolicy {
    /// Existing file is authoritative; zero remote calls when present.
    ReuseExisting,
    /// Fetch again unless the stored record for the slot still matches the asset
    /// (edited posts may carry a replaced photo).
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Downloaded,
    Reused,
}

/// One resolved asset.
#[derive(Debug)]
pub struct Materialized {
    pub media: Media,
    pub outcome: Outcome,
    /// Replacement for a file already on disk, not yet renamed into place.
    pub staged: Option<StagedWrite>,
}

impl Materialized {
    fn on_disk(media: Media, outcome: Outcome) -> Self {
        Self {
            media,
            outcome,
            staged: None,
        }
    }
}

/// Posts with their media resolved, plus per-asset accounting.
#[derive(Debug, Default)]
pub struct MaterializedBatch {
    pub posts: Vec<Post>,
    /// Refreshed files waiting for the store to be saved.
    pub staged: Vec<StagedWrite>,
    pub downloaded: usize,
    pub reused: usize,
    pub failed: usize,
}

impl MaterializedBatch {
    pub fn degraded(&self) -> bool {
        self.failed > 0
    }
}

pub struct Materializer {
    api: Arc<dyn FeedApi>,
    layout: MediaLayout,
}

impl Materializer {
    pub fn new(api: Arc<dyn FeedApi>, layout: MediaLayout) -> Self {
        Self { api, layout }
    }

    async fn existing_size(path: &Path) -> Option<u64> {
        match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => Some(m.len()),
            _ => None,
        }
    }

    fn record(&self, r: &MediaRef, post_id: i64, size: u64) -> Media {
        Media {
            width: r.width,
            height: r.height,
            url: self.layout.url_for(post_id, r.kind),
            size,
        }
    }

    /// Resolve one asset to a file on disk and its store record.
    ///
    /// `previous` is the record the saved store holds for the same slot, if any.
    pub async fn materialize(
        &self,
        r: &MediaRef,
        post_id: i64,
        policy: MaterializePolicy,
        previous: Option<&Media>,
    ) -> SyncResult<Materialized> {
        let path = self.layout.path_for(post_id, r.kind);
        let Some(size) = Self::existing_size(&path).await else {
            // Nothing on disk for the saved store to rely on; write in place.
            let size = self.download_to(&r.file_id, &path).await?;
            return Ok(Materialized::on_disk(
                self.record(r, post_id, size),
                Outcome::Downloaded,
            ));
        };

        let unchanged = previous.is_some_and(|p| p.width == r.width && p.height == r.height);
        if policy == MaterializePolicy::ReuseExisting || unchanged {
            return Ok(Materialized::on_disk(
                self.record(r, post_id, size),
                Outcome::Reused,
            ));
        }

        match self.stage_download(&r.file_id, &path).await {
            Ok((staged, new_size)) => Ok(Materialized {
                media: self.record(r, post_id, new_size),
                outcome: Outcome::Downloaded,
                staged: Some(staged),
            }),
            Err(e) => {
                tracing::warn!(
                    target: "media",
                    post_id,
                    file_id = %r.file_id,
                    error = %e,
                    "refresh failed, keeping existing file"
                );
                let media = match previous {
                    Some(p) => Media { size, ..p.clone() },
                    None => self.record(r, post_id, size),
                };
                Ok(Materialized::on_disk(media, Outcome::Reused))
            }
        }
    }

    async fn fetch(&self, file_id: &str) -> SyncResult<Vec<u8>> {
        self.api
            .download_file(file_id)
            .await
            .map_err(|e| asset_err(file_id, e.to_string()))
    }

    async fn download_to(&self, file_id: &str, path: &Path) -> SyncResult<u64> {
        let bytes = self.fetch(file_id).await?;

        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || store::write_atomic(&target, &bytes))
            .await
            .map_err(|e| asset_err(file_id, format!("write task failed: {e}")))?
            .map_err(|e| asset_err(file_id, format!("write {}: {e}", path.display())))?;

        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| asset_err(file_id, format!("stat {}: {e}", path.display())))?
            .len();
        Ok(size)
    }

    async fn stage_download(&self, file_id: &str, path: &Path) -> SyncResult<(StagedWrite, u64)> {
        let bytes = self.fetch(file_id).await?;
        let size = bytes.len() as u64;

        let target = path.to_path_buf();
        let staged = tokio::task::spawn_blocking(move || StagedWrite::stage(&target, &bytes))
            .await
            .map_err(|e| asset_err(file_id, format!("write task failed: {e}")))?
            .map_err(|e| asset_err(file_id, format!("stage {}: {e}", path.display())))?;
        Ok((staged, size))
    }

    /// Materialize every asset of every draft with at most `concurrency` downloads
    /// in flight. Output keeps draft order and attachment order. A failed asset is
    /// left out of its post; the post itself is always produced.
    ///
    /// `previous` is the saved store; its records decide whether a refresh can reuse
    /// the file already on disk.
    pub async fn materialize_all(
        &self,
        drafts: Vec<(PostDraft, MaterializePolicy)>,
        previous: &Store,
        concurrency: usize,
    ) -> MaterializedBatch {
        let mut batch = MaterializedBatch::default();

        let mut jobs = Vec::new();
        for (idx, (draft, policy)) in drafts.iter().enumerate() {
            let mut kinds = HashSet::new();
            for r in &draft.media {
                if !kinds.insert(r.kind) {
                    tracing::warn!(
                        target: "media",
                        post_id = draft.id,
                        kind = ?r.kind,
                        "second asset of the same kind rejected"
                    );
                    batch.failed += 1;
                    continue;
                }
                let url = self.layout.url_for(draft.id, r.kind);
                let prev = previous
                    .get(draft.id)
                    .and_then(|p| p.images.iter().find(|m| m.url == url))
                    .cloned();
                jobs.push((idx, draft.id, r.clone(), *policy, prev));
            }
        }

        let results: Vec<(usize, SyncResult<Materialized>)> = stream::iter(jobs)
            .map(|(idx, post_id, r, policy, prev)| async move {
                (idx, self.materialize(&r, post_id, policy, prev.as_ref()).await)
            })
            .buffered(concurrency.max(1))
            .collect()
            .await;

        let mut images: Vec<Vec<Media>> = vec![Vec::new(); drafts.len()];
        for (idx, res) in results {
            match res {
                Ok(m) => {
                    match m.outcome {
                        Outcome::Downloaded => batch.downloaded += 1,
                        Outcome::Reused => batch.reused += 1,
                    }
                    batch.staged.extend(m.staged);
                    images[idx].push(m.media);
                }
                Err(e) => {
                    tracing::warn!(target: "media", post_id = drafts[idx].0.id, error = %e, "asset skipped");
                    batch.failed += 1;
                }
            }
        }

        batch.posts = drafts
            .into_iter()
            .zip(images)
            .map(|((d, _), images)| Post {
                id: d.id,
                date: d.date,
                text: d.text,
                images,
            })
            .collect();

        counter!("sync_media_downloaded_total").increment(batch.downloaded as u64);
        counter!("sync_media_reused_total").increment(batch.reused as u64);
        counter!("sync_media_failed_total").increment(batch.failed as u64);
        batch
    }
}

fn asset_err(file_id: &str, reason: String) -> SyncError {
    SyncError::Asset {
        file_id: file_id.to_string(),
        reason,
    }
}

/// Rename staged replacements over their targets. Call only after the store that
/// references them has been saved. Returns how many could not be committed.
pub fn commit_replacements(staged: Vec<StagedWrite>) -> usize {
    let mut failed = 0;
    for s in staged {
        let target = s.target().to_path_buf();
        if let Err(e) = s.commit() {
            tracing::warn!(target: "media", path = %target.display(), error = %e, "replacement not committed");
            failed += 1;
        }
    }
    failed
}
