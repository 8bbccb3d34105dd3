//! One sync run: fetch → normalize → materialize → reconcile → save → purge → ack.
//!
//! Nothing is written to the store until every remote page has been fetched; a
//! failure anywhere before `store::save` leaves the previous store and every file it
//! references untouched. The feed is told the last page was consumed only after the
//! save, so a failed run sees that page again next time.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::ingest::types::{FeedApi, FeedEvent};
use crate::ingest::{fetch_updates, normalize, FetchOptions, PostDraft};
use crate::lock::RunLock;
use crate::media::{commit_replacements, MaterializePolicy, Materializer, MediaLayout};
use crate::reconcile::reconcile;
use crate::store;

/// One-time metrics registration.
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("sync_updates_total", "Raw updates returned by the feed.");
        describe_counter!(
            "sync_events_ignored_total",
            "Updates for other chats or without a usable payload."
        );
        describe_counter!("sync_media_downloaded_total", "Assets fetched from the feed.");
        describe_counter!(
            "sync_media_reused_total",
            "Assets already on disk, not fetched again."
        );
        describe_counter!("sync_media_failed_total", "Assets left out of their post.");
        describe_counter!("sync_posts_created_total", "Posts added to the store.");
        describe_counter!("sync_posts_updated_total", "Posts replaced by an edit.");
        describe_counter!("sync_posts_deleted_total", "Posts removed from the store.");
        describe_counter!("sync_remote_errors_total", "Failed update page requests.");
        describe_histogram!("sync_fetch_ms", "Fetch loop duration in milliseconds.");
        describe_gauge!("sync_last_run_ts", "Unix ts of the last successful run.");
        describe_gauge!("sync_store_posts", "Posts in the store after the last run.");
    });
}

/// Summary of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub updates_seen: usize,
    pub ignored: usize,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub media_downloaded: usize,
    pub media_reused: usize,
    pub media_failed: usize,
    pub orphans_removed: usize,
    pub watermark_before: Option<i64>,
    pub watermark_after: Option<i64>,
    pub store_posts: usize,
}

impl SyncReport {
    pub fn degraded(&self) -> bool {
        self.media_failed > 0
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "new={} updated={} deleted={} media(downloaded={} reused={} failed={}) posts={}",
            self.created,
            self.updated,
            self.deleted,
            self.media_downloaded,
            self.media_reused,
            self.media_failed,
            self.store_posts
        )?;
        if self.degraded() {
            write!(f, " DEGRADED")?;
        }
        Ok(())
    }
}

enum Pending {
    Upsert(PostDraft, MaterializePolicy),
    Delete,
}

/// Fold events in fetch order so the last event per id decides.
fn fold_events(events: Vec<FeedEvent>) -> BTreeMap<i64, Pending> {
    let mut pending = BTreeMap::new();
    for ev in events {
        let (msg, policy) = match ev {
            FeedEvent::Deleted(ids) => {
                for id in ids {
                    pending.insert(id, Pending::Delete);
                }
                continue;
            }
            FeedEvent::Created(m) => (m, MaterializePolicy::ReuseExisting),
            FeedEvent::Edited(m) => (m, MaterializePolicy::Refresh),
        };
        match normalize(&msg) {
            Ok(draft) => {
                // A create re-delivered after an edit in the same batch must not
                // downgrade the refresh.
                let policy = match pending.get(&draft.id) {
                    Some(Pending::Upsert(_, MaterializePolicy::Refresh)) => {
                        MaterializePolicy::Refresh
                    }
                    _ => policy,
                };
                pending.insert(draft.id, Pending::Upsert(draft, policy));
            }
            Err(e) => tracing::warn!(target: "sync", error = %e, "message skipped"),
        }
    }
    pending
}

/// Execute one full run against `api` with exclusive access to the store.
pub async fn run_once(cfg: &SyncConfig, api: Arc<dyn FeedApi>) -> SyncResult<SyncReport> {
    ensure_metrics_described();

    if let Some(parent) = cfg.store_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::store(parent, e))?;
    }
    tokio::fs::create_dir_all(&cfg.media_dir)
        .await
        .map_err(|e| SyncError::store(&cfg.media_dir, e))?;

    let _lock = RunLock::acquire(&RunLock::path_for(&cfg.store_path), cfg.lock_stale_after)?;

    let existing = store::load(&cfg.store_path)?;
    let mut report = SyncReport {
        watermark_before: existing.max_id(),
        ..SyncReport::default()
    };
    tracing::info!(
        target: "sync",
        channel = %cfg.channel,
        posts = existing.len(),
        watermark = ?report.watermark_before,
        "run started"
    );

    let batch = fetch_updates(
        api.as_ref(),
        &cfg.channel,
        FetchOptions {
            start_offset: 0,
            page_size: cfg.page_size,
            max_pages: cfg.max_pages,
        },
    )
    .await?;
    report.updates_seen = batch.updates_seen;
    report.ignored = batch.ignored + batch.foreign;

    let mut drafts = Vec::new();
    let mut deleted_ids = BTreeSet::new();
    for (id, p) in fold_events(batch.events) {
        match p {
            Pending::Upsert(d, policy) => drafts.push((d, policy)),
            Pending::Delete => {
                deleted_ids.insert(id);
            }
        }
    }

    let layout = MediaLayout::new(&cfg.media_dir, &cfg.media_url_prefix);
    let materializer = Materializer::new(api.clone(), layout.clone());
    let materialized = materializer
        .materialize_all(drafts, &existing, cfg.download_concurrency)
        .await;
    report.media_downloaded = materialized.downloaded;
    report.media_reused = materialized.reused;
    report.media_failed = materialized.failed;
    let replacements = materialized.staged;

    let store_missing = !tokio::fs::try_exists(&cfg.store_path).await.unwrap_or(false);
    let result = reconcile(existing, materialized.posts, &deleted_ids, &layout);
    report.created = result.created;
    report.updated = result.updated;
    report.deleted = result.deleted;
    report.store_posts = result.store.len();
    report.watermark_after = result.store.max_id();

    if result.changed() || store_missing {
        store::save(&cfg.store_path, &result.store)?;
    } else {
        tracing::debug!(target: "sync", "store unchanged, write skipped");
    }
    report.media_failed += commit_replacements(replacements);
    report.orphans_removed = result.purge_orphans().await;

    if batch.updates_seen > 0 {
        if let Err(e) = api.acknowledge(batch.next_offset).await {
            // Unacknowledged updates are delivered again on the next run.
            tracing::warn!(target: "sync", offset = batch.next_offset, error = %e, "feed acknowledgement failed");
        }
    }

    counter!("sync_posts_created_total").increment(report.created as u64);
    counter!("sync_posts_updated_total").increment(report.updated as u64);
    counter!("sync_posts_deleted_total").increment(report.deleted as u64);
    gauge!("sync_store_posts").set(report.store_posts as f64);
    gauge!("sync_last_run_ts").set(chrono::Utc::now().timestamp() as f64);

    if report.degraded() {
        tracing::warn!(target: "sync", failed = report.media_failed, "run finished with missing media");
    }
    tracing::info!(
        target: "sync",
        created = report.created,
        updated = report.updated,
        deleted = report.deleted,
        downloaded = report.media_downloaded,
        reused = report.media_reused,
        orphans_removed = report.orphans_removed,
        "run finished"
    );
    Ok(report)
}
