// src/reconcile.rs
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;

use crate::media::MediaLayout;
use crate::store::{Post, Store};

/// Result of merging one run's deltas into the persisted store.
#[derive(Debug)]
pub struct Reconciliation {
    pub store: Store,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Media files no post references any more. Removed after the store is saved.
    pub orphaned: Vec<PathBuf>,
}

impl Reconciliation {
    pub fn changed(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }

    /// Best-effort removal of orphaned media; a missing file is not an error.
    /// Returns how many files were actually removed.
    pub async fn purge_orphans(&self) -> usize {
        let mut removed = 0;
        for p in &self.orphaned {
            match tokio::fs::remove_file(p).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(target: "reconcile", path = %p.display(), error = %e, "could not remove orphaned media");
                }
            }
        }
        removed
    }
}

/// Merge creates/edits and deletions into `existing`.
///
/// Deletions are applied first, then upserts keyed by id: the last record given for
/// an id replaces whatever was there in full. Output is ordered by id descending.
/// An id present in both inputs ends up stored (callers fold event order before
/// calling).
pub fn reconcile(
    existing: Store,
    upserts: Vec<Post>,
    deleted_ids: &BTreeSet<i64>,
    layout: &MediaLayout,
) -> Reconciliation {
    let mut working: BTreeMap<i64, Post> =
        existing.into_posts().into_iter().map(|p| (p.id, p)).collect();
    let before: BTreeSet<i64> = working.keys().copied().collect();

    let mut orphan_candidates: Vec<PathBuf> = Vec::new();
    let mut deleted = 0usize;
    for id in deleted_ids {
        if working.remove(id).is_some() {
            deleted += 1;
        }
        orphan_candidates.extend(layout.all_paths_for(*id));
    }

    let mut created_ids = BTreeSet::new();
    let mut updated_ids = BTreeSet::new();
    for post in upserts {
        if before.contains(&post.id) && !deleted_ids.contains(&post.id) {
            updated_ids.insert(post.id);
        } else {
            created_ids.insert(post.id);
        }
        if let Some(old) = working.insert(post.id, post) {
            orphan_candidates.extend(old.images.iter().filter_map(|m| layout.path_for_url(&m.url)));
        }
    }

    // Re-created ids count once, as created; the earlier deletion is not reported.
    for id in &created_ids {
        if before.contains(id) && deleted_ids.contains(id) {
            deleted -= 1;
        }
    }

    let referenced: HashSet<PathBuf> = working
        .values()
        .flat_map(|p| p.images.iter())
        .filter_map(|m| layout.path_for_url(&m.url))
        .collect();
    let mut seen = HashSet::new();
    let orphaned: Vec<PathBuf> = orphan_candidates
        .into_iter()
        .filter(|p| !referenced.contains(p) && seen.insert(p.clone()))
        .collect();

    Reconciliation {
        store: Store::from_posts(working.into_values().collect()),
        created: created_ids.len(),
        updated: updated_ids.len(),
        deleted,
        orphaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use crate::store::Media;
    use chrono::DateTime;

    fn layout() -> MediaLayout {
        MediaLayout::new("media", "/img/tg")
    }

    fn post(id: i64, text: &str, photo: bool) -> Post {
        let l = layout();
        Post {
            id,
            date: DateTime::parse_from_rfc3339("2025-09-06T09:00:00+00:00").unwrap(),
            text: text.to_string(),
            images: if photo {
                vec![Media {
                    width: 800,
                    height: 600,
                    url: l.url_for(id, MediaKind::Photo),
                    size: 1234,
                }]
            } else {
                vec![]
            },
        }
    }

    #[test]
    fn last_incoming_record_wins_for_repeated_id() {
        let existing = Store::from_posts(vec![post(1, "old", false)]);
        let r = reconcile(
            existing,
            vec![post(2, "first", false), post(2, "second", false)],
            &BTreeSet::new(),
            &layout(),
        );
        assert_eq!(r.store.len(), 2);
        assert_eq!(r.store.get(2).unwrap().text, "second");
        assert_eq!(r.created, 1);
        assert_eq!(r.updated, 0);
    }

    #[test]
    fn edit_replaces_in_full_and_orphans_dropped_media() {
        let existing = Store::from_posts(vec![post(3, "with photo", true)]);
        let r = reconcile(
            existing,
            vec![post(3, "text only now", false)],
            &BTreeSet::new(),
            &layout(),
        );
        let p = r.store.get(3).unwrap();
        assert_eq!(p.text, "text only now");
        assert!(p.images.is_empty());
        assert_eq!(r.updated, 1);
        assert_eq!(r.orphaned, vec![PathBuf::from("media/3.jpg")]);
    }

    #[test]
    fn edit_keeping_same_media_orphans_nothing() {
        let existing = Store::from_posts(vec![post(3, "a", true)]);
        let r = reconcile(
            existing,
            vec![post(3, "b", true)],
            &BTreeSet::new(),
            &layout(),
        );
        assert!(r.orphaned.is_empty());
    }

    #[test]
    fn deletion_removes_record_and_lists_every_kind_path() {
        let existing = Store::from_posts(vec![post(5, "gone", true), post(4, "stays", true)]);
        let r = reconcile(existing, vec![], &BTreeSet::from([5, 99]), &layout());
        assert!(r.store.get(5).is_none());
        assert_eq!(r.deleted, 1);
        assert!(r.orphaned.contains(&PathBuf::from("media/5.jpg")));
        assert!(r.orphaned.contains(&PathBuf::from("media/5.webp")));
        assert!(r.orphaned.contains(&PathBuf::from("media/99.jpg")));
        assert!(!r.orphaned.contains(&PathBuf::from("media/4.jpg")));
    }

    #[test]
    fn recreated_id_is_kept_and_its_media_is_not_orphaned() {
        let existing = Store::from_posts(vec![post(8, "v1", true)]);
        let r = reconcile(
            existing,
            vec![post(8, "v2", true)],
            &BTreeSet::from([8]),
            &layout(),
        );
        assert_eq!(r.store.get(8).unwrap().text, "v2");
        assert!(!r.orphaned.contains(&PathBuf::from("media/8.jpg")));
        assert_eq!((r.created, r.updated, r.deleted), (1, 0, 0));
    }

    #[test]
    fn output_is_strictly_descending() {
        let r = reconcile(
            Store::from_posts(vec![post(2, "", false), post(9, "", false)]),
            vec![post(5, "", false), post(1, "", false), post(12, "", false)],
            &BTreeSet::from([9]),
            &layout(),
        );
        let ids: Vec<i64> = r.store.posts().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![12, 5, 2, 1]);
    }
}
