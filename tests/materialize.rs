// tests/materialize.rs
use std::fs;
use std::sync::Arc;

use channel_mirror::ingest::providers::fixture::FixtureFeed;
use channel_mirror::ingest::{MediaRef, PostDraft};
use channel_mirror::media::{
    commit_replacements, MaterializePolicy, Materializer, MediaKind, MediaLayout, Outcome,
};
use channel_mirror::store::{Media, Store};
use channel_mirror::SyncError;
use chrono::DateTime;

fn photo_ref(file_id: &str) -> MediaRef {
    MediaRef {
        kind: MediaKind::Photo,
        file_id: file_id.to_string(),
        width: 1280,
        height: 853,
    }
}

fn setup(feed: FixtureFeed) -> (tempfile::TempDir, Arc<FixtureFeed>, Materializer) {
    let dir = tempfile::tempdir().unwrap();
    let feed = Arc::new(feed);
    let m = Materializer::new(feed.clone(), MediaLayout::new(dir.path(), "/img/tg"));
    (dir, feed, m)
}

fn stored(post_id: i64, width: u32, height: u32, size: u64) -> Media {
    Media {
        width,
        height,
        url: format!("/img/tg/{post_id}.jpg"),
        size,
    }
}

fn entries(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn second_materialization_is_a_no_op() {
    let (dir, feed, m) = setup(FixtureFeed::new().with_file("p1", b"0123456789"));

    let first = m
        .materialize(&photo_ref("p1"), 7, MaterializePolicy::ReuseExisting, None)
        .await
        .unwrap();
    let second = m
        .materialize(&photo_ref("p1"), 7, MaterializePolicy::ReuseExisting, None)
        .await
        .unwrap();

    assert_eq!(first.outcome, Outcome::Downloaded);
    assert_eq!(second.outcome, Outcome::Reused);
    assert!(first.staged.is_none());
    assert_eq!(first.media, second.media);
    assert_eq!(first.media.url, "/img/tg/7.jpg");
    assert_eq!(first.media.size, 10);
    assert_eq!(feed.downloads(), vec!["p1".to_string()]);
    assert_eq!(fs::read(dir.path().join("7.jpg")).unwrap(), b"0123456789");
}

#[tokio::test]
async fn refresh_of_unchanged_asset_makes_no_remote_call() {
    let (dir, feed, m) = setup(FixtureFeed::new().with_file("p5", b"never-fetched"));
    fs::write(dir.path().join("11.jpg"), b"kept-bytes").unwrap();
    let prev = stored(11, 1280, 853, 10);

    let got = m
        .materialize(&photo_ref("p5"), 11, MaterializePolicy::Refresh, Some(&prev))
        .await
        .unwrap();
    assert_eq!(got.outcome, Outcome::Reused);
    assert_eq!(got.media, prev);
    assert!(feed.downloads().is_empty());
}

#[tokio::test]
async fn refresh_is_staged_until_committed() {
    let (dir, feed, m) = setup(FixtureFeed::new().with_file("p2", b"new-bytes"));
    fs::write(dir.path().join("8.jpg"), b"old").unwrap();
    let prev = stored(8, 640, 480, 3);

    let got = m
        .materialize(&photo_ref("p2"), 8, MaterializePolicy::Refresh, Some(&prev))
        .await
        .unwrap();
    assert_eq!(got.outcome, Outcome::Downloaded);
    assert_eq!(got.media.size, 9);
    assert_eq!((got.media.width, got.media.height), (1280, 853));
    assert_eq!(feed.downloads().len(), 1);

    // The file the saved store points at is untouched until commit.
    assert_eq!(fs::read(dir.path().join("8.jpg")).unwrap(), b"old");
    let staged = got.staged.expect("replacement is staged");
    assert!(staged.temp_path().exists());

    assert_eq!(commit_replacements(vec![staged]), 0);
    assert_eq!(fs::read(dir.path().join("8.jpg")).unwrap(), b"new-bytes");
    assert_eq!(entries(dir.path()), vec!["8.jpg".to_string()]);
}

#[tokio::test]
async fn dropped_replacement_leaves_existing_file_alone() {
    let (dir, _feed, m) = setup(FixtureFeed::new().with_file("p6", b"new-bytes"));
    fs::write(dir.path().join("12.jpg"), b"old").unwrap();

    let got = m
        .materialize(&photo_ref("p6"), 12, MaterializePolicy::Refresh, None)
        .await
        .unwrap();
    drop(got);

    assert_eq!(fs::read(dir.path().join("12.jpg")).unwrap(), b"old");
    assert_eq!(entries(dir.path()), vec!["12.jpg".to_string()]);
}

#[tokio::test]
async fn failed_refresh_falls_back_to_existing_file_and_record() {
    let (dir, _feed, m) = setup(FixtureFeed::new().with_failing_file("p3"));
    fs::write(dir.path().join("9.jpg"), b"kept").unwrap();
    let prev = stored(9, 640, 480, 4);

    let got = m
        .materialize(&photo_ref("p3"), 9, MaterializePolicy::Refresh, Some(&prev))
        .await
        .unwrap();
    assert_eq!(got.outcome, Outcome::Reused);
    assert!(got.staged.is_none());
    assert_eq!(got.media, prev);
}

#[tokio::test]
async fn failed_download_yields_no_record_and_no_file() {
    let (dir, _feed, m) = setup(FixtureFeed::new().with_failing_file("p4"));

    let err = m
        .materialize(&photo_ref("p4"), 10, MaterializePolicy::ReuseExisting, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Asset { ref file_id, .. } if file_id == "p4"));
    assert!(!dir.path().join("10.jpg").exists());
    let leftovers = fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn batch_keeps_order_and_isolates_failures() {
    let (dir, _feed, m) = setup(
        FixtureFeed::new()
            .with_file("a", b"aaaa")
            .with_file("s", b"sticker")
            .with_failing_file("b"),
    );
    let date = DateTime::parse_from_rfc3339("2025-09-06T09:00:00+00:00").unwrap();
    let drafts = vec![
        (
            PostDraft {
                id: 1,
                date,
                text: "one".into(),
                media: vec![
                    photo_ref("a"),
                    MediaRef {
                        kind: MediaKind::Sticker,
                        file_id: "s".into(),
                        width: 512,
                        height: 512,
                    },
                    photo_ref("a-duplicate-slot"),
                ],
            },
            MaterializePolicy::ReuseExisting,
        ),
        (
            PostDraft {
                id: 2,
                date,
                text: "two".into(),
                media: vec![photo_ref("b")],
            },
            MaterializePolicy::ReuseExisting,
        ),
    ];

    let batch = m.materialize_all(drafts, &Store::default(), 3).await;
    assert_eq!(batch.posts.len(), 2);
    let urls: Vec<&str> = batch.posts[0].images.iter().map(|i| i.url.as_str()).collect();
    assert_eq!(urls, vec!["/img/tg/1.jpg", "/img/tg/1.webp"]);
    assert!(batch.posts[1].images.is_empty());
    assert_eq!(batch.downloaded, 2);
    assert_eq!(batch.failed, 2);
    assert!(batch.degraded());
    assert!(batch.staged.is_empty());
    assert_eq!(fs::read(dir.path().join("1.jpg")).unwrap(), b"aaaa");
}
