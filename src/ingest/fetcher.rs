// src/ingest/fetcher.rs
use metrics::{counter, histogram};

use crate::error::SyncResult;
use crate::ingest::types::{ChannelId, FeedApi, FeedEvent, RawUpdate};

pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Paging offset for the first request; only meaningful within one run.
    pub start_offset: i64,
    pub page_size: u32,
    /// Upper bound on requests per run.
    pub max_pages: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            start_offset: 0,
            page_size: MAX_PAGE_SIZE,
            max_pages: 1000,
        }
    }
}

/// Everything one fetch loop produced, in remote order.
#[derive(Debug, Default)]
pub struct FetchedBatch {
    pub events: Vec<FeedEvent>,
    pub updates_seen: usize,
    pub foreign: usize,
    pub ignored: usize,
    pub pages: usize,
    pub next_offset: i64,
}

enum Classified {
    Event(FeedEvent),
    Foreign,
    Unclassifiable,
}

fn classify(update: RawUpdate, channel: &ChannelId) -> Classified {
    if let Some(m) = update.channel_post {
        return if channel.matches(&m.chat) {
            Classified::Event(FeedEvent::Created(m))
        } else {
            Classified::Foreign
        };
    }
    if let Some(m) = update.edited_channel_post {
        return if channel.matches(&m.chat) {
            Classified::Event(FeedEvent::Edited(m))
        } else {
            Classified::Foreign
        };
    }
    if let Some(d) = update.deleted_business_messages {
        return if !channel.matches(&d.chat) {
            Classified::Foreign
        } else if d.message_ids.is_empty() {
            Classified::Unclassifiable
        } else {
            Classified::Event(FeedEvent::Deleted(d.message_ids))
        };
    }
    // No body: this is not treated as a deletion.
    Classified::Unclassifiable
}

/// Page through the update log until a short page.
///
/// Any page error aborts the whole loop; nothing fetched so far is returned, so a
/// failed run never feeds partial progress into the store. Requesting a page
/// confirms the pages before it, but the last page is never confirmed here: the
/// caller does that with `FeedApi::acknowledge(next_offset)` once it has persisted
/// the batch.
pub async fn fetch_updates(
    api: &dyn FeedApi,
    channel: &ChannelId,
    opts: FetchOptions,
) -> SyncResult<FetchedBatch> {
    let t0 = std::time::Instant::now();
    let limit = opts.page_size.clamp(1, MAX_PAGE_SIZE);
    let mut batch = FetchedBatch {
        next_offset: opts.start_offset,
        ..FetchedBatch::default()
    };

    loop {
        if batch.pages >= opts.max_pages {
            tracing::warn!(
                target: "fetch",
                pages = batch.pages,
                offset = batch.next_offset,
                "page limit reached, remaining updates are left for the next run"
            );
            break;
        }

        let page = api.get_updates(batch.next_offset, limit).await?;
        batch.pages += 1;
        if page.is_empty() {
            break;
        }

        let max_id = page.iter().map(|u| u.update_id).max().unwrap_or(i64::MIN);
        let short_page = page.len() < limit as usize;
        batch.updates_seen += page.len();

        for u in page {
            let update_id = u.update_id;
            match classify(u, channel) {
                Classified::Event(ev) => batch.events.push(ev),
                Classified::Foreign => batch.foreign += 1,
                Classified::Unclassifiable => {
                    tracing::debug!(target: "fetch", update_id, "unclassifiable update ignored");
                    batch.ignored += 1;
                }
            }
        }

        let next = max_id.saturating_add(1);
        if next <= batch.next_offset {
            tracing::warn!(
                target: "fetch",
                offset = batch.next_offset,
                max_id,
                "feed returned already consumed updates, stopping"
            );
            break;
        }
        batch.next_offset = next;
        if short_page {
            break;
        }
    }

    counter!("sync_updates_total").increment(batch.updates_seen as u64);
    counter!("sync_events_ignored_total").increment((batch.ignored + batch.foreign) as u64);
    histogram!("sync_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

    tracing::info!(
        target: "fetch",
        api = api.name(),
        pages = batch.pages,
        updates = batch.updates_seen,
        events = batch.events.len(),
        foreign = batch.foreign,
        ignored = batch.ignored,
        "fetch loop finished"
    );
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::{Chat, Message, MessagesDeleted};

    fn msg(chat_id: i64, id: i64) -> Message {
        Message {
            message_id: id,
            chat: Chat {
                id: chat_id,
                username: None,
            },
            date: 1_700_000_000,
            edit_date: None,
            text: Some("hi".into()),
            caption: None,
            photo: None,
            sticker: None,
        }
    }

    #[test]
    fn classify_routes_by_payload_and_channel() {
        let ch = ChannelId::Id(-1);
        let created = RawUpdate {
            update_id: 1,
            channel_post: Some(msg(-1, 10)),
            ..Default::default()
        };
        assert!(matches!(
            classify(created, &ch),
            Classified::Event(FeedEvent::Created(_))
        ));

        let other = RawUpdate {
            update_id: 2,
            edited_channel_post: Some(msg(-2, 10)),
            ..Default::default()
        };
        assert!(matches!(classify(other, &ch), Classified::Foreign));

        let empty = RawUpdate {
            update_id: 3,
            ..Default::default()
        };
        assert!(matches!(classify(empty, &ch), Classified::Unclassifiable));

        let deleted = RawUpdate {
            update_id: 4,
            deleted_business_messages: Some(MessagesDeleted {
                chat: Chat {
                    id: -1,
                    username: None,
                },
                message_ids: vec![5, 6],
            }),
            ..Default::default()
        };
        assert!(matches!(
            classify(deleted, &ch),
            Classified::Event(FeedEvent::Deleted(ref ids)) if ids == &vec![5, 6]
        ));
    }
}
