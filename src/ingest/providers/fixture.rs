//! In-memory feed for tests and dry runs. Behaves like the Bot API update log:
//! `get_updates(offset, limit)` returns updates with `update_id >= offset`, and any
//! offset confirms (drops for good) every update below it.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{SyncError, SyncResult};
use crate::ingest::types::{
    Chat, FeedApi, Message, MessagesDeleted, PhotoSize, RawUpdate, Sticker,
};

#[derive(Default)]
pub struct FixtureFeed {
    updates: Vec<RawUpdate>,
    files: HashMap<String, Vec<u8>>,
    failing_files: HashSet<String>,
    fail_updates_at: Option<i64>,
    hanging_files: HashSet<String>,
    confirmed_below: Mutex<i64>,
    pub update_calls: Mutex<Vec<(i64, u32)>>,
    pub download_calls: Mutex<Vec<String>>,
    pub ack_calls: Mutex<Vec<i64>>,
}

impl FixtureFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update(mut self, u: RawUpdate) -> Self {
        self.updates.push(u);
        self.updates.sort_by_key(|u| u.update_id);
        self
    }

    pub fn with_file(mut self, file_id: &str, bytes: &[u8]) -> Self {
        self.files.insert(file_id.to_string(), bytes.to_vec());
        self
    }

    pub fn with_failing_file(mut self, file_id: &str) -> Self {
        self.failing_files.insert(file_id.to_string());
        self
    }

    /// Downloads of `file_id` never complete.
    pub fn with_hanging_file(mut self, file_id: &str) -> Self {
        self.hanging_files.insert(file_id.to_string());
        self
    }

    /// Every `get_updates` call with `offset >= at` fails with a transient error.
    pub fn failing_updates_from(mut self, at: i64) -> Self {
        self.fail_updates_at = Some(at);
        self
    }

    pub fn downloads(&self) -> Vec<String> {
        self.download_calls.lock().unwrap().clone()
    }

    pub fn acks(&self) -> Vec<i64> {
        self.ack_calls.lock().unwrap().clone()
    }

    fn confirm_below(&self, offset: i64) -> i64 {
        let mut confirmed = self.confirmed_below.lock().unwrap();
        *confirmed = (*confirmed).max(offset);
        *confirmed
    }
}

#[async_trait]
impl FeedApi for FixtureFeed {
    async fn get_updates(&self, offset: i64, limit: u32) -> SyncResult<Vec<RawUpdate>> {
        self.update_calls.lock().unwrap().push((offset, limit));
        if self.fail_updates_at.is_some_and(|at| offset >= at) {
            return Err(SyncError::Transient("getUpdates: timed out".into()));
        }
        let from = self.confirm_below(offset);
        Ok(self
            .updates
            .iter()
            .filter(|u| u.update_id >= from)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn acknowledge(&self, offset: i64) -> SyncResult<()> {
        self.ack_calls.lock().unwrap().push(offset);
        self.confirm_below(offset);
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> SyncResult<Vec<u8>> {
        self.download_calls.lock().unwrap().push(file_id.to_string());
        if self.hanging_files.contains(file_id) {
            std::future::pending::<()>().await;
        }
        if self.failing_files.contains(file_id) {
            return Err(SyncError::Transient(format!("file {file_id}: connection reset")));
        }
        self.files
            .get(file_id)
            .cloned()
            .ok_or_else(|| SyncError::Permanent(format!("file {file_id}: 404 Not Found")))
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}

// --- Builders for fixture messages ---

pub fn chat(id: i64) -> Chat {
    Chat { id, username: None }
}

pub fn text_message(chat_id: i64, id: i64, date: i64, text: &str) -> Message {
    Message {
        message_id: id,
        chat: chat(chat_id),
        date,
        edit_date: None,
        text: Some(text.to_string()),
        caption: None,
        photo: None,
        sticker: None,
    }
}

/// Message with a photo offered in two sizes; the large one is `{file_id}`.
pub fn photo_message(chat_id: i64, id: i64, date: i64, caption: &str, file_id: &str) -> Message {
    sized_photo_message(chat_id, id, date, caption, file_id, 1280, 853)
}

/// Like [`photo_message`] with explicit dimensions for the large size.
pub fn sized_photo_message(
    chat_id: i64,
    id: i64,
    date: i64,
    caption: &str,
    file_id: &str,
    width: u32,
    height: u32,
) -> Message {
    Message {
        message_id: id,
        chat: chat(chat_id),
        date,
        edit_date: None,
        text: None,
        caption: Some(caption.to_string()),
        photo: Some(vec![
            PhotoSize {
                file_id: format!("{file_id}-thumb"),
                file_unique_id: String::new(),
                width: 90,
                height: 60,
                file_size: Some(1_000),
            },
            PhotoSize {
                file_id: file_id.to_string(),
                file_unique_id: String::new(),
                width,
                height,
                file_size: Some(100_000),
            },
        ]),
        sticker: None,
    }
}

pub fn sticker_message(chat_id: i64, id: i64, date: i64, file_id: &str) -> Message {
    Message {
        message_id: id,
        chat: chat(chat_id),
        date,
        edit_date: None,
        text: None,
        caption: None,
        photo: None,
        sticker: Some(Sticker {
            file_id: file_id.to_string(),
            width: 512,
            height: 512,
            is_animated: false,
            is_video: false,
            file_size: None,
        }),
    }
}

pub fn created(update_id: i64, m: Message) -> RawUpdate {
    RawUpdate {
        update_id,
        channel_post: Some(m),
        ..RawUpdate::default()
    }
}

pub fn edited(update_id: i64, mut m: Message, edit_date: i64) -> RawUpdate {
    m.edit_date = Some(edit_date);
    RawUpdate {
        update_id,
        edited_channel_post: Some(m),
        ..RawUpdate::default()
    }
}

pub fn deleted(update_id: i64, chat_id: i64, ids: &[i64]) -> RawUpdate {
    RawUpdate {
        update_id,
        deleted_business_messages: Some(MessagesDeleted {
            chat: chat(chat_id),
            message_ids: ids.to_vec(),
        }),
        ..RawUpdate::default()
    }
}

pub fn empty(update_id: i64) -> RawUpdate {
    RawUpdate {
        update_id,
        ..RawUpdate::default()
    }
}
