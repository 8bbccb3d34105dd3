// src/ingest/types.rs
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub file_unique_id: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sticker {
    pub file_id: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub is_animated: bool,
    #[serde(default)]
    pub is_video: bool,
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// Message body as delivered by the feed. `date`/`edit_date` are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub date: i64,
    #[serde(default)]
    pub edit_date: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<PhotoSize>>,
    #[serde(default)]
    pub sticker: Option<Sticker>,
}

/// Explicit deletion signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesDeleted {
    pub chat: Chat,
    pub message_ids: Vec<i64>,
}

/// One slot of the remote update log. At most one payload field is set; a slot
/// with none of them is unclassifiable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawUpdate {
    pub update_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_post: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_channel_post: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_business_messages: Option<MessagesDeleted>,
}

/// A retained, classified event for the configured channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Created(Message),
    Edited(Message),
    Deleted(Vec<i64>),
}

/// Configured channel identity: numeric chat id or public `@username`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelId {
    Id(i64),
    Username(String),
}

impl ChannelId {
    pub fn matches(&self, chat: &Chat) -> bool {
        match self {
            ChannelId::Id(id) => chat.id == *id,
            ChannelId::Username(name) => chat
                .username
                .as_deref()
                .is_some_and(|u| u.eq_ignore_ascii_case(name)),
        }
    }
}

impl FromStr for ChannelId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.is_empty() {
            return Err("channel id is empty".to_string());
        }
        if let Some(name) = t.strip_prefix('@') {
            if name.is_empty() {
                return Err("channel username is empty".to_string());
            }
            return Ok(ChannelId::Username(name.to_string()));
        }
        match t.parse::<i64>() {
            Ok(id) => Ok(ChannelId::Id(id)),
            Err(_) => Ok(ChannelId::Username(t.to_string())),
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Id(id) => write!(f, "{id}"),
            ChannelId::Username(name) => write!(f, "@{name}"),
        }
    }
}

/// Remote feed surface used by the sync engine. Implementations must apply their
/// own request timeouts; a timed-out call is reported as `SyncError::Transient`.
#[async_trait::async_trait]
pub trait FeedApi: Send + Sync {
    /// Updates with `update_id >= offset`, at most `limit` of them, ascending.
    async fn get_updates(&self, offset: i64, limit: u32) -> SyncResult<Vec<RawUpdate>>;
    /// Confirm every update below `offset`; the feed stops delivering them.
    async fn acknowledge(&self, offset: i64) -> SyncResult<()>;
    /// Full binary content of one asset.
    async fn download_file(&self, file_id: &str) -> SyncResult<Vec<u8>>;
    fn name(&self) -> &'static str;
}
