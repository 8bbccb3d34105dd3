// src/ingest/normalize.rs
use chrono::{DateTime, FixedOffset, Utc};

use crate::error::{SyncError, SyncResult};
use crate::ingest::normalize_text;
use crate::ingest::types::{Message, PhotoSize};
use crate::media::MediaKind;

/// Reference to a remote asset, not yet downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub file_id: String,
    pub width: u32,
    pub height: u32,
}

/// Canonical post before its media has been materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostDraft {
    pub id: i64,
    pub date: DateTime<FixedOffset>,
    pub text: String,
    pub media: Vec<MediaRef>,
}

fn unix_to_date(id: i64, secs: i64) -> SyncResult<DateTime<FixedOffset>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|dt| dt.fixed_offset())
        .ok_or_else(|| SyncError::Malformed {
            id,
            reason: format!("timestamp {secs} out of range"),
        })
}

/// Largest variant by pixel area, then by byte size.
fn best_photo(sizes: &[PhotoSize]) -> Option<&PhotoSize> {
    sizes.iter().max_by_key(|p| {
        (
            u64::from(p.width) * u64::from(p.height),
            p.file_size.unwrap_or(0),
        )
    })
}

/// Turn one channel message into a post draft. Edits go through the same path:
/// the draft replaces the stored post in full.
pub fn normalize(msg: &Message) -> SyncResult<PostDraft> {
    let id = msg.message_id;
    if id <= 0 {
        return Err(SyncError::Malformed {
            id,
            reason: "non-positive message id".to_string(),
        });
    }
    let date = unix_to_date(id, msg.edit_date.unwrap_or(msg.date))?;

    let text_raw = match msg.text.as_deref() {
        Some(t) if !t.trim().is_empty() => t,
        _ => msg.caption.as_deref().unwrap_or_default(),
    };
    let text = normalize_text(text_raw);

    let mut media = Vec::new();
    if let Some(p) = msg.photo.as_deref().and_then(best_photo) {
        media.push(MediaRef {
            kind: MediaKind::Photo,
            file_id: p.file_id.clone(),
            width: p.width,
            height: p.height,
        });
    }
    if let Some(s) = &msg.sticker {
        let kind = if s.is_video {
            MediaKind::VideoSticker
        } else if s.is_animated {
            MediaKind::AnimatedSticker
        } else {
            MediaKind::Sticker
        };
        media.push(MediaRef {
            kind,
            file_id: s.file_id.clone(),
            width: s.width,
            height: s.height,
        });
    }

    media.retain(|m| {
        let ok = m.width > 0 && m.height > 0 && !m.file_id.is_empty();
        if !ok {
            tracing::warn!(target: "normalize", id, kind = ?m.kind, "asset without dimensions or file id skipped");
        }
        ok
    });

    Ok(PostDraft {
        id,
        date,
        text,
        media,
    })
}
