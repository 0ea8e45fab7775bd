use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One archived (or partially archived) broadcast as stored in the ledger.
///
/// Keyed by `(vod_id, stream_id)`. Broadcasts predating Twitch's stream ids
/// store the vod id in both columns; stream-only captures (no VOD ever
/// existed) store 0 as the vod id.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ArchiveRecord {
    pub vod_id: i64,
    pub stream_id: i64,
    pub user_id: i64,
    pub user_login: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
    pub thumbnail_url: String,
    pub duration: i64,
    /// Rendered chapter listing, informational only.
    pub chapters: String,
    /// JSON array of [`MutedSpan`] values.
    pub muted_segments: String,
    pub video_archived: bool,
    pub chat_archived: bool,
}

/// A muted span of the broadcast, seconds from its start.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutedSpan {
    pub offset: u64,
    pub duration: u64,
}

impl ArchiveRecord {
    /// Whether this record already covers everything the caller wants.
    pub fn covers(&self, want_video: bool, want_chat: bool) -> bool {
        (!want_video || self.video_archived) && (!want_chat || self.chat_archived)
    }

    pub fn muted_spans(&self) -> Vec<MutedSpan> {
        serde_json::from_str(&self.muted_segments).unwrap_or_default()
    }

    pub fn set_muted_spans(&mut self, spans: &[MutedSpan]) {
        self.muted_segments = serde_json::to_string(spans).unwrap_or_else(|_| "[]".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(video: bool, chat: bool) -> ArchiveRecord {
        ArchiveRecord {
            vod_id: 1,
            stream_id: 2,
            user_id: 3,
            user_login: "login".into(),
            title: "title".into(),
            created_at: Utc::now(),
            published_at: Utc::now(),
            thumbnail_url: String::new(),
            duration: 60,
            chapters: String::new(),
            muted_segments: "[]".into(),
            video_archived: video,
            chat_archived: chat,
        }
    }

    #[test]
    fn covers_respects_requested_formats() {
        assert!(record(true, false).covers(true, false));
        assert!(!record(true, false).covers(true, true));
        assert!(record(true, true).covers(false, true));
        assert!(record(false, false).covers(false, false));
    }

    #[test]
    fn muted_spans_round_trip() {
        let mut r = record(false, false);
        r.set_muted_spans(&[MutedSpan {
            offset: 120,
            duration: 180,
        }]);
        assert_eq!(
            r.muted_spans(),
            vec![MutedSpan {
                offset: 120,
                duration: 180
            }]
        );
    }
}
