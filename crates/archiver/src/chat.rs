//! Chat replay archiving.
//!
//! Pulls the comment replay page by page, keeps every message verbatim in
//! `verbose_chat.json` and renders a human-readable transcript next to it.
//! For a VOD with a live broadcast behind it the fetch re-runs on a fixed
//! cadence, resuming from the last archived offset.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use twitch_api::{ApiClient, Channel, ChatMessage, CommentCursor};

use crate::error::{ArchiveError, Result};

/// Re-fetch cadence while the backing broadcast is live.
const LIVE_RECHECK: Duration = Duration::from_secs(60);

const MAX_ATTEMPTS: u32 = 5;

const VERBOSE_FILE: &str = "verbose_chat.json";
const READABLE_FILE: &str = "readable_chat.txt";

const MISSING_COMMENTER: &str = "~MISSING_COMMENTER_INFO~";
const MISSING_MESSAGE: &str = "~MISSING_MESSAGE_INFO~";

pub struct ChatArchiver {
    api: ApiClient,
    vod_id: u64,
    output_dir: PathBuf,
    messages: Vec<ChatMessage>,
    seen_ids: HashSet<String>,
    cancel: CancellationToken,
}

impl ChatArchiver {
    pub fn new(
        api: ApiClient,
        vod_id: u64,
        output_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            vod_id,
            output_dir,
            messages: Vec::new(),
            seen_ids: HashSet::new(),
            cancel,
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Archives the chat replay. With a channel given, the fetch repeats
    /// while that channel's broadcast is live so late messages land too.
    pub async fn run(&mut self, channel: Option<Channel>) -> Result<()> {
        self.load_existing().await?;
        self.fetch_pass().await?;

        if let Some(mut channel) = channel {
            let mut ticker = tokio::time::interval(LIVE_RECHECK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(ArchiveError::Cancelled),
                    _ = ticker.tick() => {}
                }
                if channel.refresh(&self.api).await?.is_none() {
                    break;
                }
                debug!(vod_id = self.vod_id, "broadcast still live, re-fetching chat");
                self.fetch_pass().await?;
            }
            // one more pass for messages posted right at the end
            self.fetch_pass().await?;
        }

        self.export().await?;
        info!(vod_id = self.vod_id, messages = self.messages.len(), "chat archived");
        Ok(())
    }

    /// Resumes from a previous run's verbose export if one exists.
    async fn load_existing(&mut self) -> Result<()> {
        let path = self.output_dir.join(VERBOSE_FILE);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let existing: Vec<ChatMessage> = serde_json::from_slice(&bytes)?;
        info!(count = existing.len(), "resuming chat archive");
        for message in existing {
            if self.seen_ids.insert(message.id.clone()) {
                self.messages.push(message);
            }
        }
        Ok(())
    }

    /// Walks the comment pages from the last archived offset to the end.
    async fn fetch_pass(&mut self) -> Result<()> {
        let mut position = CommentCursor::Offset(self.resume_offset());
        loop {
            if self.cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            let (page, next) = self.fetch_page(&position).await?;
            for message in page {
                if self.seen_ids.insert(message.id.clone()) {
                    self.messages.push(message);
                }
            }
            match next {
                Some(cursor) => position = CommentCursor::Cursor(cursor),
                None => break,
            }
        }
        self.messages.sort_by(|a, b| {
            a.content_offset_seconds
                .partial_cmp(&b.content_offset_seconds)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(())
    }

    async fn fetch_page(
        &self,
        position: &CommentCursor,
    ) -> Result<(Vec<ChatMessage>, Option<String>)> {
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match twitch_api::chat::video_comments(&self.api, self.vod_id, position).await {
                Ok(page) => return Ok(page),
                Err(e) => {
                    warn!(attempt, error = %e, "chat page fetch failed");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        Err(ArchiveError::ChatDownload {
            reason: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "page fetch exhausted".into()),
        })
    }

    fn resume_offset(&self) -> u64 {
        self.messages
            .last()
            .map_or(0, |m| m.content_offset_seconds.floor() as u64)
    }

    /// Writes the verbatim and readable exports.
    async fn export(&self) -> Result<()> {
        fs::create_dir_all(&self.output_dir).await?;
        fs::write(
            self.output_dir.join(VERBOSE_FILE),
            serde_json::to_vec(&self.messages)?,
        )
        .await?;

        let mut readable = String::new();
        for message in &self.messages {
            readable.push_str(&render_line(message));
            readable.push('\n');
        }
        fs::write(self.output_dir.join(READABLE_FILE), readable).await?;
        Ok(())
    }
}

/// One transcript line: offset, role badges, name and text. Messages with
/// missing commenter or fragment data get explicit placeholders so gaps in
/// Twitch's replay data stay visible.
fn render_line(message: &ChatMessage) -> String {
    let mut badges = String::new();
    for badge in &message.message.user_badges {
        if badge.set_id.contains("broadcaster") {
            badges.push_str("(B)");
        } else if badge.set_id.contains("moderator") {
            badges.push_str("(M)");
        } else if badge.set_id.contains("subscriber") {
            badges.push_str("(S)");
        }
    }

    let name = message
        .commenter
        .as_ref()
        .and_then(|c| c.display_name.as_deref())
        .unwrap_or(MISSING_COMMENTER);

    let text = if message.message.fragments.is_empty() {
        MISSING_MESSAGE.to_string()
    } else {
        message
            .message
            .fragments
            .iter()
            .map(|f| f.text.as_str())
            .collect::<String>()
    };

    format!(
        "[{:.3}] {badges}{name}: {text}",
        message.content_offset_seconds
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use twitch_api::ChatMessage;

    fn message(json: &str) -> ChatMessage {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn line_renders_badges_name_and_text() {
        let msg = message(
            r#"{
                "id": "m1",
                "createdAt": "2024-06-01T12:00:30Z",
                "contentOffsetSeconds": 30.25,
                "commenter": {"displayName": "streamfan"},
                "message": {
                    "fragments": [{"text": "hello "}, {"text": "world"}],
                    "userBadges": [
                        {"setID": "moderator", "version": "1"},
                        {"setID": "subscriber", "version": "12"}
                    ]
                }
            }"#,
        );
        assert_eq!(render_line(&msg), "[30.250] (M)(S)streamfan: hello world");
    }

    #[test]
    fn missing_data_gets_placeholders() {
        let msg = message(
            r#"{
                "id": "m2",
                "createdAt": "2024-06-01T12:00:30Z",
                "contentOffsetSeconds": 5.0,
                "commenter": null,
                "message": {"fragments": [], "userBadges": []}
            }"#,
        );
        assert_eq!(
            render_line(&msg),
            "[5.000] ~MISSING_COMMENTER_INFO~: ~MISSING_MESSAGE_INFO~"
        );
    }

    #[test]
    fn broadcaster_badge_renders_first() {
        let msg = message(
            r#"{
                "id": "m3",
                "createdAt": "2024-06-01T12:00:30Z",
                "contentOffsetSeconds": 0.0,
                "commenter": {"displayName": "the_streamer"},
                "message": {
                    "fragments": [{"text": "hi"}],
                    "userBadges": [{"setID": "broadcaster", "version": "1"}]
                }
            }"#,
        );
        assert_eq!(render_line(&msg), "[0.000] (B)the_streamer: hi");
    }
}
