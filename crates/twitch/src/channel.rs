//! Channel identity and live-broadcast queries.

use chrono::{DateTime, Utc};
use rand::RngExt;
use tracing::debug;

use crate::api::{ApiClient, persisted_query};
use crate::error::TwitchApiError;
use crate::models::{
    ChannelShellData, GqlEnvelope, StreamTokenData, StreamingQueryUserData, VideoLengthData,
    VideoNode, VideoTowerData,
};
use crate::quality::{Quality, select_variant};
use crate::vod::Vod;

const CHANNEL_SHELL_HASH: &str =
    "580ab410bcd0c1ad194224957ae2241e5d252b2c5173d8e0cce9d32d5bb14efe";
const STREAMING_QUERY_HASH: &str =
    "e1edae8122517d013405f237ffcc124515dc6ded82480a88daef69c83b53ac01";
const VIDEO_LENGTH_HASH: &str =
    "ac644fafd686f2cb0e3864075af7cf3bb33f4e0525bf84921b10eabaa4e048b5";
const VIDEO_TOWER_HASH: &str =
    "a937f1d22e269e39a03b509f65a7490f9fc247d7f83d6ac1421523e3b68042cb";

/// A Twitch channel, optionally carrying its current live broadcast.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: u64,
    pub login: String,
    pub display_name: String,
    pub broadcast: Option<BroadcastInfo>,
}

/// The currently live broadcast of a channel.
#[derive(Debug, Clone)]
pub struct BroadcastInfo {
    pub stream_id: u64,
    pub started_at: DateTime<Utc>,
    pub title: String,
    pub game: String,
}

pub(crate) fn parse_utc(value: &str, what: &'static str) -> Result<DateTime<Utc>, TwitchApiError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TwitchApiError::parse(what, format!("{value}: {e}")))
}

impl Channel {
    /// Resolves a channel by login. Unknown logins answer with a
    /// `userDoesNotExist` object, surfaced here as `NotFound`.
    pub async fn fetch(api: &ApiClient, login: &str) -> Result<Self, TwitchApiError> {
        let login = login.to_lowercase();
        let body = persisted_query(
            "ChannelShell",
            CHANNEL_SHELL_HASH,
            serde_json::json!({ "login": login }),
        );
        let responses: Vec<GqlEnvelope<ChannelShellData>> = api.post_gql(body).await?;
        let user = responses
            .into_iter()
            .next()
            .and_then(|r| r.data.user_or_error)
            .ok_or_else(|| TwitchApiError::gql("ChannelShell returned no user"))?;

        let Some(id) = user.id else {
            return Err(TwitchApiError::NotFound {
                url: format!("channel {login}"),
            });
        };

        let mut channel = Self {
            id: id
                .parse()
                .map_err(|_| TwitchApiError::parse("channel id", id))?,
            display_name: user.display_name.unwrap_or_else(|| login.clone()),
            login,
            broadcast: None,
        };
        if user.stream.is_some() {
            channel.broadcast = channel.stream_info(api).await?;
        }
        Ok(channel)
    }

    pub fn is_live(&self) -> bool {
        self.broadcast.is_some()
    }

    /// Refreshes and returns the channel's live broadcast, if any.
    pub async fn refresh(&mut self, api: &ApiClient) -> Result<Option<&BroadcastInfo>, TwitchApiError> {
        self.broadcast = self.stream_info(api).await?;
        Ok(self.broadcast.as_ref())
    }

    /// Fetches broadcast details for the channel if it is currently live.
    pub async fn stream_info(&self, api: &ApiClient) -> Result<Option<BroadcastInfo>, TwitchApiError> {
        let body = persisted_query(
            "ComscoreStreamingQuery",
            STREAMING_QUERY_HASH,
            serde_json::json!({
                "channel": self.login,
                "clipSlug": "",
                "isClip": false,
                "isLive": true,
                "isVodOrCollection": false,
                "vodID": "",
            }),
        );
        let responses: Vec<GqlEnvelope<StreamingQueryUserData>> = api.post_gql(body).await?;
        let Some(user) = responses.into_iter().next().and_then(|r| r.data.user) else {
            debug!(login = %self.login, "no broadcast info found");
            return Ok(None);
        };
        let Some(stream) = user.stream else {
            return Ok(None);
        };

        Ok(Some(BroadcastInfo {
            stream_id: stream
                .id
                .parse()
                .map_err(|_| TwitchApiError::parse("stream id", stream.id))?,
            started_at: parse_utc(&stream.created_at, "stream createdAt")?,
            title: user
                .broadcast_settings
                .map(|b| b.title)
                .unwrap_or_default(),
            game: stream
                .game
                .and_then(|g| g.display_name.or(g.name))
                .unwrap_or_default(),
        }))
    }

    /// Fetches the VOD id paired with the current broadcast. Channels with
    /// VOD archival disabled, and broadcasts too young to have a VOD yet,
    /// answer with no edges.
    pub async fn broadcast_vod_id(&self, api: &ApiClient) -> Result<Option<u64>, TwitchApiError> {
        let body = persisted_query(
            "ChannelVideoLength",
            VIDEO_LENGTH_HASH,
            serde_json::json!({ "channelLogin": self.login }),
        );
        let responses: Vec<GqlEnvelope<VideoLengthData>> = api.post_gql(body).await?;
        let edge = responses
            .into_iter()
            .next()
            .and_then(|r| r.data.user)
            .and_then(|u| u.videos)
            .and_then(|v| v.edges.into_iter().next());

        match edge {
            Some(edge) => {
                let id = edge
                    .node
                    .id
                    .parse()
                    .map_err(|_| TwitchApiError::parse("broadcast vod id", edge.node.id))?;
                debug!(login = %self.login, vod_id = id, "current broadcast is vod-backed");
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Resolves the live master playlist and selects a variant uri.
    pub async fn stream_index_url(
        &self,
        api: &ApiClient,
        quality: &Quality,
    ) -> Result<String, TwitchApiError> {
        let token = self.stream_playback_access_token(api).await?;
        let url = format!("https://usher.ttvnw.net/api/channel/hls/{}.m3u8", self.login);
        let p = rand::rng().random_range(1_000_000..9_999_999).to_string();
        let params: [(&str, &str); 9] = [
            ("player", "twitchweb"),
            ("fast_bread", "true"),
            ("token", &token.0),
            ("sig", &token.1),
            ("allow_source", "true"),
            ("playlist_include_framerate", "true"),
            ("player_backend", "mediaplayer"),
            ("supported_codecs", "avc1"),
            ("p", &p),
        ];
        let text = api.get_text_with_params(&url, &params).await?;
        let master = m3u8_rs::parse_master_playlist_res(text.as_bytes())
            .map_err(|e| TwitchApiError::parse("live master playlist", e.to_string()))?;
        select_variant(&master, quality)
    }

    /// Fetches the media playlist behind a variant uri.
    pub async fn playlist_text(
        &self,
        api: &ApiClient,
        index_url: &str,
    ) -> Result<String, TwitchApiError> {
        api.get_text(index_url).await
    }

    async fn stream_playback_access_token(
        &self,
        api: &ApiClient,
    ) -> Result<(String, String), TwitchApiError> {
        // not a persisted query; the token query goes up verbatim
        let query = format!(
            r#"{{
    streamPlaybackAccessToken(
        channelName: "{}",
        params: {{
            platform: "web",
            playerBackend: "mediaplayer",
            playerType: "embed"
        }}
    ) {{
        signature
        value
    }}
}}"#,
            self.login
        );
        let responses: Vec<GqlEnvelope<StreamTokenData>> = api
            .post_gql(serde_json::json!({ "query": query }))
            .await?;
        let token = responses
            .into_iter()
            .next()
            .and_then(|r| r.data.stream_playback_access_token)
            .ok_or_else(|| TwitchApiError::gql("no stream playback access token returned"))?;
        Ok((token.value, token.signature))
    }

    /// Enumerates all archived broadcasts of the channel, newest first,
    /// following pagination cursors.
    pub async fn videos(&self, api: &ApiClient) -> Result<Vec<Vod>, TwitchApiError> {
        let mut vods = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut variables = serde_json::json!({
                "broadcastType": "ARCHIVE",
                "channelOwnerLogin": self.login,
                "limit": 30,
                "videoSort": "TIME",
            });
            if let Some(c) = &cursor {
                variables["cursor"] = serde_json::Value::String(c.clone());
            }
            let body = persisted_query("FilterableVideoTower_Videos", VIDEO_TOWER_HASH, variables);
            let responses: Vec<GqlEnvelope<VideoTowerData>> = api.post_gql(body).await?;
            let Some(videos) = responses
                .into_iter()
                .next()
                .and_then(|r| r.data.user)
                .and_then(|u| u.videos)
            else {
                break;
            };

            let has_next = videos.page_info.as_ref().is_some_and(|p| p.has_next_page);
            cursor = videos.edges.last().and_then(|e| e.cursor.clone());

            for edge in videos.edges {
                vods.push(self.vod_from_node(edge.node)?);
            }

            if !has_next || cursor.is_none() {
                break;
            }
        }

        debug!(login = %self.login, count = vods.len(), "channel vods enumerated");
        Ok(vods)
    }

    fn vod_from_node(&self, node: VideoNode) -> Result<Vod, TwitchApiError> {
        let mut vod = Vod::from_node(node)?;
        if vod.channel_login.is_empty() {
            vod.channel_login = self.login.clone();
            vod.channel_id = self.id;
        }
        Ok(vod)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_utc_accepts_gql_timestamps() {
        let dt = parse_utc("2024-03-05T18:00:02Z", "t").unwrap();
        assert_eq!(dt.timestamp(), 1_709_661_602);
        assert!(parse_utc("yesterday", "t").is_err());
    }
}
