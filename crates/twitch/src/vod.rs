//! VOD metadata, playlist resolution and player-overlay queries.

use chrono::{DateTime, Utc};
use rand::RngExt;
use regex::Regex;
use tracing::debug;

use crate::api::{ApiClient, persisted_query};
use crate::channel::{BroadcastInfo, Channel, parse_utc};
use crate::error::TwitchApiError;
use crate::models::{
    GqlEnvelope, MomentsVideo, MuteInfoVideo, SeekPreviewsVideo, VideoMetadataData, VideoNode,
    VideoQueryData, VideoTokenData,
};
use crate::quality::{Quality, select_variant};

const VIDEO_METADATA_HASH: &str =
    "c25707c1e5176320ceac6b447d052480887e23bc794ca1d02becd0bcc91844fe";
const STREAMING_QUERY_HASH: &str =
    "e1edae8122517d013405f237ffcc124515dc6ded82480a88daef69c83b53ac01";
const CHAPTERS_HASH: &str = "8d2793384aac3773beab5e59bd5d6f585aedb923d292800119e03d40cd0f9b41";
const MUTED_SEGMENTS_HASH: &str =
    "c36e7400657815f4704e6063d265dff766ed8fc1590361c6d71e4368805e0b49";
const SEEK_PREVIEWS_HASH: &str =
    "07e99e4d56c5a7c67117a154777b0baf85a5ffefa393b213f4bc712ccaf85dd6";

/// How far apart a VOD's creation and a broadcast's start may be for the two
/// to count as the same broadcast.
const PAIRING_WINDOW_SECS: i64 = 10;

/// An archived (or archiving) broadcast. Channel identity is carried as
/// plain fields; a VOD never owns or references a `Channel`.
#[derive(Debug, Clone)]
pub struct Vod {
    pub vod_id: u64,
    pub stream_id: Option<u64>,
    pub channel_id: u64,
    pub channel_login: String,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
    /// Length in seconds. Refreshed from the playlist's
    /// `#EXT-X-TWITCH-TOTAL-SECS` tag when one is fetched.
    pub duration: u64,
    pub thumbnail_url: String,
    pub view_count: u64,
    pub game: String,
}

/// A muted span of a VOD, in seconds from its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MutedRange {
    pub offset: u64,
    pub duration: u64,
}

impl MutedRange {
    /// Ten-second segment ids covered by this range.
    pub fn segment_ids(&self) -> impl Iterator<Item = u64> + use<> {
        let start = self.offset / 10;
        let end = (self.offset + self.duration).div_ceil(10);
        start..end.max(start + 1)
    }
}

#[derive(Debug, Clone)]
pub struct Chapter {
    pub description: String,
    pub position_secs: f64,
    pub duration_secs: f64,
}

impl Vod {
    /// Fetches full metadata for a VOD id. The metadata query wants the
    /// owner's login, which is resolved first.
    pub async fn fetch(api: &ApiClient, vod_id: u64) -> Result<Self, TwitchApiError> {
        let login = Self::fetch_owner_login(api, vod_id).await?;
        let body = persisted_query(
            "VideoMetadata",
            VIDEO_METADATA_HASH,
            serde_json::json!({ "channelLogin": login, "videoID": vod_id.to_string() }),
        );
        let responses: Vec<GqlEnvelope<VideoMetadataData>> = api.post_gql(body).await?;
        let node = responses
            .into_iter()
            .next()
            .and_then(|r| r.data.video)
            .ok_or_else(|| TwitchApiError::NotFound {
                url: format!("vod {vod_id}"),
            })?;
        let mut vod = Self::from_node(node)?;
        if vod.channel_login.is_empty() {
            vod.channel_login = login;
        }
        debug!(vod_id, title = %vod.title, "vod metadata fetched");
        Ok(vod)
    }

    /// Builds a `Vod` from a GQL video node (metadata or listing shape).
    pub fn from_node(node: VideoNode) -> Result<Self, TwitchApiError> {
        let vod_id = node
            .id
            .parse()
            .map_err(|_| TwitchApiError::parse("vod id", node.id.clone()))?;
        let published_at = match &node.published_at {
            Some(ts) => parse_utc(ts, "vod publishedAt")?,
            None => Utc::now(),
        };
        // listings omit createdAt; publishedAt is close enough there
        let created_at = match &node.created_at {
            Some(ts) => parse_utc(ts, "vod createdAt")?,
            None => published_at,
        };
        let thumbnail_url = node.preview_thumbnail_url.unwrap_or_default();
        let (channel_id, channel_login) = match node.owner {
            Some(owner) => (
                owner.id.and_then(|id| id.parse().ok()).unwrap_or(0),
                owner.login.or(owner.display_name).unwrap_or_default(),
            ),
            None => (0, String::new()),
        };

        Ok(Self {
            vod_id,
            stream_id: stream_id_from_thumbnail(&thumbnail_url),
            channel_id,
            channel_login,
            title: node.title.unwrap_or_default(),
            description: node.description.unwrap_or_default(),
            created_at,
            published_at,
            duration: node.length_seconds.unwrap_or(0),
            thumbnail_url,
            view_count: node.view_count.unwrap_or(0),
            game: node
                .game
                .and_then(|g| g.display_name.or(g.name))
                .unwrap_or_default(),
        })
    }

    /// Placeholder for a live broadcast with no VOD behind it. Carries the
    /// stream id and broadcast metadata so output naming and the ledger work.
    pub fn from_broadcast(channel: &Channel, broadcast: &BroadcastInfo) -> Self {
        Self {
            vod_id: 0,
            stream_id: Some(broadcast.stream_id),
            channel_id: channel.id,
            channel_login: channel.login.clone(),
            title: broadcast.title.clone(),
            description: String::new(),
            created_at: broadcast.started_at,
            published_at: broadcast.started_at,
            duration: (Utc::now() - broadcast.started_at).num_seconds().max(0) as u64,
            thumbnail_url: String::new(),
            view_count: 0,
            game: broadcast.game.clone(),
        }
    }

    async fn fetch_owner_login(api: &ApiClient, vod_id: u64) -> Result<String, TwitchApiError> {
        let body = persisted_query(
            "ComscoreStreamingQuery",
            STREAMING_QUERY_HASH,
            serde_json::json!({
                "channel": "",
                "clipSlug": "",
                "isClip": false,
                "isLive": false,
                "isVodOrCollection": true,
                "vodID": vod_id.to_string(),
            }),
        );
        #[derive(serde::Deserialize)]
        struct VodOwnerData {
            video: Option<VodOwnerVideo>,
        }
        #[derive(serde::Deserialize)]
        struct VodOwnerVideo {
            owner: Option<crate::models::VideoOwner>,
        }
        let responses: Vec<GqlEnvelope<VodOwnerData>> = api.post_gql(body).await?;
        responses
            .into_iter()
            .next()
            .and_then(|r| r.data.video)
            .and_then(|v| v.owner)
            .and_then(|o| o.login.or(o.display_name).map(|n| n.to_lowercase()))
            .ok_or(TwitchApiError::NotFound {
                url: format!("vod {vod_id}"),
            })
    }

    pub fn seconds_since_live(&self) -> i64 {
        (Utc::now() - self.created_at).num_seconds()
    }

    /// Whether this VOD records the given live broadcast. Pairing is by
    /// creation time: within ten seconds of the broadcast start.
    pub fn is_paired_with(&self, broadcast: &BroadcastInfo) -> bool {
        (self.created_at - broadcast.started_at)
            .num_seconds()
            .abs()
            <= PAIRING_WINDOW_SECS
    }

    /// Resolves the VOD master playlist and selects a variant uri.
    pub async fn index_url(
        &self,
        api: &ApiClient,
        quality: &Quality,
    ) -> Result<String, TwitchApiError> {
        let token = self.playback_access_token(api).await?;
        let url = format!("https://usher.ttvnw.net/vod/{}.m3u8", self.vod_id);
        let p = rand::rng().random_range(1_000_000..9_999_999).to_string();
        let params: [(&str, &str); 6] = [
            ("player", "twitchweb"),
            ("nauth", &token.0),
            ("nauthsig", &token.1),
            ("allow_source", "true"),
            ("playlist_include_framerate", "true"),
            ("p", &p),
        ];
        let text = api.get_text_with_params(&url, &params).await?;
        let master = m3u8_rs::parse_master_playlist_res(text.as_bytes())
            .map_err(|e| TwitchApiError::parse("vod master playlist", e.to_string()))?;
        select_variant(&master, quality)
    }

    async fn playback_access_token(
        &self,
        api: &ApiClient,
    ) -> Result<(String, String), TwitchApiError> {
        let query = format!(
            r#"{{
    videoPlaybackAccessToken(
        id: {},
        params: {{
            platform: "web",
            playerBackend: "mediaplayer",
            playerType: "site"
        }}
    ) {{
        signature
        value
    }}
}}"#,
            self.vod_id
        );
        let responses: Vec<GqlEnvelope<VideoTokenData>> = api
            .post_gql(serde_json::json!({ "query": query }))
            .await?;
        let token = responses
            .into_iter()
            .next()
            .and_then(|r| r.data.video_playback_access_token)
            .ok_or_else(|| TwitchApiError::gql("no video playback access token returned"))?;
        Ok((token.value, token.signature))
    }

    /// Fetches the media playlist and refreshes the duration from its
    /// `#EXT-X-TWITCH-TOTAL-SECS` tag, which outlives the metadata endpoint's
    /// rounded value.
    pub async fn playlist_text(
        &mut self,
        api: &ApiClient,
        index_url: &str,
    ) -> Result<String, TwitchApiError> {
        let text = api.get_text(index_url).await?;
        if let Some(secs) = total_secs(&text) {
            self.duration = secs;
        }
        Ok(text)
    }

    /// Spans of the VOD muted by Twitch. Empty for stream-only archives.
    pub async fn muted_segment_ranges(
        &self,
        api: &ApiClient,
    ) -> Result<Vec<MutedRange>, TwitchApiError> {
        if self.vod_id == 0 {
            return Ok(Vec::new());
        }
        let body = persisted_query(
            "VideoPlayer_MutedSegmentsAlertOverlay",
            MUTED_SEGMENTS_HASH,
            serde_json::json!({ "includePrivate": false, "vodID": self.vod_id.to_string() }),
        );
        let responses: Vec<GqlEnvelope<VideoQueryData<MuteInfoVideo>>> = api.post_gql(body).await?;
        let ranges = responses
            .into_iter()
            .next()
            .and_then(|r| r.data.video)
            .and_then(|v| v.mute_info)
            .and_then(|m| m.muted_segment_connection)
            .map(|c| {
                c.nodes
                    .into_iter()
                    .map(|n| MutedRange {
                        offset: n.offset,
                        duration: n.duration,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(ranges)
    }

    /// Chapters of the VOD. VODs spanning a single category carry no chapter
    /// moments; one covering chapter is synthesized from the category then.
    pub async fn chapters(&self, api: &ApiClient) -> Result<Vec<Chapter>, TwitchApiError> {
        if self.vod_id == 0 {
            return Ok(self.fallback_chapter());
        }
        let body = persisted_query(
            "VideoPlayer_ChapterSelectButtonVideo",
            CHAPTERS_HASH,
            serde_json::json!({ "includePrivate": false, "videoID": self.vod_id.to_string() }),
        );
        let responses: Vec<GqlEnvelope<VideoQueryData<MomentsVideo>>> = api.post_gql(body).await?;
        let moments = responses
            .into_iter()
            .next()
            .and_then(|r| r.data.video)
            .and_then(|v| v.moments)
            .map(|m| m.edges)
            .unwrap_or_default();

        if moments.is_empty() {
            return Ok(self.fallback_chapter());
        }

        Ok(moments
            .into_iter()
            .map(|e| Chapter {
                description: e
                    .node
                    .description
                    .or_else(|| e.node.game.and_then(|g| g.display_name.or(g.name)))
                    .unwrap_or_default(),
                position_secs: e.node.position_milliseconds as f64 / 1000.0,
                duration_secs: e.node.duration_milliseconds as f64 / 1000.0,
            })
            .collect())
    }

    fn fallback_chapter(&self) -> Vec<Chapter> {
        if self.game.is_empty() {
            return Vec::new();
        }
        vec![Chapter {
            description: self.game.clone(),
            position_secs: 0.0,
            duration_secs: self.duration as f64,
        }]
    }

    /// Derives the stream id when the thumbnail is still the processing
    /// placeholder, via the seek-preview storage url.
    pub async fn resolve_stream_id(&mut self, api: &ApiClient) -> Result<Option<u64>, TwitchApiError> {
        if self.stream_id.is_some() {
            return Ok(self.stream_id);
        }
        if self.vod_id == 0 {
            return Ok(None);
        }
        let body = persisted_query(
            "VideoPlayer_VODSeekbarPreviewVideo",
            SEEK_PREVIEWS_HASH,
            serde_json::json!({ "includePrivate": false, "videoID": self.vod_id.to_string() }),
        );
        let responses: Vec<GqlEnvelope<VideoQueryData<SeekPreviewsVideo>>> =
            api.post_gql(body).await?;
        let seek_url = responses
            .into_iter()
            .next()
            .and_then(|r| r.data.video)
            .and_then(|v| v.seek_previews_url);
        if let Some(url) = seek_url {
            self.stream_id = stream_id_from_seek_url(&url);
        }
        Ok(self.stream_id)
    }
}

/// Extracts the stream id from a VOD thumbnail url. The storage path segment
/// is `<login>_<stream id>_<epoch>`; the id is taken from the end since
/// logins may themselves contain underscores. Processing placeholders carry
/// no id.
pub fn stream_id_from_thumbnail(thumbnail_url: &str) -> Option<u64> {
    if thumbnail_url.is_empty() || thumbnail_url.contains("404_processing") {
        return None;
    }
    let path_segment = thumbnail_url.split('/').nth(5)?;
    let fields: Vec<&str> = path_segment.split('_').collect();
    fields.get(fields.len().checked_sub(2)?)?.parse().ok()
}

fn stream_id_from_seek_url(seek_url: &str) -> Option<u64> {
    let path_segment = seek_url.split('/').nth(3)?;
    let fields: Vec<&str> = path_segment.split('_').collect();
    fields.get(fields.len().checked_sub(2)?)?.parse().ok()
}

fn total_secs(playlist: &str) -> Option<u64> {
    let re = Regex::new(r"#EXT-X-TWITCH-TOTAL-SECS:([0-9.]+)").ok()?;
    let captures = re.captures(playlist)?;
    let secs: f64 = captures.get(1)?.as_str().parse().ok()?;
    Some(secs.floor() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_extracted_from_thumbnail_path() {
        let url = "https://static-cdn.jtvnw.net/cf_vods/d2nvs31859zcd8/some_user_316242877421_1676567364/thumb/thumb0-90x60.jpg";
        assert_eq!(stream_id_from_thumbnail(url), Some(316242877421));
    }

    #[test]
    fn processing_thumbnail_yields_no_stream_id() {
        let url = "https://vod-secure.twitch.tv/_404/404_processing_90x60.png";
        assert_eq!(stream_id_from_thumbnail(url), None);
        assert_eq!(stream_id_from_thumbnail(""), None);
    }

    #[test]
    fn stream_id_extracted_from_seek_url() {
        let url = "https://d2nvs31859zcd8.cloudfront.net/some_user_316242877421_1676567364/storyboards/1234-info.json";
        assert_eq!(stream_id_from_seek_url(url), Some(316242877421));
    }

    #[test]
    fn total_secs_parsed_and_floored() {
        let playlist = "#EXTM3U\n#EXT-X-TWITCH-TOTAL-SECS:3819.34\n#EXTINF:10.0,\n0.ts\n";
        assert_eq!(total_secs(playlist), Some(3819));
        assert_eq!(total_secs("#EXTM3U\n"), None);
    }

    #[test]
    fn muted_range_segment_ids() {
        let range = MutedRange {
            offset: 300,
            duration: 180,
        };
        let ids: Vec<u64> = range.segment_ids().collect();
        assert_eq!(ids.first(), Some(&30));
        assert_eq!(ids.last(), Some(&47));

        // zero-length ranges still cover their starting segment
        let point = MutedRange {
            offset: 25,
            duration: 0,
        };
        assert_eq!(point.segment_ids().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn pairing_window_is_ten_seconds() {
        let started = Utc::now();
        let broadcast = BroadcastInfo {
            stream_id: 1,
            started_at: started,
            title: String::new(),
            game: String::new(),
        };
        let mut vod = Vod {
            vod_id: 1,
            stream_id: None,
            channel_id: 0,
            channel_login: String::new(),
            title: String::new(),
            description: String::new(),
            created_at: started + chrono::Duration::seconds(9),
            published_at: started,
            duration: 0,
            thumbnail_url: String::new(),
            view_count: 0,
            game: String::new(),
        };
        assert!(vod.is_paired_with(&broadcast));
        vod.created_at = started + chrono::Duration::seconds(11);
        assert!(!vod.is_paired_with(&broadcast));
    }
}
