//! Wire models for the GQL responses this crate consumes.
//!
//! Only the fields the archiver reads are modeled; everything else in the
//! responses is ignored during deserialization.

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct GqlEnvelope<T> {
    pub data: T,
}

#[derive(Debug, Deserialize)]
pub struct ChannelShellData {
    #[serde(rename = "userOrError")]
    pub user_or_error: Option<UserShell>,
}

/// `userOrError` answers with a `userDoesNotExist` object for unknown logins,
/// which carries no `id`.
#[derive(Debug, Deserialize)]
pub struct UserShell {
    pub id: Option<String>,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
    pub stream: Option<StreamShell>,
}

#[derive(Debug, Deserialize)]
pub struct StreamShell {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamingQueryUserData {
    pub user: Option<StreamingQueryUser>,
}

#[derive(Debug, Deserialize)]
pub struct StreamingQueryUser {
    pub id: Option<String>,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
    pub stream: Option<StreamNode>,
    #[serde(rename = "broadcastSettings")]
    pub broadcast_settings: Option<BroadcastSettings>,
}

#[derive(Debug, Deserialize)]
pub struct StreamNode {
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    pub game: Option<GameNode>,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastSettings {
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameNode {
    pub id: Option<serde_json::Value>,
    pub name: Option<String>,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VideoLengthData {
    pub user: Option<VideoLengthUser>,
}

#[derive(Debug, Deserialize)]
pub struct VideoLengthUser {
    pub videos: Option<VideoEdges<VideoIdNode>>,
}

#[derive(Debug, Deserialize)]
pub struct VideoEdges<T> {
    pub edges: Vec<Edge<T>>,
    #[serde(rename = "pageInfo", default)]
    pub page_info: Option<PageInfo>,
}

#[derive(Debug, Deserialize)]
pub struct Edge<T> {
    pub node: T,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PageInfo {
    #[serde(rename = "hasNextPage")]
    pub has_next_page: bool,
}

#[derive(Debug, Deserialize)]
pub struct VideoIdNode {
    pub id: String,
}

/// Node shape shared by `FilterableVideoTower_Videos` and `VideoMetadata`.
#[derive(Debug, Deserialize)]
pub struct VideoNode {
    pub id: String,
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "lengthSeconds")]
    pub length_seconds: Option<u64>,
    #[serde(rename = "createdAt")]
    pub created_at: Option<String>,
    #[serde(rename = "publishedAt")]
    pub published_at: Option<String>,
    #[serde(rename = "previewThumbnailURL")]
    pub preview_thumbnail_url: Option<String>,
    #[serde(rename = "viewCount")]
    pub view_count: Option<u64>,
    pub game: Option<GameNode>,
    pub owner: Option<VideoOwner>,
}

#[derive(Debug, Deserialize)]
pub struct VideoOwner {
    pub id: Option<String>,
    pub login: Option<String>,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VideoTowerData {
    pub user: Option<VideoTowerUser>,
}

#[derive(Debug, Deserialize)]
pub struct VideoTowerUser {
    pub videos: Option<VideoEdges<VideoNode>>,
}

#[derive(Debug, Deserialize)]
pub struct VideoMetadataData {
    pub video: Option<VideoNode>,
}

#[derive(Debug, Deserialize)]
pub struct VideoQueryData<T> {
    pub video: Option<T>,
}

#[derive(Debug, Deserialize)]
pub struct MuteInfoVideo {
    #[serde(rename = "muteInfo")]
    pub mute_info: Option<MuteInfo>,
}

#[derive(Debug, Deserialize)]
pub struct MuteInfo {
    #[serde(rename = "mutedSegmentConnection")]
    pub muted_segment_connection: Option<MutedSegmentConnection>,
}

#[derive(Debug, Deserialize)]
pub struct MutedSegmentConnection {
    pub nodes: Vec<MutedSegmentNode>,
}

#[derive(Debug, Deserialize)]
pub struct MutedSegmentNode {
    pub offset: u64,
    pub duration: u64,
}

#[derive(Debug, Deserialize)]
pub struct MomentsVideo {
    pub moments: Option<VideoEdges<MomentNode>>,
}

#[derive(Debug, Deserialize)]
pub struct MomentNode {
    pub id: Option<String>,
    #[serde(rename = "positionMilliseconds")]
    pub position_milliseconds: u64,
    #[serde(rename = "durationMilliseconds")]
    pub duration_milliseconds: u64,
    #[serde(rename = "type")]
    pub moment_type: Option<String>,
    pub description: Option<String>,
    pub game: Option<GameNode>,
}

#[derive(Debug, Deserialize)]
pub struct SeekPreviewsVideo {
    #[serde(rename = "seekPreviewsURL")]
    pub seek_previews_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamTokenData {
    #[serde(rename = "streamPlaybackAccessToken")]
    pub stream_playback_access_token: Option<PlaybackAccessToken>,
}

#[derive(Debug, Deserialize)]
pub struct VideoTokenData {
    #[serde(rename = "videoPlaybackAccessToken")]
    pub video_playback_access_token: Option<PlaybackAccessToken>,
}

#[derive(Debug, Deserialize)]
pub struct PlaybackAccessToken {
    pub signature: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct CommentsVideo {
    pub comments: Option<VideoEdges<ChatMessage>>,
}

/// One chat message as retrieved and exported. The whole node is kept so the
/// verbose JSON export loses nothing the endpoint returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "contentOffsetSeconds")]
    pub content_offset_seconds: f64,
    pub commenter: Option<Commenter>,
    pub message: MessageBody,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commenter {
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub fragments: Vec<MessageFragment>,
    #[serde(rename = "userBadges", default)]
    pub user_badges: Vec<UserBadge>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFragment {
    pub text: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBadge {
    #[serde(rename = "setID")]
    pub set_id: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_shell_missing_user_parses() {
        let body = r#"{"data":{"userOrError":{"userDoesNotExist":"login","__typename":"UserDoesNotExist"}}}"#;
        let parsed: GqlEnvelope<ChannelShellData> = serde_json::from_str(body).unwrap();
        let user = parsed.data.user_or_error.unwrap();
        assert!(user.id.is_none());
    }

    #[test]
    fn chat_message_round_trips_unknown_fields() {
        let body = r#"{
            "id": "abc",
            "createdAt": "2024-01-01T00:00:05Z",
            "contentOffsetSeconds": 5.0,
            "commenter": {"displayName": "viewer", "id": "9"},
            "message": {"fragments": [{"text": "hi"}], "userBadges": [{"setID": "moderator", "version": "1"}]},
            "state": "PUBLISHED"
        }"#;
        let msg: ChatMessage = serde_json::from_str(body).unwrap();
        assert_eq!(msg.message.fragments[0].text, "hi");
        assert_eq!(msg.message.user_badges[0].set_id, "moderator");

        let out = serde_json::to_value(&msg).unwrap();
        assert_eq!(out["state"], "PUBLISHED");
        assert_eq!(out["commenter"]["id"], "9");
    }

    #[test]
    fn video_node_tolerates_sparse_listing_shape() {
        let body = r#"{"id":"222","title":"t","lengthSeconds":120,
            "publishedAt":"2024-01-01T00:00:00Z",
            "previewThumbnailURL":"https://x/preview.jpg","viewCount":3,
            "game":{"id":"1","name":"g"}}"#;
        let node: VideoNode = serde_json::from_str(body).unwrap();
        assert_eq!(node.id, "222");
        assert!(node.created_at.is_none());
        assert_eq!(node.length_seconds, Some(120));
    }
}
