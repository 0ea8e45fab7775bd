//! Paginated chat-replay comment fetching.

use crate::api::{ApiClient, GQL_URL, persisted_query};
use crate::error::TwitchApiError;
use crate::models::{ChatMessage, CommentsVideo, GqlEnvelope, VideoQueryData};

const COMMENTS_HASH: &str = "b70a3591ff0f4e0313d126c6a1502d79a1c02baebb288227c582044aa76adf6a";

/// Where to resume a comment page fetch from.
#[derive(Debug, Clone)]
pub enum CommentCursor {
    /// Seconds into the VOD; used for the first page and for resumption.
    Offset(u64),
    /// Opaque cursor returned with the previous page.
    Cursor(String),
}

/// Fetches one page of chat comments, returning the messages and the cursor
/// for the next page if one exists.
pub async fn video_comments(
    api: &ApiClient,
    video_id: u64,
    position: &CommentCursor,
) -> Result<(Vec<ChatMessage>, Option<String>), TwitchApiError> {
    let variables = match position {
        CommentCursor::Offset(offset) => serde_json::json!({
            "videoID": video_id.to_string(),
            "contentOffsetSeconds": offset,
        }),
        CommentCursor::Cursor(cursor) => serde_json::json!({
            "videoID": video_id.to_string(),
            "cursor": cursor,
        }),
    };
    let body = persisted_query("VideoCommentsByOffsetOrCursor", COMMENTS_HASH, variables);

    let responses: Vec<GqlEnvelope<VideoQueryData<CommentsVideo>>> = api.post_gql(body).await?;
    let comments = responses
        .into_iter()
        .next()
        .and_then(|r| r.data.video)
        .ok_or(TwitchApiError::NotFound {
            url: format!("{GQL_URL} (vod {video_id} comments)"),
        })?
        .comments;

    let Some(comments) = comments else {
        return Ok((Vec::new(), None));
    };

    let has_next = comments.page_info.as_ref().is_some_and(|p| p.has_next_page);
    let next_cursor = if has_next {
        comments.edges.last().and_then(|e| e.cursor.clone())
    } else {
        None
    };
    let messages = comments.edges.into_iter().map(|e| e.node).collect();
    Ok((messages, next_cursor))
}
