//! Client for the Twitch GQL and usher endpoints used by the archiver.
//!
//! All requests go through [`ApiClient`], which wraps an injected
//! `reqwest::Client`. Domain types ([`Channel`], [`Vod`]) expose the
//! operations the archiver needs: live broadcast state, VOD metadata,
//! playlist resolution with quality selection, muted segments, chapters and
//! chat-replay comments.

pub mod api;
pub mod channel;
pub mod chat;
pub mod error;
pub mod models;
pub mod quality;
pub mod vod;

pub use api::ApiClient;
pub use channel::{BroadcastInfo, Channel};
pub use chat::CommentCursor;
pub use error::TwitchApiError;
pub use models::ChatMessage;
pub use quality::Quality;
pub use vod::{Chapter, MutedRange, Vod, stream_id_from_thumbnail};
