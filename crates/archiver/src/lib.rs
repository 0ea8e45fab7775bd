//! Broadcast acquisition and assembly: live capture, VOD download, chat
//! replay archiving, merging, conversion and bounded corruption repair.

pub mod chat;
pub mod error;
pub mod live;
pub mod merge;
pub mod metadata;
pub mod part;
pub mod paths;
pub mod process;
pub mod repair;
pub mod vod_download;

pub use chat::ChatArchiver;
pub use error::{ArchiveError, Result};
pub use live::LiveCapture;
pub use merge::{MergePlan, Merger};
pub use part::{ALIGNMENT_OFFSET_SECS, AlignMode, Part, SegmentAligner};
pub use repair::Repairer;
pub use vod_download::VodDownloader;
