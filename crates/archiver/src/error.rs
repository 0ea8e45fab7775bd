use std::collections::BTreeSet;

use twitch_api::TwitchApiError;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Api(#[from] TwitchApiError),

    #[error("channel is offline")]
    StreamOffline,

    #[error("failed to fetch stream playlist after repeated attempts")]
    StreamFetch,

    /// Raised in aligned mode when the stream advertises parts that cannot
    /// be mapped onto ten-second segments. The caller restarts capture with
    /// a sequential aligner.
    #[error("stream parts cannot be aligned to ten-second segments")]
    UnsupportedPartDuration,

    #[error("failed to download segment {id} after {attempts} attempts")]
    SegmentDownload { id: u64, attempts: u32 },

    #[error("failed to merge downloaded segments: {reason}")]
    Merge { reason: String },

    #[error("video conversion failed: {reason}")]
    Convert { reason: String },

    /// Corrupt segments found during conversion, outside the muted
    /// whitelist. Recoverable through the repair pass.
    #[error("corrupt segments encountered during conversion: {}", format_ids(.ids))]
    CorruptParts { ids: BTreeSet<u64> },

    /// Corrupt segments survived the bounded repair passes, or the index
    /// needed for repair is gone.
    #[error(
        "corrupt segments could not be repaired ({}); delete the listed parts (or the parts directory) and re-archive",
        format_ids(.ids)
    )]
    Unrepairable { ids: BTreeSet<u64> },

    #[error(
        "output duration {actual}s outside tolerance of expected {expected}s; parts kept for inspection"
    )]
    Verification { expected: u64, actual: u64 },

    #[error("chat download failed: {reason}")]
    ChatDownload { reason: String },

    /// A download worker task ended without producing a result (panic or
    /// runtime abort).
    #[error("download worker terminated abnormally: {reason}")]
    WorkerFailed { reason: String },

    #[error("archiving cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn format_ids(ids: &BTreeSet<u64>) -> String {
    ids.iter()
        .map(|id| format!("{id:05}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ArchiveError {
    pub fn merge(reason: impl Into<String>) -> Self {
        Self::Merge {
            reason: reason.into(),
        }
    }

    pub fn convert(reason: impl Into<String>) -> Self {
        Self::Convert {
            reason: reason.into(),
        }
    }

    /// Whether the underlying resource is gone upstream (deleted VOD,
    /// finished stream). Downloads treat this as an end condition rather
    /// than a failure.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Api(e) if e.is_gone())
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_ids_render_padded() {
        let err = ArchiveError::CorruptParts {
            ids: BTreeSet::from([3, 121]),
        };
        let msg = err.to_string();
        assert!(msg.contains("00003"));
        assert!(msg.contains("00121"));
    }
}
