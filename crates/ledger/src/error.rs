#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to access lock directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("broadcast {key} is locked by another archiver instance")]
    Locked { key: String },

    #[error("broadcast {key} is already archived in all requested formats")]
    AlreadyCompleted { key: String },
}

impl LedgerError {
    /// Errors that mean another instance owns the broadcast or the work is
    /// already done; callers skip the broadcast rather than fail.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::Locked { .. } | Self::AlreadyCompleted { .. })
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
