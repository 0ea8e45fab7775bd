//! Persistence and coordination for archived broadcasts.
//!
//! A SQLite ledger tracks which broadcasts have been archived and in which
//! formats; exclusive-create lock files keep concurrent archiver instances
//! off the same broadcast; [`DownloadGuard`] ties the two together around a
//! single download.

pub mod coordinator;
pub mod error;
pub mod lock;
pub mod model;
pub mod pool;
pub mod repository;

pub use coordinator::DownloadGuard;
pub use error::{LedgerError, Result};
pub use lock::{BroadcastLock, LockKey};
pub use model::{ArchiveRecord, MutedSpan};
pub use pool::{DbPool, open_in_memory, open_ledger};
pub use repository::{ArchiveRepository, SqlxArchiveRepository};
