//! Lock + ledger coordination around one broadcast download.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{LedgerError, Result};
use crate::lock::{BroadcastLock, LockKey};
use crate::model::ArchiveRecord;
use crate::repository::ArchiveRepository;

/// Guards one broadcast download end to end.
///
/// Construction checks the ledger for prior completion and takes the
/// cross-process lock; [`finish`](Self::finish) records the outcome and
/// releases. If the guard is dropped without finishing (failure or
/// cancellation), the lock is released and the ledger is left untouched, so
/// a later run retries the broadcast.
pub struct DownloadGuard {
    repository: Arc<dyn ArchiveRepository>,
    lock: Option<BroadcastLock>,
    key: LockKey,
    existing_video: bool,
    existing_chat: bool,
}

impl DownloadGuard {
    /// Begins coordinated work on a broadcast.
    ///
    /// `want_video` / `want_chat` name the formats this run intends to
    /// produce; when the ledger already covers all of them the broadcast is
    /// skipped with [`LedgerError::AlreadyCompleted`] before the lock is
    /// ever taken.
    pub async fn begin(
        repository: Arc<dyn ArchiveRepository>,
        lock_dir: &Path,
        key: LockKey,
        stream_id: i64,
        want_video: bool,
        want_chat: bool,
    ) -> Result<Self> {
        let existing = repository.find_by_stream_id(stream_id).await?;
        if let Some(existing) = &existing
            && existing.covers(want_video, want_chat)
        {
            debug!(stream_id, "broadcast already archived in requested formats");
            return Err(LedgerError::AlreadyCompleted {
                key: key.describe(),
            });
        }
        let (existing_video, existing_chat) =
            existing.map_or((false, false), |r| (r.video_archived, r.chat_archived));

        let lock = BroadcastLock::acquire(lock_dir, key)?;
        Ok(Self {
            repository,
            lock: Some(lock),
            key,
            existing_video,
            existing_chat,
        })
    }

    /// Narrows the requested formats to the ones the ledger does not
    /// already cover, so a partially archived broadcast only gets the
    /// missing work.
    pub fn missing_formats(&self, want_video: bool, want_chat: bool) -> (bool, bool) {
        (
            want_video && !self.existing_video,
            want_chat && !self.existing_chat,
        )
    }

    /// Records a completed download and releases the lock. Flags already set
    /// on the existing row survive the upsert.
    pub async fn finish(mut self, record: &ArchiveRecord) -> Result<()> {
        self.repository.upsert(record).await?;
        debug!(
            vod_id = record.vod_id,
            stream_id = record.stream_id,
            video = record.video_archived,
            chat = record.chat_archived,
            "broadcast recorded in ledger"
        );
        if let Some(lock) = self.lock.take()
            && let Err(e) = lock.release()
        {
            warn!(key = %self.key.describe(), error = %e, "failed to release broadcast lock");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::open_in_memory;
    use crate::repository::SqlxArchiveRepository;
    use chrono::Utc;

    fn record(want_video: bool, want_chat: bool) -> ArchiveRecord {
        ArchiveRecord {
            vod_id: 100,
            stream_id: 200,
            user_id: 1,
            user_login: "somestreamer".into(),
            title: "t".into(),
            created_at: Utc::now(),
            published_at: Utc::now(),
            thumbnail_url: String::new(),
            duration: 10,
            chapters: String::new(),
            muted_segments: "[]".into(),
            video_archived: want_video,
            chat_archived: want_chat,
        }
    }

    async fn repo() -> Arc<dyn ArchiveRepository> {
        Arc::new(SqlxArchiveRepository::new(open_in_memory().await.unwrap()))
    }

    #[tokio::test]
    async fn completed_broadcast_is_skipped_before_locking() {
        let repo = repo().await;
        let dir = tempfile::tempdir().unwrap();

        let guard = DownloadGuard::begin(repo.clone(), dir.path(), LockKey::Vod(100), 200, true, false)
            .await
            .unwrap();
        guard.finish(&record(true, false)).await.unwrap();

        // video already archived, video-only request skips
        let again =
            DownloadGuard::begin(repo.clone(), dir.path(), LockKey::Vod(100), 200, true, false)
                .await;
        assert!(matches!(again, Err(LedgerError::AlreadyCompleted { .. })));

        // chat still missing, chat request proceeds
        let chat_run = DownloadGuard::begin(repo, dir.path(), LockKey::Vod(100), 200, false, true)
            .await
            .unwrap();
        chat_run.finish(&record(false, true)).await.unwrap();
    }

    #[tokio::test]
    async fn requested_formats_narrow_to_whats_missing() {
        let repo = repo().await;
        let dir = tempfile::tempdir().unwrap();

        let guard =
            DownloadGuard::begin(repo.clone(), dir.path(), LockKey::Vod(100), 200, true, false)
                .await
                .unwrap();
        guard.finish(&record(true, false)).await.unwrap();

        // video already archived, a both-formats request leaves only chat
        let guard =
            DownloadGuard::begin(repo.clone(), dir.path(), LockKey::Vod(100), 200, true, true)
                .await
                .unwrap();
        assert_eq!(guard.missing_formats(true, true), (false, true));
        guard.finish(&record(false, true)).await.unwrap();

        let row = repo.find_by_stream_id(200).await.unwrap().unwrap();
        assert!(row.video_archived);
        assert!(row.chat_archived);
    }

    #[tokio::test]
    async fn fresh_broadcast_keeps_all_requested_formats() {
        let repo = repo().await;
        let dir = tempfile::tempdir().unwrap();

        let guard = DownloadGuard::begin(repo, dir.path(), LockKey::Vod(100), 200, true, true)
            .await
            .unwrap();
        assert_eq!(guard.missing_formats(true, true), (true, true));
        assert_eq!(guard.missing_formats(true, false), (true, false));
    }

    #[tokio::test]
    async fn second_instance_is_locked_out_without_ledger_mutation() {
        let repo = repo().await;
        let dir = tempfile::tempdir().unwrap();

        let _guard =
            DownloadGuard::begin(repo.clone(), dir.path(), LockKey::Vod(100), 200, true, true)
                .await
                .unwrap();

        let second =
            DownloadGuard::begin(repo.clone(), dir.path(), LockKey::Vod(100), 200, true, true)
                .await;
        assert!(matches!(second, Err(LedgerError::Locked { .. })));
        assert!(repo.find_by_stream_id(200).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropped_guard_releases_lock_and_records_nothing() {
        let repo = repo().await;
        let dir = tempfile::tempdir().unwrap();

        {
            let _guard =
                DownloadGuard::begin(repo.clone(), dir.path(), LockKey::Vod(100), 200, true, true)
                    .await
                    .unwrap();
            // dropped without finish, as on failure or ctrl-c
        }

        assert!(repo.find_by_stream_id(200).await.unwrap().is_none());
        let retry = DownloadGuard::begin(repo, dir.path(), LockKey::Vod(100), 200, true, true).await;
        assert!(retry.is_ok());
    }

    #[tokio::test]
    async fn finish_merges_flags_into_existing_row() {
        let repo = repo().await;
        let dir = tempfile::tempdir().unwrap();

        let guard = DownloadGuard::begin(repo.clone(), dir.path(), LockKey::Vod(100), 200, true, false)
            .await
            .unwrap();
        guard.finish(&record(true, false)).await.unwrap();

        let guard = DownloadGuard::begin(repo.clone(), dir.path(), LockKey::Vod(100), 200, false, true)
            .await
            .unwrap();
        guard.finish(&record(false, true)).await.unwrap();

        let row = repo.find_by_stream_id(200).await.unwrap().unwrap();
        assert!(row.video_archived);
        assert!(row.chat_archived);
    }
}
