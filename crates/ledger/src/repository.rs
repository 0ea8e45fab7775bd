//! Archive record repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::error::Result;
use crate::model::ArchiveRecord;

#[async_trait]
pub trait ArchiveRepository: Send + Sync {
    async fn find_by_stream_id(&self, stream_id: i64) -> Result<Option<ArchiveRecord>>;

    /// Inserts or replaces the record. Archival flags are merged with any
    /// existing row by OR, so a flag once set is never downgraded.
    async fn upsert(&self, record: &ArchiveRecord) -> Result<()>;

    /// Stream ids of every broadcast of the given user present in the ledger.
    async fn archived_stream_ids(&self, user_login: &str) -> Result<Vec<i64>>;
}

/// SQLx implementation of [`ArchiveRepository`].
pub struct SqlxArchiveRepository {
    pool: SqlitePool,
}

impl SqlxArchiveRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArchiveRepository for SqlxArchiveRepository {
    async fn find_by_stream_id(&self, stream_id: i64) -> Result<Option<ArchiveRecord>> {
        let record =
            sqlx::query_as::<_, ArchiveRecord>("SELECT * FROM vods WHERE stream_id = ?")
                .bind(stream_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(record)
    }

    async fn upsert(&self, record: &ArchiveRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vods (
                vod_id, stream_id, user_id, user_login, title,
                created_at, published_at, thumbnail_url, duration,
                chapters, muted_segments, video_archived, chat_archived
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (vod_id, stream_id) DO UPDATE SET
                user_id = excluded.user_id,
                user_login = excluded.user_login,
                title = excluded.title,
                created_at = excluded.created_at,
                published_at = excluded.published_at,
                thumbnail_url = excluded.thumbnail_url,
                duration = excluded.duration,
                chapters = excluded.chapters,
                muted_segments = excluded.muted_segments,
                video_archived = vods.video_archived OR excluded.video_archived,
                chat_archived = vods.chat_archived OR excluded.chat_archived
            "#,
        )
        .bind(record.vod_id)
        .bind(record.stream_id)
        .bind(record.user_id)
        .bind(&record.user_login)
        .bind(&record.title)
        .bind(record.created_at)
        .bind(record.published_at)
        .bind(&record.thumbnail_url)
        .bind(record.duration)
        .bind(&record.chapters)
        .bind(&record.muted_segments)
        .bind(record.video_archived)
        .bind(record.chat_archived)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn archived_stream_ids(&self, user_login: &str) -> Result<Vec<i64>> {
        let ids: Vec<(i64,)> =
            sqlx::query_as("SELECT stream_id FROM vods WHERE user_login = ?")
                .bind(user_login)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::open_in_memory;
    use chrono::Utc;

    fn record(vod_id: i64, stream_id: i64) -> ArchiveRecord {
        ArchiveRecord {
            vod_id,
            stream_id,
            user_id: 44,
            user_login: "somestreamer".into(),
            title: "a broadcast".into(),
            created_at: Utc::now(),
            published_at: Utc::now(),
            thumbnail_url: String::new(),
            duration: 3600,
            chapters: String::new(),
            muted_segments: "[]".into(),
            video_archived: false,
            chat_archived: false,
        }
    }

    #[tokio::test]
    async fn upsert_and_find_round_trip() {
        let pool = open_in_memory().await.unwrap();
        let repo = SqlxArchiveRepository::new(pool);

        let mut rec = record(100, 200);
        rec.video_archived = true;
        repo.upsert(&rec).await.unwrap();

        let found = repo.find_by_stream_id(200).await.unwrap().unwrap();
        assert_eq!(found.vod_id, 100);
        assert!(found.video_archived);
        assert!(!found.chat_archived);

        assert!(repo.find_by_stream_id(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn archived_flags_are_never_downgraded() {
        let pool = open_in_memory().await.unwrap();
        let repo = SqlxArchiveRepository::new(pool);

        let mut rec = record(100, 200);
        rec.video_archived = true;
        repo.upsert(&rec).await.unwrap();

        // later run archives only chat, reporting video_archived = false
        rec.video_archived = false;
        rec.chat_archived = true;
        repo.upsert(&rec).await.unwrap();

        let found = repo.find_by_stream_id(200).await.unwrap().unwrap();
        assert!(found.video_archived);
        assert!(found.chat_archived);
    }

    #[tokio::test]
    async fn archived_stream_ids_filters_by_user() {
        let pool = open_in_memory().await.unwrap();
        let repo = SqlxArchiveRepository::new(pool);

        repo.upsert(&record(1, 10)).await.unwrap();
        repo.upsert(&record(2, 20)).await.unwrap();
        let mut other = record(3, 30);
        other.user_login = "someoneelse".into();
        repo.upsert(&other).await.unwrap();

        let mut ids = repo.archived_stream_ids("somestreamer").await.unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![10, 20]);
    }
}
