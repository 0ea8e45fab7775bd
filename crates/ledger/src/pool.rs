//! SQLite connection pool setup and schema management.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Pool, Sqlite};

use crate::error::Result;

pub type DbPool = Pool<Sqlite>;

const DEFAULT_POOL_SIZE: u32 = 5;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Opens (creating if missing) the ledger database at the given path.
pub async fn open_ledger(database_path: &Path) -> Result<DbPool> {
    let connect_options = SqliteConnectOptions::new()
        .filename(database_path)
        // WAL so a reader enumerating archived broadcasts never blocks a
        // concurrent writer finishing one
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(DEFAULT_POOL_SIZE)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(connect_options)
        .await?;

    run_migrations(&pool).await?;

    tracing::debug!(path = %database_path.display(), "ledger database opened");
    Ok(pool)
}

/// In-memory pool for tests.
pub async fn open_in_memory() -> Result<DbPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::new().in_memory(true))
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vods (
            vod_id          INTEGER NOT NULL,
            stream_id       INTEGER NOT NULL,
            user_id         INTEGER NOT NULL,
            user_login      TEXT NOT NULL,
            title           TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            published_at    TEXT NOT NULL,
            thumbnail_url   TEXT NOT NULL DEFAULT '',
            duration        INTEGER NOT NULL DEFAULT 0,
            chapters        TEXT NOT NULL DEFAULT '',
            muted_segments  TEXT NOT NULL DEFAULT '[]',
            video_archived  INTEGER NOT NULL DEFAULT 0,
            chat_archived   INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (vod_id, stream_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vods_user_login ON vods (user_login)")
        .execute(pool)
        .await?;

    Ok(())
}
