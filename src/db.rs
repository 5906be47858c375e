use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Sqlite, SqlitePool,
};
use std::str::FromStr;
use tracing::info;

pub type DbPool = SqlitePool;

const SCHEMA: &[&str] = &[
    // Owned by the upload collaborator; read-only here.
    r#"
    CREATE TABLE IF NOT EXISTS videos (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        storage_key TEXT NOT NULL,
        sport TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS matches (
        id TEXT PRIMARY KEY,
        analysis_status TEXT NOT NULL DEFAULT 'PENDING'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analysis_jobs (
        id TEXT PRIMARY KEY,
        video_id TEXT NOT NULL REFERENCES videos(id),
        match_id TEXT,
        analysis_type TEXT NOT NULL,
        status TEXT NOT NULL,
        model_config TEXT NOT NULL,
        result_data TEXT,
        error_message TEXT,
        user_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_analysis_jobs_user ON analysis_jobs(user_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS player_trackings (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL REFERENCES analysis_jobs(id),
        player_id TEXT,
        jersey_number INTEGER,
        distance_covered REAL,
        top_speed REAL,
        sprint_count INTEGER,
        tracking_data TEXT NOT NULL,
        heatmap_data TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS match_events (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL REFERENCES analysis_jobs(id),
        match_id TEXT,
        event_type TEXT NOT NULL,
        timestamp REAL NOT NULL,
        player_id TEXT,
        metadata TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    // Replayed callbacks must not duplicate events.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_match_events_dedupe
        ON match_events(job_id, event_type, timestamp, COALESCE(player_id, ''))
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        job_id TEXT NOT NULL REFERENCES analysis_jobs(id),
        kind TEXT NOT NULL,
        title TEXT NOT NULL,
        message TEXT NOT NULL,
        read INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )
    "#,
];

pub async fn init_pool(url: &str) -> Result<DbPool, Box<dyn std::error::Error + Send + Sync>> {
    if !Sqlite::database_exists(url).await.unwrap_or(false) {
        info!("Creating database: {}", url);
        Sqlite::create_database(url).await?;
    }

    // WAL keeps webhook writes from blocking readers of job state.
    let options = SqliteConnectOptions::from_str(url)?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &DbPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// Single-connection in-memory database; every connection to `:memory:`
/// would otherwise see its own empty schema.
#[cfg(test)]
pub async fn memory_pool() -> DbPool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();
    migrate(&pool).await.unwrap();
    pool
}
