//! Database initialization
//!
//! Opens (or creates) the SQLite database backing the broker, the dedup
//! store and persisted settings. Every table is created with
//! `CREATE TABLE IF NOT EXISTS`, so initialization is idempotent.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL lets the worker read job state while another process enqueues
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create every table used by the reindex services
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_settings_table(pool).await?;
    create_kv_sets_table(pool).await?;
    create_kv_hashes_table(pool).await?;
    create_broker_jobs_table(pool).await?;
    create_queue_control_table(pool).await?;
    Ok(())
}

/// Create the settings table
///
/// Stores persisted key-value pairs such as the transaction key high-water mark.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the kv_sets table
///
/// Named sets of string members. The autoincrement id preserves insertion
/// order so pending ids are handed out oldest first.
pub async fn create_kv_sets_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_sets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            set_key TEXT NOT NULL,
            member TEXT NOT NULL,
            UNIQUE (set_key, member)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the kv_hashes table (hash key -> field -> value)
pub async fn create_kv_hashes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_hashes (
            hash_key TEXT NOT NULL,
            field TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (hash_key, field)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the broker_jobs table
///
/// One row per queued job. Completed jobs are deleted; `run_at` is a unix
/// timestamp in milliseconds and gates delayed retries.
pub async fn create_broker_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS broker_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue_name TEXT NOT NULL,
            payload TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL DEFAULT 'inactive'
                CHECK (state IN ('inactive', 'active', 'delayed', 'failed')),
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 1,
            backoff_ms INTEGER NOT NULL DEFAULT 0,
            run_at INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_broker_jobs_claim ON broker_jobs(queue_name, state, priority, id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the queue_control table (pause flags keyed by queue scope)
pub async fn create_queue_control_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_control (
            scope TEXT PRIMARY KEY,
            paused INTEGER NOT NULL DEFAULT 0,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_database_creates_file_and_tables() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("reindexer.db");

        let pool = init_database(&db_path).await.unwrap();
        assert!(db_path.exists());

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        assert_eq!(
            tables,
            vec!["broker_jobs", "kv_hashes", "kv_sets", "queue_control", "settings"]
        );
    }

    #[tokio::test]
    async fn test_create_schema_is_idempotent() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        create_schema(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_broker_jobs_rejects_unknown_state() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();

        let result = sqlx::query(
            "INSERT INTO broker_jobs (queue_name, payload, state, created_at, updated_at) VALUES ('q', '{}', 'complete', 0, 0)",
        )
        .execute(&pool)
        .await;

        assert!(result.is_err());
    }
}
