//! Persisted settings
//!
//! Key-value access to the `settings` table, plus the transaction key
//! high-water mark.

use reindex_common::time::now_millis;
use reindex_common::Result;
use sqlx::SqlitePool;

const TRANSACTION_KEY: &str = "transaction_key";

pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
    Ok(value.flatten())
}

pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// Allocate the next transaction key
///
/// Keys are wall-clock milliseconds when the clock is ahead of the stored
/// mark, and `previous + 1` otherwise, so they strictly increase across runs
/// and processes even if the clock steps backwards.
pub async fn next_transaction_key(pool: &SqlitePool) -> Result<i64> {
    let key: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(key) DO UPDATE SET
            value = CAST(MAX(CAST(settings.value AS INTEGER) + 1, CAST(excluded.value AS INTEGER)) AS TEXT),
            updated_at = CURRENT_TIMESTAMP
        RETURNING CAST(value AS INTEGER)
        "#,
    )
    .bind(TRANSACTION_KEY)
    .bind(now_millis().to_string())
    .fetch_one(pool)
    .await?;
    Ok(key)
}
