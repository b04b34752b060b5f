use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::{Error, Result};

/// Open the SQLite pool and apply embedded migrations.
///
/// In-memory URLs get a single connection that never expires, otherwise
/// every pooled connection would see its own empty database.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let in_memory = url.contains(":memory:");
    let mut options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?
    };

    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .map_err(|e| Error::Config(format!("database migration failed: {e}")))?;

    info!(in_memory, "Database ready");
    Ok(pool)
}

/// Fresh in-memory database with the schema applied.
pub async fn memory() -> Result<SqlitePool> {
    connect("sqlite::memory:").await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pool_has_schema() {
        let pool = memory().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conditions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
