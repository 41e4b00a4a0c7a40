//! Database layer: pool setup, migrations and small shared helpers.

use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::errors::Result;

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    connect(database_url, 5).await
}

async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    // Make sure the file is created if it doesn't exist yet.
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let url = if url.contains(":memory:") || url.contains("mode=") {
        url
    } else if url.contains('?') {
        format!("{url}&mode=rwc")
    } else {
        format!("{url}?mode=rwc")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// Current time as Unix seconds, the unit every timestamp column uses.
pub fn now() -> i64 {
    Utc::now().timestamp()
}

/// Random identifier with a readable prefix, e.g. `task_3f2a…`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().as_simple())
}

/// A single-connection in-memory pool with the schema applied.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    connect("sqlite::memory:", 1)
        .await
        .expect("in-memory pool")
}

/// A file-backed pool with several connections, for tests that need writers
/// racing on separate connections. The database files go away on drop.
#[cfg(test)]
pub struct FileTestDb {
    pub pool: SqlitePool,
    path: std::path::PathBuf,
}

#[cfg(test)]
impl FileTestDb {
    pub async fn open(max_connections: u32) -> Self {
        let path = std::env::temp_dir().join(format!("{}.db", new_id("marketplace_test")));
        let pool = connect(&path.display().to_string(), max_connections)
            .await
            .expect("file-backed pool");
        Self { pool, path }
    }
}

#[cfg(test)]
impl Drop for FileTestDb {
    fn drop(&mut self) {
        for suffix in ["", "-journal", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", self.path.display()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_create_core_tables() {
        let pool = test_pool().await;
        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<_> = tables.into_iter().map(|(n,)| n).collect();
        for expected in [
            "tasks",
            "orders",
            "idempotency_records",
            "ai_usage_minute",
            "ai_usage_monthly",
            "webhook_endpoints",
            "webhook_deliveries",
            "outbox_events",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn file_pool_hands_out_independent_connections() {
        let db = FileTestDb::open(4).await;
        let mut first = db.pool.acquire().await.unwrap();
        let mut second = db.pool.acquire().await.unwrap();
        sqlx::query("INSERT INTO humans (id, status) VALUES ('human_1', 'available')")
            .execute(&mut *first)
            .await
            .unwrap();
        let (seen,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM humans")
            .fetch_one(&mut *second)
            .await
            .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn ids_carry_prefix() {
        let id = new_id("task");
        assert!(id.starts_with("task_"));
        assert_eq!(id.len(), "task_".len() + 32);
    }
}
