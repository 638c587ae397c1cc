//! Batch-run persistence for Riskflow.
//!
//! Holds the run records, per-target status entries, computed values and
//! failure rows that make a long batch computation restartable.
//!
//! # Usage
//!
//! ```rust,ignore
//! use riskflow_db::{BatchDb, BatchRequest, DbConfig, RunCreationMode};
//!
//! let db = BatchDb::open(DbConfig::sqlite("batch.sqlite3")).await?;
//! let started = db.start_batch(&request, RunCreationMode::Auto).await?;
//! if started.is_restart() {
//!     // prune work using db.get_status(...)
//! }
//! db.end_batch(started.run.id).await?;
//! ```

mod error;
mod schema;
mod types;

// Method implementations organized by table group
mod results;
mod runs;

pub use error::{DbError, Result};
pub use types::*;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::info;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum connections in the pool
    pub max_connections: u32,
}

impl DbConfig {
    /// SQLite file database, created when missing.
    pub fn sqlite(path: impl AsRef<str>) -> Self {
        Self {
            url: format!("sqlite:{}?mode=rwc", path.as_ref()),
            max_connections: 5,
        }
    }

    /// In-memory SQLite (for testing). One connection so every query sees the same database.
    pub fn sqlite_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        }
    }

    /// Set maximum connections.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// Handle on the batch database. Cheap to clone.
#[derive(Clone)]
pub struct BatchDb {
    pool: SqlitePool,
}

impl BatchDb {
    /// Open (or create) the database and make sure every table exists.
    pub async fn open(config: DbConfig) -> Result<Self> {
        if let Some(path) = sqlite_file_path(&config.url) {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;

        info!(url = %config.url, "Batch database opened");
        Ok(db)
    }

    /// Get the underlying connection pool (escape hatch for complex queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

// Timestamp utilities
impl BatchDb {
    /// Current time as milliseconds since Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Convert milliseconds to DateTime.
    pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(millis).unwrap_or_else(chrono::Utc::now)
    }
}

fn sqlite_file_path(url: &str) -> Option<&str> {
    let rest = url.strip_prefix("sqlite:")?;
    if rest.starts_with(":memory:") {
        return None;
    }
    Some(rest.split('?').next().unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_database_file() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("nested").join("batch.db");

        let db = BatchDb::open(DbConfig::sqlite(db_path.to_string_lossy()))
            .await
            .unwrap();
        assert!(db_path.exists());

        db.close().await;
    }

    #[test]
    fn test_sqlite_file_path_parsing() {
        assert_eq!(sqlite_file_path("sqlite:/tmp/a.db?mode=rwc"), Some("/tmp/a.db"));
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
        assert_eq!(sqlite_file_path("postgres://x"), None);
    }
}
