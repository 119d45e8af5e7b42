use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use log::LevelFilter;
use sqlx::ConnectOptions;
use sqlx::Row;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteSynchronous;
use tracing::warn;

use crate::migrations::MIGRATOR;

mod runs;
mod sessions;
#[cfg(test)]
mod test_support;

/// Logical schema version checked (but not enforced) at startup. Structural
/// migrations are owned by sqlx; this value only gates a startup warning.
pub const SCHEMA_VERSION: &str = "1.0";

/// Handle to the SQLite-backed queue store.
///
/// Cheap to clone; all clones share one connection pool. Writes serialize
/// through SQLite's single-writer model, reads may proceed concurrently.
#[derive(Clone)]
pub struct QueueStore {
    pool: Arc<SqlitePool>,
}

impl QueueStore {
    /// Open (and migrate) the store at `path`, creating the file and its
    /// parent directory when missing. Idempotent.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pool = open_sqlite(path).await.map_err(|err| {
            warn!("failed to open queue store at {}: {err}", path.display());
            err
        })?;
        ensure_schema_version(&pool).await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Flush and release the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        self.pool.as_ref()
    }
}

async fn open_sqlite(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .log_statements(LevelFilter::Off);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

/// Record the schema version on first open; on mismatch, log a warning but
/// keep serving (migrations are out of scope here).
async fn ensure_schema_version(pool: &SqlitePool) -> Result<()> {
    let row = sqlx::query(
        r#"
SELECT version
FROM schema_version
ORDER BY applied_at DESC
LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;
    match row {
        None => {
            sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
                .bind(SCHEMA_VERSION)
                .bind(Utc::now().timestamp())
                .execute(pool)
                .await?;
        }
        Some(row) => {
            let version: String = row.try_get("version")?;
            if version != SCHEMA_VERSION {
                warn!("queue store schema version mismatch: {version} vs {SCHEMA_VERSION}");
            }
        }
    }
    Ok(())
}
