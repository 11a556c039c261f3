/*!
SQLite checkpoint store.

Durable implementation of [`CheckpointStore`] on `sqlx`. The schema is
created on connect, so a fresh database file works without external
migration orchestration.

## Schema

- `checkpoints.session_id` / `checkpoint_id` — composite primary key; the
  unique constraint provides the compare-and-set the engine's id retry
  relies on.
- `checkpoints.parent_id` — tree linkage, indexed per session.
- `checkpoints.step` — next step of the restored run.
- `checkpoints.created_at` — RFC 3339 text.
- `checkpoints.blob` — opaque encoded checkpoint.
*/

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use super::{CheckpointError, CheckpointInfo, CheckpointStore, Result};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS checkpoints (
    session_id    TEXT NOT NULL,
    checkpoint_id TEXT NOT NULL,
    parent_id     TEXT,
    step          INTEGER NOT NULL,
    created_at    TEXT NOT NULL,
    blob          BLOB NOT NULL,
    PRIMARY KEY (session_id, checkpoint_id)
);
";

const PARENT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_checkpoints_parent
    ON checkpoints (session_id, parent_id);
";

/// SQLite-backed [`CheckpointStore`].
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

impl SqliteCheckpointStore {
    /// Connect to `database_url` (e.g. `sqlite://relaygraph.db` or
    /// `sqlite::memory:`) and ensure the schema exists.
    #[instrument(skip(database_url), err)]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(backend_error)?;
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(backend_error)?;
        sqlx::query(PARENT_INDEX)
            .execute(&pool)
            .await
            .map_err(backend_error)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool; assumes the schema is already in place.
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn backend_error(err: sqlx::Error) -> CheckpointError {
    CheckpointError::Backend {
        message: err.to_string(),
    }
}

fn row_to_info(row: &SqliteRow) -> Result<CheckpointInfo> {
    let created_at: String = row.get("created_at");
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| CheckpointError::Backend {
            message: format!("invalid created_at in store: {e}"),
        })?
        .with_timezone(&Utc);
    let step: i64 = row.get("step");
    Ok(CheckpointInfo {
        checkpoint_id: row.get("checkpoint_id"),
        session_id: row.get("session_id"),
        parent_id: row.get("parent_id"),
        step: step as u64,
        created_at,
    })
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn create_checkpoint(&self, info: &CheckpointInfo, value: Vec<u8>) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO checkpoints \
             (session_id, checkpoint_id, parent_id, step, created_at, blob) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&info.session_id)
        .bind(&info.checkpoint_id)
        .bind(&info.parent_id)
        .bind(info.step as i64)
        .bind(info.created_at.to_rfc3339())
        .bind(value)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                let unique = err
                    .as_database_error()
                    .map(|db| db.is_unique_violation())
                    .unwrap_or(false);
                if unique {
                    Err(CheckpointError::Conflict {
                        session_id: info.session_id.clone(),
                        checkpoint_id: info.checkpoint_id.clone(),
                    })
                } else {
                    Err(backend_error(err))
                }
            }
        }
    }

    async fn retrieve_checkpoint(
        &self,
        session_id: &str,
        info: &CheckpointInfo,
    ) -> Result<Vec<u8>> {
        let row = sqlx::query(
            "SELECT blob FROM checkpoints WHERE session_id = ? AND checkpoint_id = ?",
        )
        .bind(session_id)
        .bind(&info.checkpoint_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_error)?;

        match row {
            Some(row) => Ok(row.get::<Vec<u8>, _>("blob")),
            None => Err(CheckpointError::NotFound {
                session_id: session_id.to_string(),
                checkpoint_id: info.checkpoint_id.clone(),
            }),
        }
    }

    async fn retrieve_index(
        &self,
        session_id: &str,
        with_parent: Option<&str>,
    ) -> Result<Vec<CheckpointInfo>> {
        let rows = match with_parent {
            Some(parent) => {
                sqlx::query(
                    "SELECT session_id, checkpoint_id, parent_id, step, created_at \
                     FROM checkpoints \
                     WHERE session_id = ? AND parent_id = ? \
                     ORDER BY rowid",
                )
                .bind(session_id)
                .bind(parent)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT session_id, checkpoint_id, parent_id, step, created_at \
                     FROM checkpoints \
                     WHERE session_id = ? \
                     ORDER BY rowid",
                )
                .bind(session_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(backend_error)?;

        rows.iter().map(row_to_info).collect()
    }
}
