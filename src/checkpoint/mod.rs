//! Checkpoint engine: capture, storage, and restoration of run state.
//!
//! Checkpoints per session form a tree: the first checkpoint is a root,
//! each subsequent one's parent is the checkpoint active when it was taken,
//! and restoring an earlier node then continuing creates a sibling branch.
//! Stores persist opaque byte blobs; all encoding lives in
//! [`persistence`] so back-ends stay interchangeable.

pub mod engine;
pub mod persistence;
#[cfg(feature = "sqlite")]
pub mod store_sqlite;

pub use engine::CheckpointManager;
pub use persistence::{PersistedCheckpoint, CHECKPOINT_FORMAT_VERSION};
#[cfg(feature = "sqlite")]
pub use store_sqlite::SqliteCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use thiserror::Error;

use crate::executor::ExecutorError;
use crate::scheduler::RestoreError;

/// Errors from checkpoint operations.
#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    /// The referenced checkpoint does not exist in the store.
    #[error("checkpoint `{checkpoint_id}` not found in session `{session_id}`")]
    #[diagnostic(
        code(relaygraph::checkpoint::not_found),
        help("List checkpoints with retrieve_index to see what the session holds.")
    )]
    NotFound {
        session_id: String,
        checkpoint_id: String,
    },

    /// A checkpoint with this id already exists; the engine retries id
    /// generation on this.
    #[error("checkpoint id `{checkpoint_id}` already exists in session `{session_id}`")]
    #[diagnostic(code(relaygraph::checkpoint::conflict))]
    Conflict {
        session_id: String,
        checkpoint_id: String,
    },

    /// Backend storage error (database, filesystem, etc.).
    #[error("backend error: {message}")]
    #[diagnostic(
        code(relaygraph::checkpoint::backend),
        help("Check backend connectivity and permissions; backend message: {message}.")
    )]
    Backend { message: String },

    /// Blob encoding/decoding failure.
    #[error(transparent)]
    #[diagnostic(code(relaygraph::checkpoint::codec))]
    Codec(#[from] serde_json::Error),

    /// The blob was written by a newer format version.
    #[error("unsupported checkpoint format version {found} (supported: {supported})")]
    #[diagnostic(code(relaygraph::checkpoint::version))]
    UnsupportedVersion { found: u32, supported: u32 },

    /// An executor's `on_checkpointing` hook failed.
    #[error("executor checkpoint hook failed")]
    #[diagnostic(code(relaygraph::checkpoint::executor))]
    Executor {
        #[source]
        source: ExecutorError,
    },

    /// Restoration failed; the run refuses to restart.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Restore(#[from] RestoreError),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Selects the backing implementation constructed by the runner.
///
/// * `InMemory` — volatile process-local storage; fast, non-durable,
///   suitable for tests and ephemeral runs.
/// * `Sqlite` — durable file (or memory) backed storage via
///   [`SqliteCheckpointStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointStoreType {
    /// In-memory (non-durable) checkpointing.
    InMemory,
    #[cfg(feature = "sqlite")]
    /// SQLite-backed durable checkpointing.
    Sqlite,
}

/// Identifying metadata of a stored checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub checkpoint_id: String,
    pub session_id: String,
    /// `None` for the root of a session's checkpoint tree.
    pub parent_id: Option<String>,
    /// The next step the restored run will execute; a checkpoint captured
    /// at the end of step `N` records `N + 1`.
    pub step: u64,
    pub created_at: DateTime<Utc>,
}

/// Pluggable storage for checkpoint blobs.
///
/// Implementations persist opaque bytes keyed by `(session, checkpoint)`;
/// `create_checkpoint` must reject an id that already exists in the session
/// (compare-and-set), which is what makes engine-side id retry safe under
/// races.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a blob under the identity in `info`.
    ///
    /// # Errors
    ///
    /// * `Conflict` — the checkpoint id already exists in this session
    /// * `Backend` — storage failure
    async fn create_checkpoint(&self, info: &CheckpointInfo, value: Vec<u8>) -> Result<()>;

    /// Load the blob for a previously indexed checkpoint.
    ///
    /// # Errors
    ///
    /// * `NotFound` — no such checkpoint in the session
    /// * `Backend` — storage failure
    async fn retrieve_checkpoint(&self, session_id: &str, info: &CheckpointInfo)
        -> Result<Vec<u8>>;

    /// Index a session's checkpoints in creation order, optionally filtered
    /// to children of `with_parent`.
    async fn retrieve_index(
        &self,
        session_id: &str,
        with_parent: Option<&str>,
    ) -> Result<Vec<CheckpointInfo>>;
}

/// Volatile in-process store; suitable for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    // Creation order per session is the index order.
    inner: RwLock<FxHashMap<String, Vec<(CheckpointInfo, Vec<u8>)>>>,
}

impl InMemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn create_checkpoint(&self, info: &CheckpointInfo, value: Vec<u8>) -> Result<()> {
        let mut map = self.inner.write().map_err(|e| CheckpointError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        let entries = map.entry(info.session_id.clone()).or_default();
        if entries
            .iter()
            .any(|(existing, _)| existing.checkpoint_id == info.checkpoint_id)
        {
            return Err(CheckpointError::Conflict {
                session_id: info.session_id.clone(),
                checkpoint_id: info.checkpoint_id.clone(),
            });
        }
        entries.push((info.clone(), value));
        Ok(())
    }

    async fn retrieve_checkpoint(
        &self,
        session_id: &str,
        info: &CheckpointInfo,
    ) -> Result<Vec<u8>> {
        let map = self.inner.read().map_err(|e| CheckpointError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        map.get(session_id)
            .and_then(|entries| {
                entries
                    .iter()
                    .find(|(existing, _)| existing.checkpoint_id == info.checkpoint_id)
                    .map(|(_, blob)| blob.clone())
            })
            .ok_or_else(|| CheckpointError::NotFound {
                session_id: session_id.to_string(),
                checkpoint_id: info.checkpoint_id.clone(),
            })
    }

    async fn retrieve_index(
        &self,
        session_id: &str,
        with_parent: Option<&str>,
    ) -> Result<Vec<CheckpointInfo>> {
        let map = self.inner.read().map_err(|e| CheckpointError::Backend {
            message: format!("lock poisoned: {e}"),
        })?;
        let entries = map.get(session_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(entries
            .iter()
            .map(|(info, _)| info.clone())
            .filter(|info| match with_parent {
                Some(parent) => info.parent_id.as_deref() == Some(parent),
                None => true,
            })
            .collect())
    }
}
