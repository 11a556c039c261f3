//! Checkpoint manager: id generation, tree linkage, capture, restore.

use chrono::Utc;
use std::sync::Arc;

use crate::scheduler::SchedulerCore;

use super::persistence::{PersistedCheckpoint, CHECKPOINT_FORMAT_VERSION};
use super::{CheckpointError, CheckpointInfo, CheckpointStore, Result};

/// How many fresh ids to try when the store reports collisions.
const ID_RETRY_LIMIT: usize = 4;

/// Engine coordinating one session's checkpoints against a store.
///
/// Tracks the active checkpoint so each capture links to its parent; after
/// restoring an earlier node, subsequent captures branch under it. Writes
/// are serialized per session.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    session_id: String,
    latest: parking_lot::Mutex<Option<String>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl CheckpointManager {
    #[must_use]
    pub fn new(store: Arc<dyn CheckpointStore>, session_id: impl Into<String>) -> Self {
        Self {
            store,
            session_id: session_id.into(),
            latest: parking_lot::Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The checkpoint future captures will be parented under.
    #[must_use]
    pub fn active_checkpoint(&self) -> Option<String> {
        self.latest.lock().clone()
    }

    /// Capture the run at its current step boundary.
    pub async fn capture(&self, core: &mut SchedulerCore) -> Result<CheckpointInfo> {
        let _write = self.write_lock.lock().await;
        let run = core
            .capture_run_state()
            .await
            .map_err(|source| CheckpointError::Executor { source })?;
        let type_fingerprint = run.type_fingerprint();
        let parent_id = self.latest.lock().clone();

        let mut attempts = 0;
        loop {
            let checkpoint = PersistedCheckpoint {
                version: CHECKPOINT_FORMAT_VERSION,
                session_id: self.session_id.clone(),
                checkpoint_id: uuid::Uuid::new_v4().to_string(),
                parent_id: parent_id.clone(),
                created_at: Utc::now(),
                run: run.clone(),
                type_fingerprint: type_fingerprint.clone(),
            };
            let info = checkpoint.info();
            match self
                .store
                .create_checkpoint(&info, checkpoint.encode()?)
                .await
            {
                Ok(()) => {
                    *self.latest.lock() = Some(info.checkpoint_id.clone());
                    return Ok(info);
                }
                Err(CheckpointError::Conflict { .. }) if attempts < ID_RETRY_LIMIT => {
                    attempts += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Restore `core` from a stored checkpoint.
    ///
    /// Restoration is idempotent: restoring the same checkpoint twice
    /// yields identical initial run states. Future captures become children
    /// of the restored node.
    pub async fn restore(&self, core: &mut SchedulerCore, info: &CheckpointInfo) -> Result<()> {
        let bytes = self
            .store
            .retrieve_checkpoint(&self.session_id, info)
            .await?;
        let decoded = PersistedCheckpoint::decode(&bytes)?;
        core.restore_run_state(decoded.run).await?;
        *self.latest.lock() = Some(info.checkpoint_id.clone());
        Ok(())
    }

    /// Index this session's checkpoints, optionally filtered by parent.
    pub async fn index(&self, with_parent: Option<&str>) -> Result<Vec<CheckpointInfo>> {
        self.store
            .retrieve_index(&self.session_id, with_parent)
            .await
    }
}
