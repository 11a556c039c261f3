/*!
Persistence primitives for checkpoint blobs.

Explicit serde-friendly structs decoupled from in-memory representations;
conversion stays localized here so store implementations remain lean byte
movers. This module performs no I/O.

Blob layout (JSON-encoded):

```json
{
  "version": 1,
  "sessionId": "sess-ab12cd34",
  "checkpointId": "…uuid…",
  "parentId": null,
  "createdAt": "2026-08-01T12:00:00Z",
  "run": {
    "step": 2,
    "phase": "awaitingResponse",
    "pending_deliveries": [ … ],
    "outstanding_requests": [ … ],
    "executor_states": { "echo": { … } },
    "state_bag": [ … ]
  },
  "typeFingerprint": ["text", "query"]
}
```
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::PersistedRunState;
use crate::types::TypeId;

use super::{CheckpointError, CheckpointInfo, Result};

/// Current blob format version. Bump on incompatible layout changes.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Complete persisted shape of one checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCheckpoint {
    pub version: u32,
    pub session_id: String,
    pub checkpoint_id: String,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub run: PersistedRunState,
    /// Every type id referenced by the captured run; restoration validates
    /// these against the registry before the run may restart.
    pub type_fingerprint: Vec<TypeId>,
}

impl PersistedCheckpoint {
    /// Encode to the opaque byte blob handed to stores.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a store blob, rejecting blobs from newer format versions.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let decoded: Self = serde_json::from_slice(bytes)?;
        if decoded.version > CHECKPOINT_FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: decoded.version,
                supported: CHECKPOINT_FORMAT_VERSION,
            });
        }
        Ok(decoded)
    }

    /// Identifying metadata, as stores index it.
    #[must_use]
    pub fn info(&self) -> CheckpointInfo {
        CheckpointInfo {
            checkpoint_id: self.checkpoint_id.clone(),
            session_id: self.session_id.clone(),
            parent_id: self.parent_id.clone(),
            step: self.run.step,
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunPhase;

    fn sample() -> PersistedCheckpoint {
        PersistedCheckpoint {
            version: CHECKPOINT_FORMAT_VERSION,
            session_id: "sess-1".into(),
            checkpoint_id: "cp-1".into(),
            parent_id: None,
            created_at: Utc::now(),
            run: PersistedRunState {
                step: 3,
                phase: RunPhase::Running,
                pending_deliveries: vec![],
                outstanding_requests: vec![],
                executor_states: Default::default(),
                state_bag: vec![],
            },
            type_fingerprint: vec![TypeId::of("text")],
        }
    }

    #[test]
    fn encode_decode_round_trips() {
        let checkpoint = sample();
        let bytes = checkpoint.encode().unwrap();
        let decoded = PersistedCheckpoint::decode(&bytes).unwrap();
        assert_eq!(decoded, checkpoint);
        // And the round-trip is stable byte-for-byte.
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn newer_versions_are_rejected() {
        let mut checkpoint = sample();
        checkpoint.version = CHECKPOINT_FORMAT_VERSION + 1;
        let bytes = checkpoint.encode().unwrap();
        assert!(matches!(
            PersistedCheckpoint::decode(&bytes),
            Err(CheckpointError::UnsupportedVersion { .. })
        ));
    }
}
