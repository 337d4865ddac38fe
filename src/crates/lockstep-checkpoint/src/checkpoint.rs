//! Checkpoint data model
//!
//! A checkpoint is the serialized snapshot of one thread at a commit
//! boundary: codec-encoded global state, the pending frontier with per-task
//! overlays and fingerprints, join-barrier progress, the optional pending
//! interruption, and the schema/graph version digests that gate restoration.
//!
//! Checkpoint ids are content-independent and canonical: the lowercase
//! SHA-256 hex of `"HCP1" || run_id_bytes(16) || u32be(step_index)`, so the
//! id of the checkpoint for a given `(run, step)` can be recomputed anywhere.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Byte length of a task-local overlay fingerprint (SHA-256)
pub const FINGERPRINT_LEN: usize = 32;

/// Compute the lowercase hex SHA-256 of a byte string
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Compute the raw SHA-256 digest of a byte string
pub fn sha256_digest(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Canonical checkpoint id for a `(run, step)` pair
pub fn checkpoint_id(run_id: &Uuid, step_index: u32) -> String {
    let mut bytes = Vec::with_capacity(5 + 16 + 4);
    bytes.extend_from_slice(b"HCP1");
    bytes.extend_from_slice(run_id.as_bytes());
    bytes.extend_from_slice(&step_index.to_be_bytes());
    sha256_hex(&bytes)
}

/// Scheduling provenance of a frontier task
///
/// Determines deduplication (graph- and join-seeds deduplicate, spawn-seeds
/// never do) and trigger filtering (join-seeds bypass `runWhen`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskProvenance {
    /// Seeded from a static edge, router decision, or start set
    Graph,
    /// Seeded by a join barrier firing
    Join,
    /// Seeded by a parent task's spawn directive
    Spawn,
}

/// One frontier task as persisted in a checkpoint
///
/// The runtime task id is not stored; it is recomputed on resume from the
/// run id, step index, ordinal, node id, and the overlay fingerprint, which
/// doubles as a corruption check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierTask {
    /// Scheduling provenance
    pub provenance: TaskProvenance,
    /// Node this task will execute
    pub node_id: String,
    /// SHA-256 fingerprint of the task-local overlay (32 bytes)
    pub local_fingerprint: Vec<u8>,
    /// Explicitly-set task-local entries, codec-encoded, keyed by channel id
    pub local_data: BTreeMap<String, Vec<u8>>,
}

/// Pending interruption bound to a committed step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInterruption {
    /// Canonical interrupt id (`sha256("HINT1" || winning task id bytes)`)
    pub interrupt_id: String,
    /// Payload supplied by the interrupting node
    pub payload: Value,
    /// Task id of the winning (smallest-ordinal) interrupt request
    pub winning_task_id: String,
    /// Step whose commit created this interruption
    pub step_index: u32,
}

/// Serialized snapshot of a thread at a commit boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Canonical id (see [`checkpoint_id`])
    pub id: String,
    /// Thread this checkpoint belongs to
    pub thread_id: String,
    /// Run that produced it
    pub run_id: Uuid,
    /// Next step to execute when restored
    pub step_index: u32,
    /// Schema version digest of the producing schema
    pub schema_version: String,
    /// Graph version digest of the producing graph
    pub graph_version: String,
    /// Codec-encoded value for every checkpointed global channel
    pub global_data: BTreeMap<String, Vec<u8>>,
    /// Pending frontier, in ordinal order
    pub frontier: Vec<FrontierTask>,
    /// Seen-parent sets per compiled join id, each sorted ascending
    pub join_barriers: BTreeMap<String, Vec<String>>,
    /// Pending interruption, if the producing commit selected one
    pub interruption: Option<PendingInterruption>,
    /// Per-global-channel version counters (trigger support); absent in
    /// checkpoints from graphs without triggers and defaults to empty
    #[serde(default)]
    pub channel_versions: BTreeMap<String, u64>,
    /// Per-node snapshots of observed channel versions; defaults to empty,
    /// which makes every first scheduling fire
    #[serde(default)]
    pub versions_seen: BTreeMap<String, BTreeMap<String, u64>>,
}

impl Checkpoint {
    /// Serialize to canonical JSON bytes
    pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(crate::error::CheckpointError::from)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        serde_json::from_slice(bytes).map_err(crate::error::CheckpointError::from)
    }
}

/// Store-level summary of a persisted checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    /// Checkpoint id
    pub id: String,
    /// Owning thread
    pub thread_id: String,
    /// Step index recorded in the checkpoint
    pub step_index: u32,
    /// Whether an interruption is pending in this checkpoint
    pub interrupted: bool,
    /// Store-side save timestamp (backend metadata, never canonical)
    pub saved_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sha256_hex_known_vector() {
        // sha256("abc")
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_checkpoint_id_deterministic() {
        let run = Uuid::from_u128(0x1234_5678_9abc_def0_1234_5678_9abc_def0);
        let a = checkpoint_id(&run, 3);
        let b = checkpoint_id(&run, 3);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, checkpoint_id(&run, 4));
        assert_ne!(a, checkpoint_id(&Uuid::from_u128(1), 3));
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let run = Uuid::from_u128(42);
        let cp = Checkpoint {
            id: checkpoint_id(&run, 1),
            thread_id: "t-1".to_string(),
            run_id: run,
            step_index: 1,
            schema_version: "s".repeat(64),
            graph_version: "g".repeat(64),
            global_data: BTreeMap::from([("counter".to_string(), b"7".to_vec())]),
            frontier: vec![FrontierTask {
                provenance: TaskProvenance::Spawn,
                node_id: "worker".to_string(),
                local_fingerprint: vec![0u8; FINGERPRINT_LEN],
                local_data: BTreeMap::from([("item".to_string(), b"\"apple\"".to_vec())]),
            }],
            join_barriers: BTreeMap::from([(
                "join:a+b:gate".to_string(),
                vec!["a".to_string()],
            )]),
            interruption: Some(PendingInterruption {
                interrupt_id: "i".repeat(64),
                payload: json!({"reason": "approval"}),
                winning_task_id: "w".repeat(64),
                step_index: 0,
            }),
            channel_versions: BTreeMap::new(),
            versions_seen: BTreeMap::new(),
        };

        let bytes = cp.to_bytes().unwrap();
        let restored = Checkpoint::from_bytes(&bytes).unwrap();
        assert_eq!(restored.id, cp.id);
        assert_eq!(restored.frontier.len(), 1);
        assert_eq!(restored.frontier[0].node_id, "worker");
        assert_eq!(restored.interruption.as_ref().unwrap().payload, json!({"reason": "approval"}));
    }

    #[test]
    fn test_older_checkpoint_defaults_trigger_maps() {
        // A checkpoint serialized before trigger support decodes with empty
        // version maps, which makes every first scheduling fire.
        let run = Uuid::from_u128(7);
        let json = json!({
            "id": checkpoint_id(&run, 0),
            "thread_id": "t",
            "run_id": run,
            "step_index": 0,
            "schema_version": "s".repeat(64),
            "graph_version": "g".repeat(64),
            "global_data": {},
            "frontier": [],
            "join_barriers": {},
            "interruption": null
        });
        let cp: Checkpoint = serde_json::from_value(json).unwrap();
        assert!(cp.channel_versions.is_empty());
        assert!(cp.versions_seen.is_empty());
    }
}
