//! Task-local fingerprints and canonical task/interrupt ids
//!
//! Three canonical encodings, all SHA-256:
//!
//! - **local fingerprint** (`HLF1`) — digest of a task-local overlay:
//!   `"HLF1" || u32be(entries) || Σ(u32be(id_len) || id || u32be(value_len)
//!   || codec_encode(value))`, entries in ascending channel-id order. Every
//!   empty overlay shares one canonical digest.
//! - **task id** (`HTID1`) — lowercase hex of `"HTID1" || run_id(16) ||
//!   u32be(step) || u32be(ordinal) || u32be(node_len) || node ||
//!   u32be(32) || fingerprint`.
//! - **interrupt id** (`HINT1`) — lowercase hex of `"HINT1"` followed by the
//!   winning task id's hex bytes.

use crate::error::{Result, RuntimeError};
use crate::version::put_u32;
use lockstep_checkpoint::channels::SchemaRegistry;
use lockstep_checkpoint::{sha256_digest, sha256_hex, CheckpointError};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Fingerprint a task-local overlay, encoding values through channel codecs
///
/// # Errors
///
/// - `unknownChannelID` — an overlay entry names a channel not in the schema
/// - `checkpointEncodeFailed(channel)` — a codec rejected a value; the
///   smallest failing channel id is reported (entries are visited ascending)
pub fn local_fingerprint(
    registry: &SchemaRegistry,
    overlay: &BTreeMap<String, Value>,
) -> Result<[u8; 32]> {
    let mut encoded = BTreeMap::new();
    for (channel, value) in overlay {
        let spec = registry
            .spec(channel)
            .map_err(|_| RuntimeError::UnknownChannelId(channel.clone()))?;
        let codec = spec
            .codec
            .as_ref()
            .ok_or_else(|| CheckpointError::MissingCodec(channel.clone()))
            .map_err(RuntimeError::from)?;
        let bytes = codec.encode(value).map_err(|e| {
            RuntimeError::from(CheckpointError::EncodeFailed {
                channel: channel.clone(),
                detail: e.to_string(),
            })
        })?;
        encoded.insert(channel.clone(), bytes);
    }
    Ok(fingerprint_encoded(&encoded))
}

/// Fingerprint already-encoded overlay entries (resume-time recheck)
pub fn fingerprint_encoded(entries: &BTreeMap<String, Vec<u8>>) -> [u8; 32] {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"HLF1");
    put_u32(&mut buf, entries.len() as u32);
    for (channel, bytes) in entries {
        put_u32(&mut buf, channel.len() as u32);
        buf.extend_from_slice(channel.as_bytes());
        put_u32(&mut buf, bytes.len() as u32);
        buf.extend_from_slice(bytes);
    }
    sha256_digest(&buf)
}

/// Canonical empty-overlay fingerprint
pub fn empty_fingerprint() -> [u8; 32] {
    fingerprint_encoded(&BTreeMap::new())
}

/// Canonical task id for a `(run, step, ordinal, node, overlay)` tuple
pub fn task_id(
    run_id: &Uuid,
    step_index: u32,
    ordinal: u32,
    node_id: &str,
    local_fingerprint: &[u8; 32],
) -> String {
    let mut buf = Vec::with_capacity(5 + 16 + 4 + 4 + 4 + node_id.len() + 4 + 32);
    buf.extend_from_slice(b"HTID1");
    buf.extend_from_slice(run_id.as_bytes());
    put_u32(&mut buf, step_index);
    put_u32(&mut buf, ordinal);
    put_u32(&mut buf, node_id.len() as u32);
    buf.extend_from_slice(node_id.as_bytes());
    put_u32(&mut buf, local_fingerprint.len() as u32);
    buf.extend_from_slice(local_fingerprint);
    sha256_hex(&buf)
}

/// Canonical interrupt id derived from the winning task id
pub fn interrupt_id(winning_task_id: &str) -> String {
    let mut buf = Vec::with_capacity(5 + winning_task_id.len());
    buf.extend_from_slice(b"HINT1");
    buf.extend_from_slice(winning_task_id.as_bytes());
    sha256_hex(&buf)
}
