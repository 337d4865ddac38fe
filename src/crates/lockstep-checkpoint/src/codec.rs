//! Codecs - serialization hooks for checkpoint persistence and fingerprinting
//!
//! Every checkpointed channel carries a codec: an `encode`/`decode` pair with
//! a stable id. Encoded bytes appear in checkpoints and in task-local overlay
//! fingerprints, and the codec id participates in the schema version digest —
//! swapping a channel's codec is a schema change.

use crate::error::{CheckpointError, Result};
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;

/// Encode/decode pair for a channel's persisted representation
///
/// Implementations must be deterministic: equal values encode to equal bytes,
/// since encoded bytes feed overlay fingerprints and therefore task ids.
pub trait Codec: Send + Sync + Debug {
    /// Stable codec identifier (part of the schema version digest)
    fn id(&self) -> &str;

    /// Encode a value to bytes
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode a value from bytes
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// Shared codec handle as stored on channel specs
pub type CodecRef = Arc<dyn Codec>;

/// Canonical JSON codec (`json/1`)
///
/// Serializes through `serde_json::to_vec`, which emits object keys in the
/// order the in-memory map holds them; channel values built from decoded
/// checkpoints and reducer folds preserve that order deterministically.
#[derive(Debug, Clone, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec
    pub fn new() -> Self {
        Self
    }

    /// Shared handle, convenient for channel-spec construction
    pub fn shared() -> CodecRef {
        Arc::new(Self)
    }
}

impl Codec for JsonCodec {
    fn id(&self) -> &str {
        "json/1"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(CheckpointError::from)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(CheckpointError::from)
    }
}
