//! Error types for the channel/state model and checkpoint operations

use thiserror::Error;

/// Result type for channel and checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors raised by the channel model, codecs, reducers, and checkpoint stores
///
/// The step engine in `lockstep-core` wraps this type and maps each variant
/// into its run-level error taxonomy; downstream store implementations only
/// ever need to produce `Storage`, `NotFound`, or `Unsupported`.
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Two channel specifications share an id
    #[error("duplicate channel id: '{0}'")]
    DuplicateChannelId(String),

    /// A channel id is not present in the schema registry
    #[error("unknown channel id: '{0}'")]
    UnknownChannelId(String),

    /// A checkpointed channel has no codec attached
    #[error("channel '{0}' is checkpointed but has no codec")]
    MissingCodec(String),

    /// A channel specification violates a structural invariant
    #[error("invalid channel spec '{channel}': {reason}")]
    InvalidChannelSpec {
        /// Offending channel id
        channel: String,
        /// What is wrong with it
        reason: String,
    },

    /// A reducer rejected an update
    #[error("reducer failed for update: {0}")]
    Reducer(String),

    /// A message-shaped reducer received a malformed update
    #[error("invalid messages update: {0}")]
    InvalidMessagesUpdate(String),

    /// Checkpointing was required but no store is configured
    #[error("no checkpoint store is configured")]
    StoreMissing,

    /// A persisted checkpoint was produced by different schema/graph versions
    #[error("checkpoint version mismatch: {field} (stored {stored}, current {current})")]
    VersionMismatch {
        /// Which digest mismatched (`schema_version` or `graph_version`)
        field: &'static str,
        /// Digest recorded in the checkpoint
        stored: String,
        /// Digest of the currently compiled artifacts
        current: String,
    },

    /// A persisted channel value failed to decode
    #[error("checkpoint decode failed for channel '{channel}': {detail}")]
    DecodeFailed {
        /// Channel whose bytes failed to decode
        channel: String,
        /// Codec error detail
        detail: String,
    },

    /// A channel value failed to encode during save
    #[error("checkpoint encode failed for channel '{channel}': {detail}")]
    EncodeFailed {
        /// Channel whose value failed to encode
        channel: String,
        /// Codec error detail
        detail: String,
    },

    /// Structural corruption detected in a persisted checkpoint
    #[error("checkpoint corrupt: {0}")]
    Corrupt(String),

    /// No checkpoint exists with the requested id
    #[error("checkpoint not found: {0}")]
    NotFound(String),

    /// The backing store does not implement an optional operation
    #[error("checkpoint store does not support '{0}'")]
    Unsupported(&'static str),

    /// Backend storage failure
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
