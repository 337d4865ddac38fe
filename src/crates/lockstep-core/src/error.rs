//! Error types for graph compilation and superstep execution
//!
//! All runtime faults are typed errors; panics are reserved for programmer
//! bugs (internal invariants). Node failures map to task failures after
//! retries; reducer and router failures map to commit-time aborts; checkpoint
//! save failures abort the committing step.
//!
//! # Error groups
//!
//! ```text
//! RuntimeError
//! ├── configuration    - InvalidRunOptions, StepIndexOutOfRange, ...
//! ├── schema / graph   - UnknownNodeId, UnknownChannelId, ScopeMismatch, ...
//! ├── commit           - UpdatePolicyViolation, TaskLocalWriteNotAllowed, ...
//! ├── checkpoint       - wrapped CheckpointError (store/codec/corruption)
//! ├── interrupt/resume - InterruptPending, NoInterruptToResume, ...
//! ├── inference        - ModelClientMissing, ModelStreamInvalid, ...
//! └── internal         - InternalInvariantViolation
//! ```
//!
//! Events carry errors as [`ErrorInfo`]: the stable kind name always, the
//! free-form detail only when `debug_payloads` is enabled.

use lockstep_checkpoint::CheckpointError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result type using [`RuntimeError`]
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// All faults the runtime can surface
#[derive(Error, Debug)]
pub enum RuntimeError {
    // --- configuration ---------------------------------------------------
    /// Run options failed validation
    #[error("invalid run options: {0}")]
    InvalidRunOptions(String),

    /// A step index is outside the run's committed range
    #[error("step index {0} out of range")]
    StepIndexOutOfRange(u32),

    /// A task ordinal is outside the frontier
    #[error("task ordinal {0} out of range")]
    TaskOrdinalOutOfRange(u32),

    /// A persisted task-local fingerprint has the wrong length
    #[error("task-local fingerprint must be 32 bytes, got {0}")]
    InvalidTaskLocalFingerprintLength(usize),

    // --- schema / graph --------------------------------------------------
    /// A referenced node id is not declared in the graph
    #[error("unknown node id: '{0}'")]
    UnknownNodeId(String),

    /// A referenced channel id is not declared in the schema
    #[error("unknown channel id: '{0}'")]
    UnknownChannelId(String),

    /// A channel was accessed with the wrong scope
    #[error("scope mismatch for channel '{channel}': {detail}")]
    ScopeMismatch {
        /// Channel id
        channel: String,
        /// What the access expected vs. what the spec declares
        detail: String,
    },

    /// A value's structural type does not match the channel's tag
    #[error("type mismatch for channel '{channel}': expected {expected}, got {actual}")]
    ChannelTypeMismatch {
        /// Channel id
        channel: String,
        /// Declared type tag
        expected: String,
        /// Observed structural tag
        actual: String,
    },

    /// Graph compilation failed
    #[error("graph validation failed: {0}")]
    GraphValidation(String),

    // --- commit ----------------------------------------------------------
    /// A `single`-policy channel received more than one write
    #[error("update policy violation on channel '{channel}': {detail}")]
    UpdatePolicyViolation {
        /// Channel id
        channel: String,
        /// Which writes collided
        detail: String,
    },

    /// A task-local channel was written outside the spawn mechanism
    #[error("task-local channel '{0}' cannot be written in this context")]
    TaskLocalWriteNotAllowed(String),

    /// A task-local channel value was unavailable where one must exist
    #[error("missing task-local value for channel '{0}'")]
    MissingTaskLocalValue(String),

    /// A node task failed after exhausting its retry policy
    #[error("task for node '{node}' failed: {detail}")]
    TaskFailed {
        /// Node whose task failed
        node: String,
        /// Failure detail from the final attempt
        detail: String,
    },

    /// A node body reported an error (pre-retry form)
    #[error("node '{node}' execution failed: {detail}")]
    NodeExecution {
        /// Node that failed
        node: String,
        /// Error detail
        detail: String,
    },

    /// A router failed while routing a committed task
    #[error("router for node '{node}' failed: {detail}")]
    RouterFailed {
        /// Router source node
        node: String,
        /// Error detail
        detail: String,
    },

    /// A reducer rejected a fold during commit
    #[error("reducer failed for channel '{channel}': {detail}")]
    ReducerFailed {
        /// Channel whose reducer rejected the fold
        channel: String,
        /// Reducer error detail
        detail: String,
    },

    /// A messages-channel update was malformed
    #[error("invalid messages update on channel '{channel}': {detail}")]
    InvalidMessagesUpdate {
        /// Channel id
        channel: String,
        /// What was malformed
        detail: String,
    },

    // --- checkpoint ------------------------------------------------------
    /// Checkpoint/store-level failure
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    // --- interrupt / resume ----------------------------------------------
    /// An operation requires no pending interruption, but one exists
    #[error("thread has a pending interruption")]
    InterruptPending,

    /// Resume was requested but no checkpoint exists for the thread
    #[error("no checkpoint to resume for thread '{0}'")]
    NoCheckpointToResume(String),

    /// Resume was requested but the thread has no pending interruption
    #[error("no interrupt to resume for thread '{0}'")]
    NoInterruptToResume(String),

    /// The supplied interrupt id does not match the pending interruption
    #[error("resume interrupt mismatch: expected {expected}, got {provided}")]
    ResumeInterruptMismatch {
        /// Pending interrupt id
        expected: String,
        /// Caller-supplied interrupt id
        provided: String,
    },

    // --- inference -------------------------------------------------------
    /// A node requested the model client but none is configured
    #[error("no model client is configured")]
    ModelClientMissing,

    /// A model stream violated the chunk protocol
    #[error("model stream invalid: {0}")]
    ModelStreamInvalid(String),

    /// A node requested the tool registry but none is configured
    #[error("no tool registry is configured")]
    ToolRegistryMissing,

    /// The model/tool loop exceeded its invocation bound
    #[error("model-tool loop exceeded {0} invocations")]
    ModelToolLoopMaxInvocationsExceeded(u32),

    // --- terminal control flow -------------------------------------------
    /// The run was cancelled (never surfaced as an error outcome; used
    /// internally to thread cancellation through fallible paths)
    #[error("cancelled")]
    Cancelled,

    // --- internal --------------------------------------------------------
    /// A programmer-bug invariant was violated
    #[error("internal invariant violation: {0}")]
    InternalInvariantViolation(String),
}

impl RuntimeError {
    /// Stable kind name, safe to emit when debug payloads are disabled
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::InvalidRunOptions(_) => "invalidRunOptions",
            Self::StepIndexOutOfRange(_) => "stepIndexOutOfRange",
            Self::TaskOrdinalOutOfRange(_) => "taskOrdinalOutOfRange",
            Self::InvalidTaskLocalFingerprintLength(_) => "invalidTaskLocalFingerprintLength",
            Self::UnknownNodeId(_) => "unknownNodeID",
            Self::UnknownChannelId(_) => "unknownChannelID",
            Self::ScopeMismatch { .. } => "scopeMismatch",
            Self::ChannelTypeMismatch { .. } => "channelTypeMismatch",
            Self::GraphValidation(_) => "graphValidation",
            Self::UpdatePolicyViolation { .. } => "updatePolicyViolation",
            Self::TaskLocalWriteNotAllowed(_) => "taskLocalWriteNotAllowed",
            Self::MissingTaskLocalValue(_) => "missingTaskLocalValue",
            Self::TaskFailed { .. } => "taskFailed",
            Self::NodeExecution { .. } => "nodeExecution",
            Self::RouterFailed { .. } => "routerFailed",
            Self::ReducerFailed { .. } => "reducerFailed",
            Self::InvalidMessagesUpdate { .. } => "invalidMessagesUpdate",
            Self::Checkpoint(inner) => match inner {
                CheckpointError::StoreMissing => "checkpointStoreMissing",
                CheckpointError::VersionMismatch { .. } => "checkpointVersionMismatch",
                CheckpointError::DecodeFailed { .. } => "checkpointDecodeFailed",
                CheckpointError::EncodeFailed { .. } => "checkpointEncodeFailed",
                CheckpointError::Corrupt(_) => "checkpointCorrupt",
                CheckpointError::NotFound(_) => "checkpointNotFound",
                CheckpointError::MissingCodec(_) => "missingCodec",
                CheckpointError::UnknownChannelId(_) => "unknownChannelID",
                CheckpointError::DuplicateChannelId(_) => "duplicateChannelID",
                CheckpointError::Unsupported(_) => "checkpointUnsupported",
                _ => "checkpointError",
            },
            Self::InterruptPending => "interruptPending",
            Self::NoCheckpointToResume(_) => "noCheckpointToResume",
            Self::NoInterruptToResume(_) => "noInterruptToResume",
            Self::ResumeInterruptMismatch { .. } => "resumeInterruptMismatch",
            Self::ModelClientMissing => "modelClientMissing",
            Self::ModelStreamInvalid(_) => "modelStreamInvalid",
            Self::ToolRegistryMissing => "toolRegistryMissing",
            Self::ModelToolLoopMaxInvocationsExceeded(_) => "modelToolLoopMaxInvocationsExceeded",
            Self::Cancelled => "cancelled",
            Self::InternalInvariantViolation(_) => "internalInvariantViolation",
        }
    }

    /// Whether this error is the internal cancellation marker
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Create a node execution error
    pub fn node_execution(node: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            detail: detail.into(),
        }
    }

    /// Snapshot for event payloads, honoring the debug-payload setting
    pub fn to_info(&self, debug_payloads: bool) -> ErrorInfo {
        ErrorInfo {
            kind: self.kind_name().to_string(),
            detail: debug_payloads.then(|| self.to_string()),
        }
    }
}

/// Error snapshot carried in events
///
/// `detail` is elided when `debug_payloads` is off, leaving only the stable
/// kind name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error kind name
    pub kind: String,
    /// Free-form description (debug payloads only)
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_stable() {
        assert_eq!(
            RuntimeError::UnknownChannelId("c".into()).kind_name(),
            "unknownChannelID"
        );
        assert_eq!(
            RuntimeError::Checkpoint(CheckpointError::StoreMissing).kind_name(),
            "checkpointStoreMissing"
        );
        assert_eq!(
            RuntimeError::Checkpoint(CheckpointError::EncodeFailed {
                channel: "a".into(),
                detail: "boom".into()
            })
            .kind_name(),
            "checkpointEncodeFailed"
        );
    }

    #[test]
    fn test_error_info_elides_detail() {
        let err = RuntimeError::InvalidRunOptions("max_steps must be >= 1".into());
        let redacted = err.to_info(false);
        assert_eq!(redacted.kind, "invalidRunOptions");
        assert!(redacted.detail.is_none());

        let full = err.to_info(true);
        assert!(full.detail.unwrap().contains("max_steps"));
    }

    #[test]
    fn test_cancellation_marker() {
        assert!(RuntimeError::Cancelled.is_cancellation());
        assert!(!RuntimeError::InterruptPending.is_cancellation());
    }
}
