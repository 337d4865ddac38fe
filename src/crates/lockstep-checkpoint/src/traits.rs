//! Checkpoint store contract
//!
//! [`CheckpointStore`] is the abstraction durable backends implement. The
//! runtime only requires two operations — `save` and `load_latest` — with an
//! atomicity contract between them; history queries are optional and default
//! to [`CheckpointError::Unsupported`].
//!
//! # Save contract
//!
//! - `save` is single-writer per thread (the engine serializes all operations
//!   on a thread through its lane) and atomic with respect to `load_latest`:
//!   a reader observes either the previous latest checkpoint or the fully
//!   written new one, never a partial write.
//! - After a successful `save(cp)`, `load_latest` returns `cp` or a
//!   checkpoint with a strictly greater `(step_index, id)` pair. "Latest" is
//!   the maximum `step_index`, ties broken by the maximum id in ascending
//!   UTF-8 byte order; a backend may substitute an equivalent monotone frame
//!   id provided the ordering is preserved.
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! use lockstep_checkpoint::{Checkpoint, CheckpointStore, CheckpointError};
//! use async_trait::async_trait;
//!
//! struct SqliteStore { /* pool */ }
//!
//! #[async_trait]
//! impl CheckpointStore for SqliteStore {
//!     async fn save(&self, cp: Checkpoint) -> lockstep_checkpoint::Result<()> {
//!         let bytes = cp.to_bytes()?;
//!         // INSERT in one transaction keyed by (thread_id, step_index, id)
//!         # let _ = bytes; Ok(())
//!     }
//!
//!     async fn load_latest(&self, thread_id: &str)
//!         -> lockstep_checkpoint::Result<Option<Checkpoint>>
//!     {
//!         // SELECT ... ORDER BY step_index DESC, id DESC LIMIT 1
//!         # let _ = thread_id; Ok(None)
//!     }
//! }
//! ```

use crate::checkpoint::{Checkpoint, CheckpointSummary};
use crate::error::{CheckpointError, Result};
use async_trait::async_trait;

/// Persistence backend for checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint atomically
    async fn save(&self, checkpoint: Checkpoint) -> Result<()>;

    /// Load the latest checkpoint for a thread, if any
    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// List checkpoint summaries for a thread, newest first
    ///
    /// Optional; the default surfaces [`CheckpointError::Unsupported`].
    async fn list_checkpoints(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointSummary>> {
        let _ = (thread_id, limit);
        Err(CheckpointError::Unsupported("list_checkpoints"))
    }

    /// Load a specific checkpoint by id
    ///
    /// Optional; the default surfaces [`CheckpointError::Unsupported`].
    async fn load_checkpoint(&self, thread_id: &str, id: &str) -> Result<Option<Checkpoint>> {
        let _ = (thread_id, id);
        Err(CheckpointError::Unsupported("load_checkpoint"))
    }
}
