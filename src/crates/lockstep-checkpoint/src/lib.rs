//! # lockstep-checkpoint
//!
//! Channel/state model and checkpoint persistence for the lockstep runtime.
//!
//! This crate defines everything the step engine in `lockstep-core` commits
//! and persists:
//!
//! - **Value type tags** ([`value`]) — stable structural tags validated on
//!   every channel read and write.
//! - **Reducers** ([`reducer`]) — deterministic merge functions folding one
//!   superstep's writes per channel.
//! - **Codecs** ([`codec`]) — encode/decode hooks whose stable ids
//!   participate in the schema version digest.
//! - **Channel specifications and the schema registry** ([`channels`]) —
//!   the validated, ordered table of state slots.
//! - **The checkpoint data model** ([`checkpoint`]) — canonical ids and the
//!   serialized snapshot of a thread at a commit boundary.
//! - **The store contract** ([`traits`]) and an in-memory reference
//!   implementation ([`memory`]).
//!
//! Durable backends (databases, object stores) live downstream; they only
//! implement [`CheckpointStore`].

pub mod channels;
pub mod checkpoint;
pub mod codec;
pub mod error;
pub mod memory;
pub mod reducer;
pub mod traits;
pub mod value;

pub use channels::{
    ChannelScope, ChannelSpec, InputMapper, Persistence, Schema, SchemaRegistry, UpdatePolicy,
};
pub use checkpoint::{
    checkpoint_id, sha256_digest, sha256_hex, Checkpoint, CheckpointSummary, FrontierTask,
    PendingInterruption, TaskProvenance, FINGERPRINT_LEN,
};
pub use codec::{Codec, CodecRef, JsonCodec};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointStore;
pub use reducer::ReducerFn;
pub use traits::CheckpointStore;
