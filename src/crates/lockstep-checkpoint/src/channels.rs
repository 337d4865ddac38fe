//! Channel specifications and the schema registry
//!
//! A *channel* is a typed, reducer-backed state slot addressed by a stable
//! string id. A *schema* is the validated, ordered table of channel
//! specifications the runtime executes against.
//!
//! # Channel anatomy
//!
//! Each [`ChannelSpec`] declares:
//!
//! - a **value type tag** (see [`crate::value`]) checked on every read/write;
//! - a **scope**: [`ChannelScope::Global`] (one value per thread) or
//!   [`ChannelScope::TaskLocal`] (per-task overlay, seeded at spawn);
//! - an **update policy**: [`UpdatePolicy::Single`] (at most one write per
//!   superstep) or [`UpdatePolicy::Multi`];
//! - a **persistence** mode: [`Persistence::Checkpointed`] values survive in
//!   checkpoints, [`Persistence::Untracked`] values reset to their initial on
//!   resume;
//! - an `initial()` thunk, evaluated exactly once per run;
//! - a [`ReducerFn`] folding the writes of one superstep;
//! - an optional [`Codec`](crate::codec::Codec).
//!
//! # Invariants (enforced by [`SchemaRegistry::build`])
//!
//! - channel ids are unique;
//! - task-local channels are checkpointed and carry a codec;
//! - every checkpointed channel carries a codec.
//!
//! # Example
//!
//! ```rust
//! use lockstep_checkpoint::channels::{ChannelSpec, SchemaRegistry};
//! use lockstep_checkpoint::codec::JsonCodec;
//! use lockstep_checkpoint::reducer;
//! use serde_json::json;
//!
//! let registry = SchemaRegistry::build(vec![
//!     ChannelSpec::global("counter", "int", || json!(0), reducer::sum())
//!         .with_codec(JsonCodec::shared()),
//!     ChannelSpec::global("log", "array", || json!([]), reducer::append())
//!         .with_codec(JsonCodec::shared()),
//! ])
//! .unwrap();
//!
//! assert_eq!(registry.sorted_specs()[0].id, "counter");
//! ```

use crate::codec::CodecRef;
use crate::error::{CheckpointError, Result};
use crate::reducer::ReducerFn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Where a channel's value lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelScope {
    /// One value per thread, shared by every task
    Global,
    /// Per-task overlay value, seeded through the spawn mechanism
    TaskLocal,
}

/// How many writes a channel accepts per superstep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdatePolicy {
    /// At most one write (per step for global channels, per task for
    /// task-local channels)
    Single,
    /// Any number of writes, folded through the reducer
    Multi,
}

/// Whether a channel's value is persisted in checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Persistence {
    /// Encoded into every checkpoint; restored on resume
    Checkpointed,
    /// Never persisted; reset to the initial value on resume
    Untracked,
}

/// Thunk producing a channel's initial value, evaluated once per run
pub type InitialFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Specification of a single channel
#[derive(Clone)]
pub struct ChannelSpec {
    /// Unique channel id; ordered by raw UTF-8 bytes wherever determinism
    /// requires an order
    pub id: String,
    /// Structural type tag validated on reads and writes
    pub value_type: String,
    /// Global or task-local
    pub scope: ChannelScope,
    /// Single- or multi-write per superstep
    pub update_policy: UpdatePolicy,
    /// Checkpointed or untracked
    pub persistence: Persistence,
    /// Initial-value thunk
    pub initial: InitialFn,
    /// Reducer folding one superstep's writes
    pub reducer: ReducerFn,
    /// Optional codec; required when checkpointed
    pub codec: Option<CodecRef>,
}

impl fmt::Debug for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSpec")
            .field("id", &self.id)
            .field("value_type", &self.value_type)
            .field("scope", &self.scope)
            .field("update_policy", &self.update_policy)
            .field("persistence", &self.persistence)
            .field("codec", &self.codec.as_ref().map(|c| c.id().to_string()))
            .finish()
    }
}

impl ChannelSpec {
    /// Create a global, multi-write, checkpointed channel
    pub fn global<F>(id: impl Into<String>, value_type: impl Into<String>, initial: F, reducer: ReducerFn) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            value_type: value_type.into(),
            scope: ChannelScope::Global,
            update_policy: UpdatePolicy::Multi,
            persistence: Persistence::Checkpointed,
            initial: Arc::new(initial),
            reducer,
            codec: None,
        }
    }

    /// Create a task-local, checkpointed channel
    pub fn task_local<F>(id: impl Into<String>, value_type: impl Into<String>, initial: F, reducer: ReducerFn) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            value_type: value_type.into(),
            scope: ChannelScope::TaskLocal,
            update_policy: UpdatePolicy::Multi,
            persistence: Persistence::Checkpointed,
            initial: Arc::new(initial),
            reducer,
            codec: None,
        }
    }

    /// Set the update policy
    pub fn with_update_policy(mut self, policy: UpdatePolicy) -> Self {
        self.update_policy = policy;
        self
    }

    /// Set the persistence mode
    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }

    /// Attach a codec
    pub fn with_codec(mut self, codec: CodecRef) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Codec id as encoded into the schema version digest (empty when absent)
    pub fn codec_id(&self) -> &str {
        self.codec.as_ref().map(|c| c.id()).unwrap_or("")
    }
}

/// Validated, ordered table of channel specifications
///
/// Built once per schema; iteration through [`sorted_specs`](Self::sorted_specs)
/// is in ascending channel-id order, the order used everywhere determinism is
/// required (initial-cache construction, commit folds, digests, fingerprints).
pub struct SchemaRegistry {
    specs: Vec<ChannelSpec>,
    index_by_id: HashMap<String, usize>,
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("channels", &self.specs.iter().map(|s| s.id.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

impl SchemaRegistry {
    /// Validate specifications and build a registry
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::DuplicateChannelId`] — two specs share an id; the
    ///   smallest duplicated id (ascending order) is reported.
    /// - [`CheckpointError::InvalidChannelSpec`] — a task-local channel is not
    ///   checkpointed.
    /// - [`CheckpointError::MissingCodec`] — a checkpointed channel has no
    ///   codec; the smallest offending id is reported.
    pub fn build(mut specs: Vec<ChannelSpec>) -> Result<Self> {
        specs.sort_by(|a, b| a.id.as_bytes().cmp(b.id.as_bytes()));

        for pair in specs.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(CheckpointError::DuplicateChannelId(pair[0].id.clone()));
            }
        }
        for spec in &specs {
            if spec.scope == ChannelScope::TaskLocal && spec.persistence != Persistence::Checkpointed {
                return Err(CheckpointError::InvalidChannelSpec {
                    channel: spec.id.clone(),
                    reason: "task-local channels must be checkpointed".to_string(),
                });
            }
            if spec.persistence == Persistence::Checkpointed && spec.codec.is_none() {
                return Err(CheckpointError::MissingCodec(spec.id.clone()));
            }
        }

        let index_by_id = specs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        Ok(Self { specs, index_by_id })
    }

    /// Look up a channel specification by id
    pub fn spec(&self, id: &str) -> Result<&ChannelSpec> {
        self.index_by_id
            .get(id)
            .map(|&i| &self.specs[i])
            .ok_or_else(|| CheckpointError::UnknownChannelId(id.to_string()))
    }

    /// Whether a channel id is declared
    pub fn contains(&self, id: &str) -> bool {
        self.index_by_id.contains_key(id)
    }

    /// All specifications in ascending channel-id order
    pub fn sorted_specs(&self) -> &[ChannelSpec] {
        &self.specs
    }

    /// Number of channels
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Whether any channel is task-local
    pub fn has_task_local(&self) -> bool {
        self.specs.iter().any(|s| s.scope == ChannelScope::TaskLocal)
    }
}

/// Mapper turning a run input (plus the caller context) into the initial
/// global writes of a fresh run
pub type InputMapper = Arc<dyn Fn(&Value, &Value) -> Result<Vec<(String, Value)>> + Send + Sync>;

/// A registry plus the optional input-writes mapper
///
/// The mapper runs once, before step 0 of a fresh run, as a synthetic commit
/// that may only touch global channels.
#[derive(Clone)]
pub struct Schema {
    /// The validated channel table
    pub registry: Arc<SchemaRegistry>,
    input_mapper: Option<InputMapper>,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("registry", &self.registry)
            .field("has_input_mapper", &self.input_mapper.is_some())
            .finish()
    }
}

impl Schema {
    /// Wrap a registry with no input mapping (fresh runs start from initials)
    pub fn new(registry: SchemaRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            input_mapper: None,
        }
    }

    /// Attach the input-writes mapper
    pub fn with_input_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&Value, &Value) -> Result<Vec<(String, Value)>> + Send + Sync + 'static,
    {
        self.input_mapper = Some(Arc::new(mapper));
        self
    }

    /// Map a run input into initial writes (empty when no mapper is set)
    pub fn input_writes(&self, input: &Value, context: &Value) -> Result<Vec<(String, Value)>> {
        match &self.input_mapper {
            Some(mapper) => mapper(input, context),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::reducer;
    use serde_json::json;

    fn counter() -> ChannelSpec {
        ChannelSpec::global("counter", "int", || json!(0), reducer::sum())
            .with_codec(JsonCodec::shared())
    }

    #[test]
    fn test_build_sorts_by_id_bytes() {
        let registry = SchemaRegistry::build(vec![
            ChannelSpec::global("zeta", "int", || json!(0), reducer::sum())
                .with_codec(JsonCodec::shared()),
            counter(),
            ChannelSpec::global("alpha", "string", || json!(""), reducer::last_write_wins())
                .with_codec(JsonCodec::shared()),
        ])
        .unwrap();

        let ids: Vec<&str> = registry.sorted_specs().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "counter", "zeta"]);
    }

    #[test]
    fn test_duplicate_reports_smallest_id() {
        let err = SchemaRegistry::build(vec![
            counter(),
            ChannelSpec::global("zeta", "int", || json!(0), reducer::sum())
                .with_codec(JsonCodec::shared()),
            ChannelSpec::global("zeta", "int", || json!(0), reducer::sum())
                .with_codec(JsonCodec::shared()),
            counter(),
        ])
        .unwrap_err();
        assert!(matches!(err, CheckpointError::DuplicateChannelId(id) if id == "counter"));
    }

    #[test]
    fn test_task_local_requires_checkpointed() {
        let spec = ChannelSpec::task_local("item", "string", || json!(""), reducer::last_write_wins())
            .with_persistence(Persistence::Untracked)
            .with_codec(JsonCodec::shared());
        let err = SchemaRegistry::build(vec![spec]).unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidChannelSpec { .. }));
    }

    #[test]
    fn test_checkpointed_requires_codec() {
        let spec = ChannelSpec::global("bare", "int", || json!(0), reducer::sum());
        let err = SchemaRegistry::build(vec![spec]).unwrap_err();
        assert!(matches!(err, CheckpointError::MissingCodec(id) if id == "bare"));
    }

    #[test]
    fn test_untracked_channel_needs_no_codec() {
        let spec = ChannelSpec::global("scratch", "any", || json!(null), reducer::last_write_wins())
            .with_persistence(Persistence::Untracked);
        assert!(SchemaRegistry::build(vec![spec]).is_ok());
    }

    #[test]
    fn test_unknown_lookup() {
        let registry = SchemaRegistry::build(vec![counter()]).unwrap();
        assert!(registry.spec("counter").is_ok());
        let err = registry.spec("missing").unwrap_err();
        assert!(matches!(err, CheckpointError::UnknownChannelId(id) if id == "missing"));
    }

    #[test]
    fn test_schema_input_writes_default_empty() {
        let schema = Schema::new(SchemaRegistry::build(vec![counter()]).unwrap());
        assert!(schema
            .input_writes(&json!({"x": 1}), &json!(null))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_schema_input_mapper() {
        let schema = Schema::new(SchemaRegistry::build(vec![counter()]).unwrap())
            .with_input_mapper(|input, _context| {
                Ok(vec![("counter".to_string(), input["n"].clone())])
            });
        let writes = schema.input_writes(&json!({"n": 5}), &json!(null)).unwrap();
        assert_eq!(writes, vec![("counter".to_string(), json!(5))]);
    }
}
