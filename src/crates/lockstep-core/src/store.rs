//! Stores and read views
//!
//! Four storage layers cooperate inside a thread:
//!
//! - [`InitialCache`] — one value per channel, built once per run by calling
//!   each spec's `initial()` exactly once, in ascending channel-id order.
//! - [`GlobalStore`] — exactly one value for every global channel; replaced
//!   wholesale at each commit, never mutated in place.
//! - task-local **overlays** — sparse per-task maps for task-local channels;
//!   a missing entry falls back to the initial cache.
//! - [`ReadView`] — the composed, immutable view nodes and routers read
//!   through. It materializes nothing: every `get` resolves scope, fetches
//!   from the right layer, and validates the value's type tag.
//!
//! Routers additionally get a *fresh-read view*: the pre-step global snapshot
//! with only the emitting task's own writes folded in, so a router observes
//! its task's effects but no sibling's.

use crate::error::{Result, RuntimeError};
use lockstep_checkpoint::channels::{ChannelScope, SchemaRegistry};
use lockstep_checkpoint::value;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One value per channel, computed once per run
#[derive(Debug, Clone)]
pub struct InitialCache {
    values: Arc<BTreeMap<String, Value>>,
}

impl InitialCache {
    /// Evaluate every spec's `initial()` exactly once, ascending id order
    pub fn build(registry: &SchemaRegistry) -> Self {
        let mut values = BTreeMap::new();
        for spec in registry.sorted_specs() {
            values.insert(spec.id.clone(), (spec.initial)());
        }
        Self {
            values: Arc::new(values),
        }
    }

    /// Cached initial value for a channel
    pub fn get(&self, id: &str) -> Option<&Value> {
        self.values.get(id)
    }
}

/// Committed global state: one value for every global channel
#[derive(Debug, Clone)]
pub struct GlobalStore {
    values: Arc<BTreeMap<String, Value>>,
}

impl GlobalStore {
    /// Seed every global channel from the initial cache
    pub fn seed(registry: &SchemaRegistry, initial: &InitialCache) -> Self {
        let mut values = BTreeMap::new();
        for spec in registry.sorted_specs() {
            if spec.scope == ChannelScope::Global {
                let v = initial
                    .get(&spec.id)
                    .cloned()
                    .unwrap_or(Value::Null);
                values.insert(spec.id.clone(), v);
            }
        }
        Self {
            values: Arc::new(values),
        }
    }

    /// Build from an already-assembled map (commit replacement, resume)
    pub fn from_map(values: BTreeMap<String, Value>) -> Self {
        Self {
            values: Arc::new(values),
        }
    }

    /// Current value of a global channel
    pub fn get(&self, id: &str) -> Option<&Value> {
        self.values.get(id)
    }

    /// Snapshot handle of the underlying map
    pub fn snapshot(&self) -> Arc<BTreeMap<String, Value>> {
        self.values.clone()
    }

    /// Iterate `(channel id, value)` in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

/// Composed, immutable read view over global + overlay + initial layers
#[derive(Clone)]
pub struct ReadView {
    registry: Arc<SchemaRegistry>,
    global: Arc<BTreeMap<String, Value>>,
    overlay: Arc<BTreeMap<String, Value>>,
    initial: InitialCache,
}

impl ReadView {
    /// Assemble a view for one task
    pub fn new(
        registry: Arc<SchemaRegistry>,
        global: Arc<BTreeMap<String, Value>>,
        overlay: Arc<BTreeMap<String, Value>>,
        initial: InitialCache,
    ) -> Self {
        Self {
            registry,
            global,
            overlay,
            initial,
        }
    }

    /// Read a channel, dispatching on its declared scope
    ///
    /// # Errors
    ///
    /// - `unknownChannelID` — the id is not in the schema
    /// - `channelTypeMismatch` — the stored value violates the declared tag
    /// - `missingTaskLocalValue` — a task-local channel has neither an
    ///   overlay entry nor an initial (internal invariant breach)
    pub fn get(&self, id: &str) -> Result<Value> {
        let spec = self
            .registry
            .spec(id)
            .map_err(|_| RuntimeError::UnknownChannelId(id.to_string()))?;
        let found = match spec.scope {
            ChannelScope::Global => self.global.get(id).ok_or_else(|| {
                RuntimeError::InternalInvariantViolation(format!(
                    "global store has no entry for channel '{id}'"
                ))
            })?,
            ChannelScope::TaskLocal => match self.overlay.get(id) {
                Some(v) => v,
                None => self
                    .initial
                    .get(id)
                    .ok_or_else(|| RuntimeError::MissingTaskLocalValue(id.to_string()))?,
            },
        };
        if !value::tag_matches(&spec.value_type, found) {
            return Err(RuntimeError::ChannelTypeMismatch {
                channel: id.to_string(),
                expected: spec.value_type.clone(),
                actual: value::type_tag(found).to_string(),
            });
        }
        Ok(found.clone())
    }

    /// Read a channel that must be global (`scopeMismatch` otherwise)
    pub fn get_global(&self, id: &str) -> Result<Value> {
        let spec = self
            .registry
            .spec(id)
            .map_err(|_| RuntimeError::UnknownChannelId(id.to_string()))?;
        if spec.scope != ChannelScope::Global {
            return Err(RuntimeError::ScopeMismatch {
                channel: id.to_string(),
                detail: "expected global, channel is task-local".to_string(),
            });
        }
        self.get(id)
    }

    /// Read a channel that must be task-local (`scopeMismatch` otherwise)
    pub fn get_task_local(&self, id: &str) -> Result<Value> {
        let spec = self
            .registry
            .spec(id)
            .map_err(|_| RuntimeError::UnknownChannelId(id.to_string()))?;
        if spec.scope != ChannelScope::TaskLocal {
            return Err(RuntimeError::ScopeMismatch {
                channel: id.to_string(),
                detail: "expected task-local, channel is global".to_string(),
            });
        }
        self.get(id)
    }

    /// The schema registry backing this view
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }
}

impl std::fmt::Debug for ReadView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadView")
            .field("global_channels", &self.global.len())
            .field("overlay_entries", &self.overlay.len())
            .finish()
    }
}

/// Build a router's fresh-read view: pre-step snapshot plus one task's writes
///
/// The task's writes are folded through the channels' reducers in emission
/// order against the pre-step values, so the router observes exactly the
/// state its own task produced and nothing from sibling tasks. Construction
/// validates each write (unknown channel, task-local target, type tag) and
/// can fail; such failures abort the step at commit time.
pub fn fresh_view_for_task(
    registry: Arc<SchemaRegistry>,
    pre_step_global: Arc<BTreeMap<String, Value>>,
    overlay: Arc<BTreeMap<String, Value>>,
    initial: InitialCache,
    writes: &[(String, Value)],
) -> Result<ReadView> {
    let mut merged: BTreeMap<String, Value> = (*pre_step_global).clone();
    for (channel, update) in writes {
        let spec = registry
            .spec(channel)
            .map_err(|_| RuntimeError::UnknownChannelId(channel.clone()))?;
        if spec.scope != ChannelScope::Global {
            return Err(RuntimeError::TaskLocalWriteNotAllowed(channel.clone()));
        }
        if !value::tag_matches(&spec.value_type, update) {
            return Err(RuntimeError::ChannelTypeMismatch {
                channel: channel.clone(),
                expected: spec.value_type.clone(),
                actual: value::type_tag(update).to_string(),
            });
        }
        let current = merged.get(channel).cloned().unwrap_or(Value::Null);
        let folded = (spec.reducer)(&current, update).map_err(|e| RuntimeError::ReducerFailed {
            channel: channel.clone(),
            detail: e.to_string(),
        })?;
        merged.insert(channel.clone(), folded);
    }
    Ok(ReadView::new(registry, Arc::new(merged), overlay, initial))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_checkpoint::channels::ChannelSpec;
    use lockstep_checkpoint::codec::JsonCodec;
    use lockstep_checkpoint::reducer;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> Arc<SchemaRegistry> {
        Arc::new(
            SchemaRegistry::build(vec![
                ChannelSpec::global("counter", "int", || json!(0), reducer::sum())
                    .with_codec(JsonCodec::shared()),
                ChannelSpec::global("log", "array", || json!([]), reducer::append())
                    .with_codec(JsonCodec::shared()),
                ChannelSpec::task_local("item", "string", || json!(""), reducer::last_write_wins())
                    .with_codec(JsonCodec::shared()),
            ])
            .unwrap(),
        )
    }

    fn view_with(overlay: BTreeMap<String, Value>) -> ReadView {
        let registry = registry();
        let initial = InitialCache::build(&registry);
        let global = GlobalStore::seed(&registry, &initial);
        ReadView::new(registry, global.snapshot(), Arc::new(overlay), initial)
    }

    #[test]
    fn test_initial_cache_called_once_per_channel() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let registry = SchemaRegistry::build(vec![ChannelSpec::global(
            "counted",
            "int",
            || {
                CALLS.fetch_add(1, Ordering::SeqCst);
                json!(0)
            },
            reducer::sum(),
        )
        .with_codec(JsonCodec::shared())])
        .unwrap();

        let cache = InitialCache::build(&registry);
        let _ = cache.get("counted");
        let _ = cache.get("counted");
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_global_read() {
        let view = view_with(BTreeMap::new());
        assert_eq!(view.get("counter").unwrap(), json!(0));
    }

    #[test]
    fn test_task_local_falls_back_to_initial() {
        let view = view_with(BTreeMap::new());
        assert_eq!(view.get("item").unwrap(), json!(""));

        let view = view_with(BTreeMap::from([("item".to_string(), json!("apple"))]));
        assert_eq!(view.get("item").unwrap(), json!("apple"));
    }

    #[test]
    fn test_unknown_channel() {
        let view = view_with(BTreeMap::new());
        assert!(matches!(
            view.get("nope").unwrap_err(),
            RuntimeError::UnknownChannelId(_)
        ));
    }

    #[test]
    fn test_scope_mismatch_accessors() {
        let view = view_with(BTreeMap::new());
        assert!(matches!(
            view.get_global("item").unwrap_err(),
            RuntimeError::ScopeMismatch { .. }
        ));
        assert!(matches!(
            view.get_task_local("counter").unwrap_err(),
            RuntimeError::ScopeMismatch { .. }
        ));
    }

    #[test]
    fn test_type_mismatch_on_read() {
        let view = view_with(BTreeMap::from([("item".to_string(), json!(42))]));
        assert!(matches!(
            view.get("item").unwrap_err(),
            RuntimeError::ChannelTypeMismatch { .. }
        ));
    }

    #[test]
    fn test_fresh_view_sees_own_writes_only() {
        let registry = registry();
        let initial = InitialCache::build(&registry);
        let global = GlobalStore::seed(&registry, &initial);

        let view = fresh_view_for_task(
            registry,
            global.snapshot(),
            Arc::new(BTreeMap::new()),
            initial,
            &[("counter".to_string(), json!(1))],
        )
        .unwrap();
        // own write folded (0 + 1), sibling writes absent
        assert_eq!(view.get("counter").unwrap(), json!(1));
    }

    #[test]
    fn test_fresh_view_rejects_task_local_write() {
        let registry = registry();
        let initial = InitialCache::build(&registry);
        let global = GlobalStore::seed(&registry, &initial);

        let err = fresh_view_for_task(
            registry,
            global.snapshot(),
            Arc::new(BTreeMap::new()),
            initial,
            &[("item".to_string(), json!("x"))],
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::TaskLocalWriteNotAllowed(_)));
    }
}
