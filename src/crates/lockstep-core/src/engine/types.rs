//! Engine data types: tasks, run options, outcomes, thread state

use crate::builder::CompiledGraph;
use crate::error::{Result, RuntimeError};
use crate::fingerprint;
use crate::graph::{NodeId, OutputProjection};
use crate::store::{GlobalStore, InitialCache};
use lockstep_checkpoint::{PendingInterruption, TaskProvenance};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// One frontier task, live form
///
/// `ordinal` is the task's deterministic position in the frontier; `id` is
/// the canonical digest over `(run, step, ordinal, node, overlay)`.
#[derive(Debug, Clone)]
pub struct Task {
    /// Canonical task id (lowercase SHA-256 hex)
    pub id: String,
    /// Position in the frontier
    pub ordinal: u32,
    /// Node this task executes
    pub node_id: NodeId,
    /// Task-local overlay values
    pub task_local: BTreeMap<String, Value>,
    /// Fingerprint of the overlay (feeds the task id)
    pub local_fingerprint: [u8; 32],
    /// Scheduling provenance
    pub provenance: TaskProvenance,
}

impl Task {
    /// Build a task, computing its fingerprint and canonical id
    pub fn new(
        graph: &CompiledGraph,
        run_id: &Uuid,
        step_index: u32,
        ordinal: u32,
        node_id: NodeId,
        task_local: BTreeMap<String, Value>,
        provenance: TaskProvenance,
    ) -> Result<Self> {
        let local_fingerprint = fingerprint::local_fingerprint(&graph.schema.registry, &task_local)?;
        let id = fingerprint::task_id(run_id, step_index, ordinal, &node_id, &local_fingerprint);
        Ok(Self {
            id,
            ordinal,
            node_id,
            task_local,
            local_fingerprint,
            provenance,
        })
    }
}

/// When checkpoints are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPolicy {
    /// Never on ordinary commits (interrupts and external writes still
    /// checkpoint when a store is configured)
    Disabled,
    /// Only at commits that select a winning interrupt
    OnInterrupt,
    /// At every commit
    EveryStep,
    /// At every `n`-th step boundary (`n >= 1`; `Every(1)` == `EveryStep`)
    Every(u32),
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::Disabled
    }
}

/// Options accepted by `run` / `resume` / `apply_external_writes`
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum supersteps this invocation may execute (`>= 1`; 0 is
    /// rejected — unbounded runs must pass an explicit large bound)
    pub max_steps: u32,
    /// Maximum frontier tasks executing concurrently (`>= 1`)
    pub max_concurrent_tasks: usize,
    /// Requested event buffer capacity (`>= 1`; clamped up to the floor)
    pub event_buffer_capacity: usize,
    /// Checkpoint cadence
    pub checkpoint_policy: CheckpointPolicy,
    /// Override the compiled graph's output projection for this run
    pub output_projection_override: Option<OutputProjection>,
    /// Buffer per-task model tokens and flush in ordinal order
    pub deterministic_token_streaming: bool,
    /// Include free-form error details and write metadata in events
    pub debug_payloads: bool,
    /// Opaque caller context passed to every node task
    pub context: Value,
    /// Inject a fixed run id (reproducibility); fresh random otherwise
    pub run_id: Option<Uuid>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_steps: 256,
            max_concurrent_tasks: 16,
            event_buffer_capacity: 256,
            checkpoint_policy: CheckpointPolicy::Disabled,
            output_projection_override: None,
            deterministic_token_streaming: false,
            debug_payloads: false,
            context: Value::Null,
            run_id: None,
        }
    }
}

impl RunOptions {
    /// Validate option bounds
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(RuntimeError::InvalidRunOptions(
                "max_steps must be >= 1 (0 is not treated as unbounded)".to_string(),
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(RuntimeError::InvalidRunOptions(
                "max_concurrent_tasks must be >= 1".to_string(),
            ));
        }
        if self.event_buffer_capacity == 0 {
            return Err(RuntimeError::InvalidRunOptions(
                "event_buffer_capacity must be >= 1".to_string(),
            ));
        }
        if let CheckpointPolicy::Every(n) = self.checkpoint_policy {
            if n == 0 {
                return Err(RuntimeError::InvalidRunOptions(
                    "checkpoint_policy Every(n) requires n >= 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Terminal, non-error run outcomes
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Run completed; carries the projected output
    Finished(Value),
    /// Run paused at a commit with a winning interrupt
    Interrupted {
        /// Canonical interrupt id
        interrupt_id: String,
        /// Payload from the winning request
        payload: Value,
    },
    /// The step bound was reached before the next step could start
    OutOfSteps(u32),
    /// The run was cancelled
    Cancelled,
}

/// Per-thread mutable state, owned by the engine between commits
#[derive(Debug, Clone)]
pub struct ThreadState {
    /// Run that owns this state
    pub run_id: Uuid,
    /// Next step to execute
    pub step_index: u32,
    /// Committed global store
    pub global: GlobalStore,
    /// Current frontier, ordinal order
    pub frontier: Vec<Task>,
    /// Seen-parent sets per compiled join id
    pub join_seen: BTreeMap<String, BTreeSet<NodeId>>,
    /// Pending interruption, if any
    pub pending_interruption: Option<PendingInterruption>,
    /// Id of the most recent checkpoint written for this thread
    pub latest_checkpoint_id: Option<String>,
    /// Per-global-channel version counters (trigger support)
    pub channel_versions: BTreeMap<String, u64>,
    /// Per-node observed-version snapshots
    pub versions_seen: BTreeMap<NodeId, BTreeMap<String, u64>>,
    /// Initial-value cache, computed once per run
    pub initial: InitialCache,
}

impl ThreadState {
    /// Seed a fresh thread state for a new run
    pub fn fresh(graph: &CompiledGraph, run_id: Uuid) -> Self {
        let initial = InitialCache::build(&graph.schema.registry);
        let global = GlobalStore::seed(&graph.schema.registry, &initial);
        let join_seen = graph
            .join_edges()
            .iter()
            .map(|j| (j.id.clone(), BTreeSet::new()))
            .collect();
        Self {
            run_id,
            step_index: 0,
            global,
            frontier: Vec::new(),
            join_seen,
            pending_interruption: None,
            latest_checkpoint_id: None,
            channel_versions: BTreeMap::new(),
            versions_seen: BTreeMap::new(),
            initial,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_default_valid() {
        assert!(RunOptions::default().validate().is_ok());
    }

    #[test]
    fn test_zero_max_steps_rejected() {
        let options = RunOptions {
            max_steps: 0,
            ..RunOptions::default()
        };
        assert!(matches!(
            options.validate().unwrap_err(),
            RuntimeError::InvalidRunOptions(_)
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let options = RunOptions {
            max_concurrent_tasks: 0,
            ..RunOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_every_zero_rejected() {
        let options = RunOptions {
            checkpoint_policy: CheckpointPolicy::Every(0),
            ..RunOptions::default()
        };
        assert!(options.validate().is_err());
    }
}
