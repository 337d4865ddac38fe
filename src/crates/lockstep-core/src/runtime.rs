//! Runtime facade and per-thread lanes
//!
//! [`Runtime`] is the public surface of the engine. It owns the compiled
//! graph, the optional checkpoint store, and the optional model client and
//! tool registry, and it serializes every operation per thread: a lane
//! (async mutex keyed by thread id) guarantees at most one superstep or
//! synthetic step executes at a time for a thread, while different threads
//! run concurrently.
//!
//! `run` / `resume` / `apply_external_writes` return a [`RunHandle`]
//! immediately: the caller consumes the bounded event stream while the
//! spawned engine task drives the thread, and awaits the terminal outcome.
//!
//! # Example
//!
//! ```rust,ignore
//! use lockstep_core::{Runtime, RunOptions};
//! use serde_json::json;
//!
//! # async fn example(graph: std::sync::Arc<lockstep_core::CompiledGraph>) {
//! let runtime = Runtime::new(graph)
//!     .with_checkpoint_store(lockstep_checkpoint::InMemoryCheckpointStore::shared());
//!
//! let handle = runtime.run("thread-1", json!({"question": "?"}), RunOptions::default()).await;
//! let mut events = handle.events;
//! while let Some(event) = events.next().await {
//!     println!("{event:?}");
//! }
//! # }
//! ```

use crate::builder::CompiledGraph;
use crate::cancel::CancelToken;
use crate::clock::{Clock, TokioClock};
use crate::engine::step_loop::StepLoop;
use crate::engine::types::{RunOptions, RunOutcome, ThreadState};
use crate::error::{Result, RuntimeError};
use crate::events::{EventKind, EventQueue, EventScope, EventStream};
use crate::model::{ModelClientRef, ToolRegistryRef};
use crate::store::GlobalStore;
use lockstep_checkpoint::{Checkpoint, CheckpointError, CheckpointStore, CheckpointSummary};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct ThreadLane {
    state: Mutex<Option<ThreadState>>,
}

/// Handle to one engine invocation
pub struct RunHandle {
    /// Bounded event stream for this invocation
    pub events: EventStream,
    outcome: tokio::task::JoinHandle<Result<RunOutcome>>,
    cancel: CancelToken,
}

impl RunHandle {
    /// Await the terminal outcome
    pub async fn outcome(self) -> Result<RunOutcome> {
        match self.outcome.await {
            Ok(result) => result,
            Err(join_error) => Err(RuntimeError::InternalInvariantViolation(format!(
                "engine task join error: {join_error}"
            ))),
        }
    }

    /// Request cooperative cancellation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Clone the cancellation token
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Drain all events and await the outcome together
    ///
    /// Convenience for callers that want the full trace: spawns a collector
    /// for the event stream (so producers never block on a full buffer) and
    /// awaits the terminal outcome.
    pub async fn join(self) -> (Vec<crate::events::Event>, Result<RunOutcome>) {
        let RunHandle {
            events,
            outcome,
            cancel: _cancel,
        } = self;
        let collector = tokio::spawn(events.collect());
        let result = match outcome.await {
            Ok(result) => result,
            Err(join_error) => Err(RuntimeError::InternalInvariantViolation(format!(
                "engine task join error: {join_error}"
            ))),
        };
        let events = collector.await.unwrap_or_default();
        (events, result)
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle").finish()
    }
}

enum Operation {
    Run { input: Value },
    Resume { interrupt_id: String, payload: Value },
    ExternalWrites { writes: Vec<(String, Value)> },
}

/// The runtime: compiled graph + collaborators + per-thread lanes
pub struct Runtime {
    graph: Arc<CompiledGraph>,
    store: Option<Arc<dyn CheckpointStore>>,
    model: Option<ModelClientRef>,
    tools: Option<ToolRegistryRef>,
    clock: Arc<dyn Clock>,
    lanes: Mutex<HashMap<String, Arc<ThreadLane>>>,
}

impl Runtime {
    /// Create a runtime over a compiled graph
    pub fn new(graph: Arc<CompiledGraph>) -> Self {
        Self {
            graph,
            store: None,
            model: None,
            tools: None,
            clock: Arc::new(TokioClock),
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a checkpoint store
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach a model client
    pub fn with_model_client(mut self, model: ModelClientRef) -> Self {
        self.model = Some(model);
        self
    }

    /// Attach a tool registry
    pub fn with_tool_registry(mut self, tools: ToolRegistryRef) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Override the clock (tests drive backoff with a manual clock)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The compiled graph this runtime executes
    pub fn graph(&self) -> &Arc<CompiledGraph> {
        &self.graph
    }

    async fn lane(&self, thread_id: &str) -> Arc<ThreadLane> {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(ThreadLane::default()))
            .clone()
    }

    fn spawn(
        &self,
        thread_id: String,
        lane: Arc<ThreadLane>,
        options: RunOptions,
        operation: Operation,
    ) -> RunHandle {
        let run_id_hint = options.run_id.unwrap_or_else(Uuid::new_v4);
        let queue = EventQueue::new(run_id_hint, options.event_buffer_capacity);
        let cancel = CancelToken::new();

        let step_loop = StepLoop {
            graph: self.graph.clone(),
            store: self.store.clone(),
            model: self.model.clone(),
            tools: self.tools.clone(),
            clock: self.clock.clone(),
            queue: queue.clone(),
            cancel: cancel.clone(),
            options: RunOptions {
                run_id: Some(run_id_hint),
                ..options
            },
            thread_id,
        };

        let events = EventStream::new(queue.clone());
        let debug_payloads = step_loop.options.debug_payloads;
        let outcome = tokio::spawn(async move {
            // the lane lock serializes every operation on this thread
            let mut slot = lane.state.lock().await;

            queue.emit(EventScope::run(), EventKind::RunStarted).await;
            let result = match operation {
                Operation::Run { input } => step_loop.run_fresh(&mut slot, input).await,
                Operation::Resume {
                    interrupt_id,
                    payload,
                } => {
                    step_loop
                        .run_resume(&mut slot, &interrupt_id, payload)
                        .await
                }
                Operation::ExternalWrites { writes } => {
                    step_loop.run_external(&mut slot, writes).await
                }
            };

            match &result {
                Ok(RunOutcome::Finished(_)) | Ok(RunOutcome::OutOfSteps(_)) => {
                    queue.emit(EventScope::run(), EventKind::RunFinished).await;
                }
                Ok(RunOutcome::Interrupted { interrupt_id, .. }) => {
                    queue
                        .emit(
                            EventScope::run(),
                            EventKind::RunInterrupted {
                                interrupt_id: interrupt_id.clone(),
                            },
                        )
                        .await;
                }
                Ok(RunOutcome::Cancelled) => {
                    queue.emit(EventScope::run(), EventKind::RunCancelled).await;
                }
                Err(error) => {
                    queue
                        .emit(
                            EventScope::run(),
                            EventKind::RunError {
                                error: error.to_info(debug_payloads),
                            },
                        )
                        .await;
                }
            }
            result
        });

        RunHandle {
            events,
            outcome,
            cancel,
        }
    }

    /// Start a fresh run on a thread
    pub async fn run(
        &self,
        thread_id: impl Into<String>,
        input: Value,
        options: RunOptions,
    ) -> RunHandle {
        let thread_id = thread_id.into();
        let lane = self.lane(&thread_id).await;
        self.spawn(thread_id, lane, options, Operation::Run { input })
    }

    /// Resume an interrupted thread with a payload
    pub async fn resume(
        &self,
        thread_id: impl Into<String>,
        interrupt_id: impl Into<String>,
        payload: Value,
        options: RunOptions,
    ) -> RunHandle {
        let thread_id = thread_id.into();
        let lane = self.lane(&thread_id).await;
        self.spawn(
            thread_id,
            lane,
            options,
            Operation::Resume {
                interrupt_id: interrupt_id.into(),
                payload,
            },
        )
    }

    /// Apply external writes as a synthetic committed step
    pub async fn apply_external_writes(
        &self,
        thread_id: impl Into<String>,
        writes: Vec<(String, Value)>,
        options: RunOptions,
    ) -> RunHandle {
        let thread_id = thread_id.into();
        let lane = self.lane(&thread_id).await;
        self.spawn(thread_id, lane, options, Operation::ExternalWrites { writes })
    }

    /// Latest committed global store of a thread, if the thread has state
    pub async fn get_latest_store(&self, thread_id: &str) -> Option<GlobalStore> {
        let lane = self.lane(thread_id).await;
        let slot = lane.state.lock().await;
        slot.as_ref().map(|state| state.global.clone())
    }

    /// Latest checkpoint, through the configured store
    ///
    /// Serialized on the thread's lane like every other thread operation.
    pub async fn get_latest_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let store = self
            .store
            .as_ref()
            .ok_or(RuntimeError::Checkpoint(CheckpointError::StoreMissing))?;
        let lane = self.lane(thread_id).await;
        let _slot = lane.state.lock().await;
        Ok(store.load_latest(thread_id).await?)
    }

    /// Checkpoint history, newest first (store permitting)
    pub async fn get_checkpoint_history(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointSummary>> {
        let store = self
            .store
            .as_ref()
            .ok_or(RuntimeError::Checkpoint(CheckpointError::StoreMissing))?;
        let lane = self.lane(thread_id).await;
        let _slot = lane.state.lock().await;
        Ok(store.list_checkpoints(thread_id, limit).await?)
    }

    /// A specific checkpoint by id (store permitting)
    pub async fn get_checkpoint(&self, thread_id: &str, id: &str) -> Result<Option<Checkpoint>> {
        let store = self
            .store
            .as_ref()
            .ok_or(RuntimeError::Checkpoint(CheckpointError::StoreMissing))?;
        let lane = self.lane(thread_id).await;
        let _slot = lane.state.lock().await;
        Ok(store.load_checkpoint(thread_id, id).await?)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("graph", &self.graph)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}
