//! # lockstep-core
//!
//! Deterministic superstep runtime for graph-based agent workflows.
//!
//! A user declares a schema of typed state slots (channels, from
//! `lockstep-checkpoint`) and a graph of nodes connected by static edges,
//! conditional routers, parallel spawns, and join barriers. The runtime
//! executes the graph in lock-step supersteps: each step runs the current
//! frontier concurrently, folds the proposed writes through deterministic
//! reducers, commits the global state atomically, and derives the next
//! frontier. Two runs with identical inputs (including an injected run id)
//! produce byte-identical event traces and committed state; any failure in
//! a step — task error, reducer error, policy violation, checkpoint save
//! failure — aborts the step without mutating committed state.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Runtime (per-thread lanes)                              │
//! │                                                          │
//! │   run / resume / apply_external_writes → RunHandle       │
//! │        │                                                 │
//! │        ▼                                                 │
//! │  ┌────────────────── superstep ─────────────────┐        │
//! │  │ seed frontier → execute tasks (bounded fan-  │        │
//! │  │ out, retries, cancellation) → plan commit    │        │
//! │  │ (validate, route, fold, joins, triggers,     │        │
//! │  │ interrupt) → checkpoint? → apply → events    │        │
//! │  └──────────────────────────────────────────────┘        │
//! │        │                                                 │
//! │        ▼                                                 │
//! │  finished | interrupted | outOfSteps | cancelled | error │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use lockstep_core::{GraphBuilder, NodeOutput, Runtime, RunOptions};
//! use lockstep_checkpoint::{channels::{ChannelSpec, Schema, SchemaRegistry}, codec::JsonCodec, reducer};
//! use serde_json::json;
//!
//! let schema = Schema::new(SchemaRegistry::build(vec![
//!     ChannelSpec::global("counter", "int", || json!(0), reducer::sum())
//!         .with_codec(JsonCodec::shared()),
//! ])?);
//!
//! let mut builder = GraphBuilder::new(schema);
//! builder.add_node("bump", |input: lockstep_core::NodeInput| {
//!     Box::pin(async move {
//!         Ok(NodeOutput::new().write("counter", json!(1)).end())
//!     }) as lockstep_core::NodeFuture
//! });
//! builder.add_start("bump");
//! let graph = builder.compile()?;
//!
//! let runtime = Runtime::new(graph);
//! let handle = runtime.run("thread-1", json!(null), RunOptions::default()).await;
//! let outcome = handle.outcome().await?;
//! ```

pub mod builder;
pub mod cancel;
pub mod clock;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod graph;
pub mod model;
pub mod retry;
pub mod runtime;
pub mod store;
pub mod tool;
pub mod version;

pub use builder::{CompiledGraph, GraphBuilder};
pub use cancel::CancelToken;
pub use clock::{Clock, ManualClock, TokioClock};
pub use context::RunContext;
pub use engine::{CheckpointPolicy, RunOptions, RunOutcome, Task, ThreadState};
pub use error::{ErrorInfo, Result, RuntimeError};
pub use events::{Event, EventId, EventKind, EventStream};
pub use graph::{
    join_edge_id, InterruptRequest, JoinEdge, Next, NodeFuture, NodeInput, NodeOutput, NodeRun,
    OutputProjection, RouterFn, RunWhen, TaskSeed,
};
pub use model::{
    collect_stream, run_model_tool_loop, ModelChunk, ModelClient, ModelClientRef, ModelRequest,
    ModelResponse, ModelStream, ToolRegistryRef,
};
pub use retry::RetryPolicy;
pub use runtime::{RunHandle, Runtime};
pub use store::{fresh_view_for_task, GlobalStore, InitialCache, ReadView};
pub use tool::{sort_tool_calls, ToolCall, ToolDefinition, ToolRegistry, ToolResult};
pub use version::schema_version;

// Re-export the state-model crate so downstream users need one dependency.
pub use lockstep_checkpoint as checkpoint;
