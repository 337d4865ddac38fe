//! Graph data model: nodes, routers, edges, joins, projections
//!
//! A graph is a set of nodes connected by static edges, conditional routers,
//! parallel spawns, and join barriers. Nodes run asynchronously and return a
//! [`NodeOutput`]: ordered channel writes, a [`Next`] directive, optional
//! spawn seeds with task-local overlays, and an optional interrupt request.
//! Routers are synchronous functions from a read view to a [`Next`].
//!
//! Construction and validation live in [`crate::builder`]; this module holds
//! the declaration types shared by the builder and the step engine.

use crate::context::RunContext;
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::store::ReadView;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Node identifier — unique per graph; must not contain `:` or `+`
/// (reserved for canonical join-edge ids)
pub type NodeId = String;

/// Control-flow directive returned by nodes and routers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    /// Follow the node's static outgoing edges (or its router)
    UseGraphEdges,
    /// Jump to the listed nodes; an empty list is equivalent to [`Next::End`]
    Goto(Vec<NodeId>),
    /// Terminate this branch of the graph
    End,
}

/// A child task to spawn in the next superstep
///
/// The overlay seeds the child's task-local channels; this spawn mechanism is
/// the only way task-local channels are ever written.
#[derive(Debug, Clone)]
pub struct TaskSeed {
    /// Node the child executes
    pub node_id: NodeId,
    /// Task-local overlay entries (channel id → value)
    pub task_local: BTreeMap<String, Value>,
}

impl TaskSeed {
    /// Spawn a node with an empty overlay
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            task_local: BTreeMap::new(),
        }
    }

    /// Add a task-local overlay entry
    pub fn with_local(mut self, channel: impl Into<String>, value: Value) -> Self {
        self.task_local.insert(channel.into(), value);
        self
    }
}

/// Interrupt request attached to a node output
#[derive(Debug, Clone)]
pub struct InterruptRequest {
    /// Payload surfaced to the caller with the interrupted outcome
    pub payload: Value,
}

/// Everything a node task produces
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    /// Ordered channel writes; emission order is preserved through commit
    pub writes: Vec<(String, Value)>,
    /// Where control flows after this task
    pub next: Next,
    /// Child tasks to spawn in the next superstep
    pub spawn: Vec<TaskSeed>,
    /// Interrupt request; the smallest-ordinal request in a step wins
    pub interrupt: Option<InterruptRequest>,
}

impl Default for Next {
    fn default() -> Self {
        Self::UseGraphEdges
    }
}

impl NodeOutput {
    /// Empty output following the graph's edges
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a write
    pub fn write(mut self, channel: impl Into<String>, value: Value) -> Self {
        self.writes.push((channel.into(), value));
        self
    }

    /// Route to explicit targets
    pub fn goto(mut self, targets: impl IntoIterator<Item = impl Into<NodeId>>) -> Self {
        self.next = Next::Goto(targets.into_iter().map(Into::into).collect());
        self
    }

    /// Terminate this branch
    pub fn end(mut self) -> Self {
        self.next = Next::End;
        self
    }

    /// Spawn a child task
    pub fn spawn(mut self, seed: TaskSeed) -> Self {
        self.spawn.push(seed);
        self
    }

    /// Request an interrupt with a payload
    pub fn interrupt(mut self, payload: Value) -> Self {
        self.interrupt = Some(InterruptRequest { payload });
        self
    }
}

/// Input handed to every node task
pub struct NodeInput {
    /// Composed read view over the thread's state
    pub read: ReadView,
    /// Caller-supplied run context value (opaque to the engine)
    pub context: Value,
    /// Engine services: resume payload, event emitters, cancellation, clock
    pub run: RunContext,
}

/// Boxed future returned by node bodies
pub type NodeFuture = Pin<Box<dyn Future<Output = Result<NodeOutput>> + Send + 'static>>;

/// A node's async body
///
/// Implemented for any `Fn(NodeInput) -> NodeFuture` closure; bodies may
/// suspend freely (I/O, model streaming, tool calls).
pub trait NodeRun: Send + Sync {
    /// Execute one task of this node
    fn run(&self, input: NodeInput) -> NodeFuture;
}

impl<F> NodeRun for F
where
    F: Fn(NodeInput) -> NodeFuture + Send + Sync,
{
    fn run(&self, input: NodeInput) -> NodeFuture {
        self(input)
    }
}

/// Synchronous router: read view in, [`Next`] out
///
/// Routers must not suspend; any error aborts the step at commit.
pub type RouterFn = Arc<dyn Fn(&ReadView) -> Result<Next> + Send + Sync>;

/// Scheduling trigger declared per node
///
/// Evaluated against per-channel version counters when a graph-seed is
/// scheduled; join-seeds bypass the filter. `Always` is the default and
/// keeps the graph on the trigger-free digest tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunWhen {
    /// Fire on every scheduling
    Always,
    /// Fire when any listed channel's version advanced since last observed
    AnyOf(Vec<String>),
    /// Fire only when every listed channel's version advanced
    AllOf(Vec<String>),
}

impl Default for RunWhen {
    fn default() -> Self {
        Self::Always
    }
}

impl RunWhen {
    /// Whether this is the default (trigger-free) declaration
    pub fn is_default(&self) -> bool {
        matches!(self, Self::Always)
    }

    /// Channels the trigger watches
    pub fn channels(&self) -> &[String] {
        match self {
            Self::Always => &[],
            Self::AnyOf(c) | Self::AllOf(c) => c,
        }
    }
}

/// A declared node
#[derive(Clone)]
pub struct NodeDecl {
    /// Unique node id
    pub id: NodeId,
    /// Retry policy for this node's tasks
    pub retry: RetryPolicy,
    /// Scheduling trigger
    pub run_when: RunWhen,
    /// Async body
    pub run: Arc<dyn NodeRun>,
}

impl fmt::Debug for NodeDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDecl")
            .field("id", &self.id)
            .field("retry", &self.retry)
            .field("run_when", &self.run_when)
            .finish()
    }
}

/// Join barrier: fires its target once every parent completed since last fire
#[derive(Debug, Clone)]
pub struct JoinEdge {
    /// Canonical id: `"join:" + sorted_parents.join("+") + ":" + target`
    pub id: String,
    /// Distinct parent node ids, sorted ascending
    pub parents: Vec<NodeId>,
    /// Node scheduled when the barrier fires
    pub target: NodeId,
}

/// Canonical join-edge id for a parent set and target
pub fn join_edge_id(sorted_parents: &[NodeId], target: &str) -> String {
    format!("join:{}:{}", sorted_parents.join("+"), target)
}

/// What the finished outcome exposes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputProjection {
    /// Every global channel
    FullStore,
    /// A de-duplicated, ascending-sorted subset of global channel ids
    Channels(Vec<String>),
}

impl Default for OutputProjection {
    fn default() -> Self {
        Self::FullStore
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_output_builder_preserves_write_order() {
        let out = NodeOutput::new()
            .write("b", json!(1))
            .write("a", json!(2))
            .write("b", json!(3));
        let channels: Vec<&str> = out.writes.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(channels, vec!["b", "a", "b"]);
        assert_eq!(out.next, Next::UseGraphEdges);
    }

    #[test]
    fn test_goto_and_end() {
        assert_eq!(
            NodeOutput::new().goto(["x", "y"]).next,
            Next::Goto(vec!["x".to_string(), "y".to_string()])
        );
        assert_eq!(NodeOutput::new().end().next, Next::End);
    }

    #[test]
    fn test_join_edge_id_canonical() {
        let parents = vec!["WorkerA".to_string(), "WorkerB".to_string()];
        assert_eq!(join_edge_id(&parents, "Gate"), "join:WorkerA+WorkerB:Gate");
    }

    #[test]
    fn test_run_when_default() {
        assert!(RunWhen::Always.is_default());
        assert!(!RunWhen::AnyOf(vec!["c".into()]).is_default());
    }

    #[test]
    fn test_task_seed_overlay() {
        let seed = TaskSeed::new("worker").with_local("item", json!("apple"));
        assert_eq!(seed.task_local["item"], json!("apple"));
    }
}
