//! Run event stream
//!
//! Every run emits a bounded, deterministic event stream. One controller per
//! run serializes enqueues behind a mutex; consumers read an async stream.
//!
//! # Ordering (per committed step)
//!
//! `runStarted` → `stepStarted` → interleaved `nodeStarted`/`nodeFinished`
//! (+ retry attempts) → `taskFailed`* → `writeApplied`* (commit order) →
//! `checkpointSaved`? → `stepFinished` → terminal (`runFinished` |
//! `runInterrupted` | `runCancelled` | `runError`). Model and tool streaming
//! events are emitted from within node tasks.
//!
//! # Backpressure
//!
//! The queue is bounded ([`MIN_EVENT_BUFFER_CAPACITY`] is the enforced
//! floor). Non-droppable events block producers until space frees. Droppable
//! events (`modelToken`, `customDebug`) are coalesced into the queue tail
//! when possible (consecutive same-task tokens concatenate; never across
//! task, step, or attempt boundaries) and otherwise dropped; a
//! `streamBackpressure` marker is emitted for any step that dropped.

use crate::error::ErrorInfo;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

/// Enforced minimum event buffer capacity
pub const MIN_EVENT_BUFFER_CAPACITY: usize = 16;

/// Identity of one event within a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventId {
    /// Run that emitted the event
    pub run_id: Uuid,
    /// Retry attempt for task-scoped events (0 otherwise)
    pub attempt: u32,
    /// Monotonically increasing per-run counter
    pub index: u64,
    /// Step the event belongs to, when step-scoped
    pub step_index: Option<u32>,
    /// Emitting task's ordinal, when task-scoped
    pub task_ordinal: Option<u32>,
}

/// Event payloads
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Run accepted and starting
    RunStarted,
    /// A superstep is beginning
    StepStarted {
        /// Step about to execute
        step_index: u32,
        /// Number of frontier tasks
        frontier_count: usize,
    },
    /// A node task began an attempt
    NodeStarted {
        /// Node id
        node_id: String,
        /// Canonical task id
        task_id: String,
    },
    /// A node task attempt completed successfully
    NodeFinished {
        /// Node id
        node_id: String,
        /// Canonical task id
        task_id: String,
    },
    /// A node task attempt failed and will be retried
    NodeRetrying {
        /// Node id
        node_id: String,
        /// Canonical task id
        task_id: String,
        /// Failure that triggered the retry
        error: ErrorInfo,
    },
    /// A task exhausted its retries (or the step was cancelled)
    TaskFailed {
        /// Node id
        node_id: String,
        /// Canonical task id
        task_id: String,
        /// Final failure
        error: ErrorInfo,
    },
    /// A channel received its folded value during commit
    WriteApplied {
        /// Channel id
        channel: String,
        /// Debug metadata (debug payloads only)
        debug: Option<Value>,
    },
    /// A checkpoint was persisted at this commit
    CheckpointSaved {
        /// Persisted checkpoint id
        checkpoint_id: String,
    },
    /// Droppable events were dropped during this step
    StreamBackpressure {
        /// How many events were dropped
        dropped: usize,
    },
    /// A superstep committed
    StepFinished {
        /// Step that committed
        step_index: u32,
        /// Size of the next frontier
        next_frontier_count: usize,
    },
    /// Model call started inside a node
    ModelInvocationStarted {
        /// Emitting node
        node_id: String,
    },
    /// Streamed model token (droppable, coalescable)
    ModelToken {
        /// Token text
        text: String,
    },
    /// Model call finished inside a node
    ModelInvocationFinished {
        /// Emitting node
        node_id: String,
    },
    /// Tool call started inside a node
    ToolInvocationStarted {
        /// Tool name
        name: String,
        /// Tool call id
        call_id: String,
    },
    /// Tool call finished inside a node
    ToolInvocationFinished {
        /// Tool name
        name: String,
        /// Tool call id
        call_id: String,
    },
    /// Application debug event (droppable)
    CustomDebug {
        /// Arbitrary payload
        data: Value,
    },
    /// Terminal: run completed
    RunFinished,
    /// Terminal: run interrupted
    RunInterrupted {
        /// Winning interrupt id
        interrupt_id: String,
    },
    /// Terminal: run cancelled
    RunCancelled,
    /// Terminal: run failed
    RunError {
        /// Originating failure
        error: ErrorInfo,
    },
}

impl EventKind {
    /// Whether the event may be dropped or coalesced under backpressure
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::ModelToken { .. } | Self::CustomDebug { .. })
    }

    /// Whether the event terminates the stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunFinished
                | Self::RunInterrupted { .. }
                | Self::RunCancelled
                | Self::RunError { .. }
        )
    }
}

/// One emitted event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Event identity
    pub id: EventId,
    /// Payload
    pub kind: EventKind,
}

/// Step/task/attempt scope attached at emission
#[derive(Debug, Clone, Copy, Default)]
pub struct EventScope {
    /// Step the event belongs to
    pub step_index: Option<u32>,
    /// Emitting task ordinal
    pub task_ordinal: Option<u32>,
    /// Retry attempt of the emitting task
    pub attempt: u32,
}

impl EventScope {
    /// Run-scoped (no step, no task)
    pub fn run() -> Self {
        Self::default()
    }

    /// Step-scoped
    pub fn step(step_index: u32) -> Self {
        Self {
            step_index: Some(step_index),
            ..Self::default()
        }
    }

    /// Task-scoped
    pub fn task(step_index: u32, task_ordinal: u32, attempt: u32) -> Self {
        Self {
            step_index: Some(step_index),
            task_ordinal: Some(task_ordinal),
            attempt,
        }
    }
}

#[derive(Debug)]
struct QueueState {
    buf: VecDeque<Event>,
    closed: bool,
    dropped_this_step: usize,
    next_index: u64,
}

/// Bounded per-run event controller
#[derive(Debug)]
pub struct EventQueue {
    run_id: Mutex<Uuid>,
    capacity: usize,
    state: Mutex<QueueState>,
    space: Notify,
    items: Notify,
}

impl EventQueue {
    /// Create a controller with the requested capacity (floor-clamped)
    pub fn new(run_id: Uuid, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            run_id: Mutex::new(run_id),
            capacity: capacity.max(MIN_EVENT_BUFFER_CAPACITY),
            state: Mutex::new(QueueState {
                buf: VecDeque::new(),
                closed: false,
                dropped_this_step: 0,
                next_index: 0,
            }),
            space: Notify::new(),
            items: Notify::new(),
        })
    }

    /// Effective capacity after the floor clamp
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rebind the run id (resume learns the true id from the checkpoint)
    pub fn set_run_id(&self, run_id: Uuid) {
        *self.run_id.lock().expect("event queue run id") = run_id;
    }

    fn make_event(&self, state: &mut QueueState, scope: EventScope, kind: EventKind) -> Event {
        let index = state.next_index;
        state.next_index += 1;
        Event {
            id: EventId {
                run_id: *self.run_id.lock().expect("event queue run id"),
                attempt: scope.attempt,
                index,
                step_index: scope.step_index,
                task_ordinal: scope.task_ordinal,
            },
            kind,
        }
    }

    /// Emit an event, blocking on a full queue for non-droppable kinds
    ///
    /// Droppable kinds are coalesced into a same-task `modelToken` tail when
    /// possible and dropped otherwise; drops are tallied for the step's
    /// `streamBackpressure` marker.
    pub async fn emit(&self, scope: EventScope, kind: EventKind) {
        if kind.is_droppable() {
            self.emit_droppable(scope, kind);
            return;
        }
        loop {
            // register for space before checking, so a pop between the check
            // and the await cannot be lost
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            {
                let mut state = self.state.lock().expect("event queue mutex");
                if state.closed {
                    return;
                }
                if state.buf.len() < self.capacity {
                    let terminal = kind.is_terminal();
                    let event = self.make_event(&mut state, scope, kind);
                    state.buf.push_back(event);
                    if terminal {
                        state.closed = true;
                    }
                    drop(state);
                    self.items.notify_waiters();
                    return;
                }
            }
            space.await;
        }
    }

    /// Emit a droppable event without awaiting (coalesce or drop when full)
    pub fn emit_droppable_now(&self, scope: EventScope, kind: EventKind) {
        debug_assert!(kind.is_droppable());
        self.emit_droppable(scope, kind);
    }

    fn emit_droppable(&self, scope: EventScope, kind: EventKind) {
        let mut state = self.state.lock().expect("event queue mutex");
        if state.closed {
            return;
        }
        if state.buf.len() < self.capacity {
            let event = self.make_event(&mut state, scope, kind);
            state.buf.push_back(event);
            drop(state);
            self.items.notify_waiters();
            return;
        }
        // full: coalesce consecutive same-task tokens into the tail
        if let (EventKind::ModelToken { text }, Some(tail)) = (&kind, state.buf.back_mut()) {
            if tail.id.step_index == scope.step_index
                && tail.id.task_ordinal == scope.task_ordinal
                && tail.id.attempt == scope.attempt
            {
                if let EventKind::ModelToken { text: tail_text } = &mut tail.kind {
                    tail_text.push_str(text);
                    return;
                }
            }
        }
        state.dropped_this_step += 1;
    }

    /// Drain and reset the step's drop tally
    pub fn take_dropped_count(&self) -> usize {
        let mut state = self.state.lock().expect("event queue mutex");
        std::mem::take(&mut state.dropped_this_step)
    }

    /// Close the stream without a terminal event (consumer handle dropped)
    pub fn close(&self) {
        let mut state = self.state.lock().expect("event queue mutex");
        state.closed = true;
        drop(state);
        self.items.notify_waiters();
        self.space.notify_waiters();
    }

    /// Pop the next event; `None` once closed and drained
    pub async fn next(&self) -> Option<Event> {
        loop {
            let items = self.items.notified();
            tokio::pin!(items);
            items.as_mut().enable();
            {
                let mut state = self.state.lock().expect("event queue mutex");
                if let Some(event) = state.buf.pop_front() {
                    drop(state);
                    self.space.notify_waiters();
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            items.await;
        }
    }
}

/// Consumer handle over a run's events
pub struct EventStream {
    queue: Arc<EventQueue>,
}

impl EventStream {
    pub(crate) fn new(queue: Arc<EventQueue>) -> Self {
        Self { queue }
    }

    /// Next event; `None` after the terminal event has been delivered
    pub async fn next(&mut self) -> Option<Event> {
        self.queue.next().await
    }

    /// Collect every remaining event (drains until the stream closes)
    pub async fn collect(mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    /// Adapt into a `futures::Stream`
    pub fn into_stream(self) -> impl futures::Stream<Item = Event> {
        let queue = self.queue;
        async_stream::stream! {
            loop {
                match queue.next().await {
                    Some(event) => yield event,
                    None => break,
                }
            }
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> Arc<EventQueue> {
        EventQueue::new(Uuid::from_u128(1), MIN_EVENT_BUFFER_CAPACITY)
    }

    #[tokio::test]
    async fn test_indices_monotone() {
        let q = queue();
        q.emit(EventScope::run(), EventKind::RunStarted).await;
        q.emit(
            EventScope::step(0),
            EventKind::StepStarted {
                step_index: 0,
                frontier_count: 1,
            },
        )
        .await;
        let a = q.next().await.unwrap();
        let b = q.next().await.unwrap();
        assert_eq!(a.id.index, 0);
        assert_eq!(b.id.index, 1);
        assert_eq!(b.id.step_index, Some(0));
    }

    #[tokio::test]
    async fn test_terminal_closes_stream() {
        let q = queue();
        q.emit(EventScope::run(), EventKind::RunStarted).await;
        q.emit(EventScope::run(), EventKind::RunFinished).await;
        assert!(matches!(q.next().await.unwrap().kind, EventKind::RunStarted));
        assert!(matches!(q.next().await.unwrap().kind, EventKind::RunFinished));
        assert!(q.next().await.is_none());
    }

    #[tokio::test]
    async fn test_droppable_coalesces_at_capacity() {
        let q = queue();
        let scope = EventScope::task(0, 3, 0);
        // fill to capacity with tokens from one task
        for i in 0..q.capacity() {
            q.emit(
                scope,
                EventKind::ModelToken {
                    text: format!("t{i} "),
                },
            )
            .await;
        }
        // queue is full: this token must merge into the tail, not drop
        q.emit(
            scope,
            EventKind::ModelToken {
                text: "tail".to_string(),
            },
        )
        .await;
        assert_eq!(q.take_dropped_count(), 0);

        let mut last = None;
        for _ in 0..q.capacity() {
            last = q.next().await;
        }
        match last.unwrap().kind {
            EventKind::ModelToken { text } => assert!(text.ends_with("tail")),
            other => panic!("unexpected tail {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_droppable_from_other_task_drops() {
        let q = queue();
        for _ in 0..q.capacity() {
            q.emit(
                EventScope::task(0, 0, 0),
                EventKind::ModelToken {
                    text: "x".to_string(),
                },
            )
            .await;
        }
        // different ordinal: coalescing is not allowed across tasks
        q.emit(
            EventScope::task(0, 1, 0),
            EventKind::ModelToken {
                text: "y".to_string(),
            },
        )
        .await;
        assert_eq!(q.take_dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_coalescing_does_not_cross_attempts() {
        let q = queue();
        for _ in 0..q.capacity() {
            q.emit(
                EventScope::task(0, 0, 0),
                EventKind::ModelToken {
                    text: "x".to_string(),
                },
            )
            .await;
        }
        q.emit(
            EventScope::task(0, 0, 1),
            EventKind::ModelToken {
                text: "y".to_string(),
            },
        )
        .await;
        assert_eq!(q.take_dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_custom_debug_drops_when_full() {
        let q = queue();
        for _ in 0..q.capacity() {
            q.emit(EventScope::step(0), EventKind::StepStarted { step_index: 0, frontier_count: 0 })
                .await;
        }
        q.emit(
            EventScope::task(0, 0, 0),
            EventKind::CustomDebug { data: json!(1) },
        )
        .await;
        assert_eq!(q.take_dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_non_droppable_blocks_until_space() {
        let q = queue();
        for _ in 0..q.capacity() {
            q.emit(EventScope::run(), EventKind::RunStarted).await;
        }
        let producer = {
            let q = q.clone();
            tokio::spawn(async move {
                q.emit(EventScope::run(), EventKind::RunFinished).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());

        // free one slot; the blocked producer completes
        let _ = q.next().await;
        tokio::time::timeout(std::time::Duration::from_secs(1), producer)
            .await
            .expect("producer should unblock")
            .unwrap();
    }

    #[tokio::test]
    async fn test_capacity_floor() {
        let q = EventQueue::new(Uuid::from_u128(2), 1);
        assert_eq!(q.capacity(), MIN_EVENT_BUFFER_CAPACITY);
    }
}
