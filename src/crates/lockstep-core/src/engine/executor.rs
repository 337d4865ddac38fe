//! Concurrent frontier execution
//!
//! Runs every frontier task as a bounded fan-out (a semaphore caps
//! concurrency at `max_concurrent_tasks`), applies per-node retry policies
//! through the injected clock, and races each attempt against the run's
//! cancellation token. Outputs are settled per task and processed by the
//! commit in ordinal order, so completion timing never leaks into state.
//!
//! Event discipline: `nodeStarted` for attempt 0 is emitted synchronously in
//! ordinal order before any task is spawned. Everything after that —
//! retries, later-attempt starts, `nodeFinished`, and (under deterministic
//! token streaming) all node-emitted events — is buffered per task and
//! flushed by the step loop in ascending ordinal order once every task has
//! settled. Traces are byte-identical regardless of completion timing.

use crate::builder::CompiledGraph;
use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::context::{EventSink, RunContext};
use crate::engine::types::{RunOptions, ThreadState};
use crate::error::{Result, RuntimeError};
use crate::events::{EventKind, EventQueue, EventScope};
use crate::graph::{NodeInput, NodeOutput};
use crate::model::{ModelClientRef, ToolRegistryRef};
use crate::store::ReadView;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Final result of one frontier task
pub(crate) struct SettledTask {
    /// Frontier position
    pub ordinal: u32,
    /// Success output or the final attempt's error (`Cancelled` marker for
    /// cancelled tasks)
    pub output: Result<NodeOutput>,
    /// Buffered task events, in intra-task emission order
    pub events: Vec<(EventScope, EventKind)>,
}

/// Shared services the executor threads through to tasks
pub(crate) struct ExecutorEnv {
    pub graph: Arc<CompiledGraph>,
    pub queue: Arc<EventQueue>,
    pub cancel: CancelToken,
    pub clock: Arc<dyn Clock>,
    pub model: Option<ModelClientRef>,
    pub tools: Option<ToolRegistryRef>,
}

/// Execute the current frontier to settlement
pub(crate) async fn execute_frontier(
    env: &ExecutorEnv,
    state: &ThreadState,
    options: &RunOptions,
    resume: Option<Value>,
) -> Vec<SettledTask> {
    let step_index = state.step_index;
    let snapshot = state.global.snapshot();
    let initial = state.initial.clone();

    // attempt-0 starts, in ordinal order, before anything runs
    for task in &state.frontier {
        env.queue
            .emit(
                EventScope::task(step_index, task.ordinal, 0),
                EventKind::NodeStarted {
                    node_id: task.node_id.clone(),
                    task_id: task.id.clone(),
                },
            )
            .await;
    }

    let semaphore = Arc::new(Semaphore::new(options.max_concurrent_tasks));
    let mut handles = Vec::with_capacity(state.frontier.len());
    for task in &state.frontier {
        let task = task.clone();
        let semaphore = semaphore.clone();
        let graph = env.graph.clone();
        let queue = env.queue.clone();
        let cancel = env.cancel.clone();
        let clock = env.clock.clone();
        let model = env.model.clone();
        let tools = env.tools.clone();
        let snapshot = snapshot.clone();
        let initial = initial.clone();
        let context = options.context.clone();
        let resume = resume.clone();
        let deterministic = options.deterministic_token_streaming;

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore open");
            let buffer: Arc<Mutex<Vec<(EventScope, EventKind)>>> = Arc::new(Mutex::new(Vec::new()));
            let decl = match graph.node(&task.node_id) {
                Ok(decl) => decl.clone(),
                Err(e) => {
                    return SettledTask {
                        ordinal: task.ordinal,
                        output: Err(e),
                        events: Vec::new(),
                    }
                }
            };

            let mut attempt: u32 = 0;
            loop {
                let scope = EventScope::task(step_index, task.ordinal, attempt);
                if attempt > 0 {
                    buffer.lock().expect("task event buffer").push((
                        scope,
                        EventKind::NodeStarted {
                            node_id: task.node_id.clone(),
                            task_id: task.id.clone(),
                        },
                    ));
                }

                let sink = if deterministic {
                    EventSink::Buffered(buffer.clone())
                } else {
                    EventSink::Live(queue.clone())
                };
                let read = ReadView::new(
                    graph.schema.registry.clone(),
                    snapshot.clone(),
                    Arc::new(task.task_local.clone()),
                    initial.clone(),
                );
                let input = NodeInput {
                    read,
                    context: context.clone(),
                    run: RunContext {
                        resume: resume.clone(),
                        sink,
                        scope,
                        node_id: task.node_id.clone(),
                        cancel: cancel.clone(),
                        clock: clock.clone(),
                        model: model.clone(),
                        tools: tools.clone(),
                    },
                };

                let attempt_result = tokio::select! {
                    out = decl.run.run(input) => out,
                    _ = cancel.cancelled() => Err(RuntimeError::Cancelled),
                };

                match attempt_result {
                    Ok(output) => {
                        buffer.lock().expect("task event buffer").push((
                            scope,
                            EventKind::NodeFinished {
                                node_id: task.node_id.clone(),
                                task_id: task.id.clone(),
                            },
                        ));
                        let events = std::mem::take(&mut *buffer.lock().expect("task event buffer"));
                        return SettledTask {
                            ordinal: task.ordinal,
                            output: Ok(output),
                            events,
                        };
                    }
                    Err(e) if e.is_cancellation() => {
                        let events = std::mem::take(&mut *buffer.lock().expect("task event buffer"));
                        return SettledTask {
                            ordinal: task.ordinal,
                            output: Err(RuntimeError::Cancelled),
                            events,
                        };
                    }
                    Err(e) => match decl.retry.delay_before_retry(attempt) {
                        Some(delay) => {
                            tracing::debug!(
                                node = %task.node_id,
                                attempt,
                                ?delay,
                                "task attempt failed, retrying"
                            );
                            buffer.lock().expect("task event buffer").push((
                                scope,
                                EventKind::NodeRetrying {
                                    node_id: task.node_id.clone(),
                                    task_id: task.id.clone(),
                                    // full detail; elision happens at flush
                                    error: e.to_info(true),
                                },
                            ));
                            if let Err(cancelled) = clock.sleep(delay, &cancel).await {
                                debug_assert!(cancelled.is_cancellation());
                                let events =
                                    std::mem::take(&mut *buffer.lock().expect("task event buffer"));
                                return SettledTask {
                                    ordinal: task.ordinal,
                                    output: Err(RuntimeError::Cancelled),
                                    events,
                                };
                            }
                            attempt += 1;
                        }
                        None => {
                            let events =
                                std::mem::take(&mut *buffer.lock().expect("task event buffer"));
                            return SettledTask {
                                ordinal: task.ordinal,
                                output: Err(e),
                                events,
                            };
                        }
                    },
                }
            }
        }));
    }

    let mut settled: Vec<SettledTask> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| match joined {
            Ok(task) => task,
            Err(join_error) => SettledTask {
                ordinal: u32::MAX,
                output: Err(RuntimeError::InternalInvariantViolation(format!(
                    "task join error: {join_error}"
                ))),
                events: Vec::new(),
            },
        })
        .collect();
    settled.sort_by_key(|s| s.ordinal);
    settled
}

/// Flush one settled task's buffered events, honoring drop semantics
pub(crate) async fn flush_task_events(
    queue: &EventQueue,
    events: Vec<(EventScope, EventKind)>,
    debug_payloads: bool,
) {
    for (scope, kind) in events {
        let kind = match kind {
            EventKind::NodeRetrying {
                node_id,
                task_id,
                error,
            } if !debug_payloads => EventKind::NodeRetrying {
                node_id,
                task_id,
                error: crate::error::ErrorInfo {
                    kind: error.kind,
                    detail: None,
                },
            },
            other => other,
        };
        if kind.is_droppable() {
            queue.emit_droppable_now(scope, kind);
        } else {
            queue.emit(scope, kind).await;
        }
    }
}
