//! The superstep loop
//!
//! Drives one thread through its run: seed the frontier, execute it, plan
//! and apply the commit, emit events, checkpoint per policy, and derive the
//! next frontier — until the frontier empties (finished), an interrupt wins
//! (interrupted), the step bound is hit (out of steps), cancellation is
//! observed (cancelled), or a failure aborts the step (error).
//!
//! Atomicity: every step builds a candidate [`ThreadState`] and swaps it in
//! only after the commit plan succeeds *and* any required checkpoint save
//! succeeds. A failed step leaves the committed state, frontier, join
//! barriers, and checkpoint history untouched.

use crate::builder::CompiledGraph;
use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::engine::checkpoint_io;
use crate::engine::commit::{plan_commit, seed_start_frontier, validate_and_fold, WriteBatch};
use crate::engine::executor::{execute_frontier, flush_task_events, ExecutorEnv, SettledTask};
use crate::engine::types::{CheckpointPolicy, RunOptions, RunOutcome, ThreadState};
use crate::error::{Result, RuntimeError};
use crate::events::{EventKind, EventQueue, EventScope};
use crate::graph::{NodeOutput, OutputProjection};
use crate::model::{ModelClientRef, ToolRegistryRef};
use crate::store::GlobalStore;
use lockstep_checkpoint::channels::ChannelScope;
use lockstep_checkpoint::{CheckpointError, CheckpointStore, PendingInterruption};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// One thread-scoped engine invocation (run, resume, or external writes)
pub(crate) struct StepLoop {
    pub graph: Arc<CompiledGraph>,
    pub store: Option<Arc<dyn CheckpointStore>>,
    pub model: Option<ModelClientRef>,
    pub tools: Option<ToolRegistryRef>,
    pub clock: Arc<dyn Clock>,
    pub queue: Arc<EventQueue>,
    pub cancel: CancelToken,
    pub options: RunOptions,
    pub thread_id: String,
}

enum StepSignal {
    Committed { interrupted: Option<(String, Value)> },
    Cancelled,
}

impl StepLoop {
    fn env(&self) -> ExecutorEnv {
        ExecutorEnv {
            graph: self.graph.clone(),
            queue: self.queue.clone(),
            cancel: self.cancel.clone(),
            clock: self.clock.clone(),
            model: self.model.clone(),
            tools: self.tools.clone(),
        }
    }

    /// Fresh run: seed state, apply input writes, drive to termination
    pub async fn run_fresh(
        &self,
        slot: &mut Option<ThreadState>,
        input: Value,
    ) -> Result<RunOutcome> {
        self.options.validate()?;
        if let Some(existing) = slot.as_ref() {
            if existing.pending_interruption.is_some() {
                return Err(RuntimeError::InterruptPending);
            }
        }
        let run_id = self.options.run_id.unwrap_or_else(Uuid::new_v4);
        let mut state = ThreadState::fresh(&self.graph, run_id);
        self.queue.set_run_id(run_id);
        tracing::debug!(thread_id = %self.thread_id, %run_id, "fresh run starting");

        // input writes: a synthetic step before step 0, validated exactly
        // like a commit; global channels only, no step advance, no events
        let writes = self.graph.schema.input_writes(&input, &self.options.context)?;
        if !writes.is_empty() {
            let batches = [WriteBatch { writes: &writes }];
            let (new_global, written) = validate_and_fold(
                &self.graph.schema.registry,
                &state.global.snapshot(),
                &batches,
            )?;
            state.global = GlobalStore::from_map(new_global);
            for channel in written {
                *state.channel_versions.entry(channel).or_insert(0) += 1;
            }
        }

        let outcome = self.drive(&mut state, None, true).await;
        *slot = Some(state);
        outcome
    }

    /// Resume from the latest checkpoint with an interrupt payload
    pub async fn run_resume(
        &self,
        slot: &mut Option<ThreadState>,
        interrupt_id: &str,
        payload: Value,
    ) -> Result<RunOutcome> {
        self.options.validate()?;
        let store = self
            .store
            .as_ref()
            .ok_or(RuntimeError::Checkpoint(CheckpointError::StoreMissing))?;
        let checkpoint = store
            .load_latest(&self.thread_id)
            .await?
            .ok_or_else(|| RuntimeError::NoCheckpointToResume(self.thread_id.clone()))?;
        let mut state = checkpoint_io::restore(&self.graph, &checkpoint)?;
        self.queue.set_run_id(state.run_id);

        let pending = state
            .pending_interruption
            .clone()
            .ok_or_else(|| RuntimeError::NoInterruptToResume(self.thread_id.clone()))?;
        if pending.interrupt_id != interrupt_id {
            return Err(RuntimeError::ResumeInterruptMismatch {
                expected: pending.interrupt_id,
                provided: interrupt_id.to_string(),
            });
        }
        tracing::debug!(
            thread_id = %self.thread_id,
            step_index = state.step_index,
            "resuming from checkpoint"
        );

        let outcome = self.drive(&mut state, Some(payload), false).await;
        *slot = Some(state);
        outcome
    }

    /// Apply external writes as a synthetic committed step
    pub async fn run_external(
        &self,
        slot: &mut Option<ThreadState>,
        writes: Vec<(String, Value)>,
    ) -> Result<RunOutcome> {
        self.options.validate()?;

        let mut state = match slot.take() {
            Some(state) => state,
            None => match &self.store {
                Some(store) => match store.load_latest(&self.thread_id).await? {
                    Some(checkpoint) => checkpoint_io::restore(&self.graph, &checkpoint)?,
                    None => ThreadState::fresh(
                        &self.graph,
                        self.options.run_id.unwrap_or_else(Uuid::new_v4),
                    ),
                },
                None => ThreadState::fresh(
                    &self.graph,
                    self.options.run_id.unwrap_or_else(Uuid::new_v4),
                ),
            },
        };

        self.queue.set_run_id(state.run_id);
        if state.pending_interruption.is_some() {
            *slot = Some(state);
            return Err(RuntimeError::InterruptPending);
        }

        let batches = [WriteBatch { writes: &writes }];
        let folded = validate_and_fold(
            &self.graph.schema.registry,
            &state.global.snapshot(),
            &batches,
        );
        let (new_global, written) = match folded {
            Ok(result) => result,
            Err(e) => {
                *slot = Some(state);
                return Err(e);
            }
        };

        let mut candidate = state.clone();
        candidate.global = GlobalStore::from_map(new_global);
        candidate.step_index = state.step_index + 1;
        for channel in &written {
            *candidate.channel_versions.entry(channel.clone()).or_insert(0) += 1;
        }

        // external-write commits checkpoint unconditionally when a store is
        // configured, even under a Disabled policy
        let mut saved_checkpoint_id = None;
        if let Some(store) = &self.store {
            let checkpoint = match checkpoint_io::encode(&self.graph, &self.thread_id, &candidate) {
                Ok(cp) => cp,
                Err(e) => {
                    *slot = Some(state);
                    return Err(e);
                }
            };
            candidate.latest_checkpoint_id = Some(checkpoint.id.clone());
            saved_checkpoint_id = Some(checkpoint.id.clone());
            if let Err(e) = store.save(checkpoint).await {
                *slot = Some(state);
                return Err(e.into());
            }
        }

        let committed_step = state.step_index;
        state = candidate;

        self.queue
            .emit(
                EventScope::step(committed_step),
                EventKind::StepStarted {
                    step_index: committed_step,
                    frontier_count: 0,
                },
            )
            .await;
        self.emit_writes_applied(committed_step, &written).await;
        if let Some(checkpoint_id) = saved_checkpoint_id {
            self.queue
                .emit(
                    EventScope::step(committed_step),
                    EventKind::CheckpointSaved { checkpoint_id },
                )
                .await;
        }
        self.queue
            .emit(
                EventScope::step(committed_step),
                EventKind::StepFinished {
                    step_index: committed_step,
                    next_frontier_count: state.frontier.len(),
                },
            )
            .await;

        let output = self.project_output(&state)?;
        *slot = Some(state);
        Ok(RunOutcome::Finished(output))
    }

    /// The superstep loop proper
    ///
    /// `seed_start` is true only for fresh runs; a resumed thread whose
    /// frontier is empty has nothing left to execute.
    async fn drive(
        &self,
        state: &mut ThreadState,
        mut resume: Option<Value>,
        seed_start: bool,
    ) -> Result<RunOutcome> {
        let mut steps_executed: u32 = 0;
        loop {
            // between-steps cancellation point
            if self.cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            if state.frontier.is_empty() && seed_start && state.step_index == 0 {
                seed_start_frontier(&self.graph, state)?;
            }
            if state.frontier.is_empty() {
                return Ok(RunOutcome::Finished(self.project_output(state)?));
            }
            if steps_executed >= self.options.max_steps {
                return Ok(RunOutcome::OutOfSteps(state.step_index));
            }

            match self.execute_step(state, resume.take()).await? {
                StepSignal::Cancelled => return Ok(RunOutcome::Cancelled),
                StepSignal::Committed {
                    interrupted: Some((interrupt_id, payload)),
                } => {
                    return Ok(RunOutcome::Interrupted {
                        interrupt_id,
                        payload,
                    })
                }
                StepSignal::Committed { interrupted: None } => {
                    steps_executed += 1;
                }
            }
        }
    }

    /// Execute and commit one superstep
    async fn execute_step(
        &self,
        state: &mut ThreadState,
        resume: Option<Value>,
    ) -> Result<StepSignal> {
        let step_index = state.step_index;
        self.queue
            .emit(
                EventScope::step(step_index),
                EventKind::StepStarted {
                    step_index,
                    frontier_count: state.frontier.len(),
                },
            )
            .await;

        let settled = execute_frontier(&self.env(), state, &self.options, resume).await;

        // during-step cancellation: taskFailed(cancelled) per frontier task
        // in ordinal order, then nothing but the terminal event
        let cancelled = self.cancel.is_cancelled()
            || settled
                .iter()
                .any(|s| matches!(&s.output, Err(e) if e.is_cancellation()));
        if cancelled {
            for task in &state.frontier {
                self.queue
                    .emit(
                        EventScope::task(step_index, task.ordinal, 0),
                        EventKind::TaskFailed {
                            node_id: task.node_id.clone(),
                            task_id: task.id.clone(),
                            error: RuntimeError::Cancelled.to_info(self.options.debug_payloads),
                        },
                    )
                    .await;
            }
            return Ok(StepSignal::Cancelled);
        }

        // flush buffered per-task events in ordinal order
        for task in &settled {
            flush_task_events(&self.queue, task.events.clone(), self.options.debug_payloads).await;
        }

        // non-cancellation failures: emit in ordinal order, fail on smallest
        let failures: Vec<&SettledTask> = settled
            .iter()
            .filter(|s| s.output.is_err())
            .collect();
        if !failures.is_empty() {
            let mut first_error: Option<RuntimeError> = None;
            for failed in &failures {
                let error = failed.output.as_ref().expect_err("filtered to failures");
                let Some(task) = state.frontier.get(failed.ordinal as usize) else {
                    if first_error.is_none() {
                        first_error = Some(RuntimeError::InternalInvariantViolation(
                            error.to_string(),
                        ));
                    }
                    continue;
                };
                self.queue
                    .emit(
                        EventScope::task(step_index, task.ordinal, 0),
                        EventKind::TaskFailed {
                            node_id: task.node_id.clone(),
                            task_id: task.id.clone(),
                            error: error.to_info(self.options.debug_payloads),
                        },
                    )
                    .await;
                if first_error.is_none() {
                    first_error = Some(RuntimeError::TaskFailed {
                        node: task.node_id.clone(),
                        detail: error.to_string(),
                    });
                }
            }
            return Err(first_error.expect("at least one failure"));
        }

        // plan the commit from settled outputs (ordinal order)
        let outputs: Vec<(crate::engine::types::Task, NodeOutput)> = state
            .frontier
            .iter()
            .cloned()
            .zip(settled.into_iter().map(|s| s.output.expect("no failures")))
            .collect();
        let run_id = state.run_id;
        let plan = plan_commit(&self.graph, state, &run_id, &outputs)?;

        // a winning interrupt requires a checkpoint store
        if plan.winning_interrupt.is_some() && self.store.is_none() {
            return Err(RuntimeError::Checkpoint(CheckpointError::StoreMissing));
        }

        // assemble the candidate state
        let mut candidate = state.clone();
        candidate.global = GlobalStore::from_map(plan.new_global);
        candidate.frontier = plan.next_frontier;
        candidate.join_seen = plan.join_seen_after;
        candidate.channel_versions = plan.channel_versions_after;
        candidate.versions_seen = plan.versions_seen_after;
        candidate.step_index = step_index + 1;
        candidate.pending_interruption =
            plan.winning_interrupt.as_ref().map(|w| PendingInterruption {
                interrupt_id: w.interrupt_id.clone(),
                payload: w.payload.clone(),
                winning_task_id: w.task_id.clone(),
                step_index,
            });

        // checkpoint before declaring the step committed
        let should_checkpoint = match self.options.checkpoint_policy {
            CheckpointPolicy::EveryStep => true,
            CheckpointPolicy::Every(n) => candidate.step_index % n == 0,
            CheckpointPolicy::OnInterrupt => candidate.pending_interruption.is_some(),
            CheckpointPolicy::Disabled => false,
        } || (candidate.pending_interruption.is_some() && self.store.is_some());

        let mut saved_checkpoint_id = None;
        if should_checkpoint {
            let store = self
                .store
                .as_ref()
                .ok_or(RuntimeError::Checkpoint(CheckpointError::StoreMissing))?;
            let checkpoint = checkpoint_io::encode(&self.graph, &self.thread_id, &candidate)?;
            candidate.latest_checkpoint_id = Some(checkpoint.id.clone());
            saved_checkpoint_id = Some(checkpoint.id.clone());
            // save failure aborts the step: candidate is discarded wholesale
            store.save(checkpoint).await?;
        }

        // the step is now committed
        let interrupted = plan
            .winning_interrupt
            .map(|w| (w.interrupt_id, w.payload));
        let next_frontier_count = candidate.frontier.len();
        *state = candidate;

        self.emit_writes_applied(step_index, &plan.written_channels)
            .await;
        if let Some(checkpoint_id) = saved_checkpoint_id {
            self.queue
                .emit(
                    EventScope::step(step_index),
                    EventKind::CheckpointSaved { checkpoint_id },
                )
                .await;
        }
        let dropped = self.queue.take_dropped_count();
        if dropped > 0 {
            self.queue
                .emit(
                    EventScope::step(step_index),
                    EventKind::StreamBackpressure { dropped },
                )
                .await;
        }
        self.queue
            .emit(
                EventScope::step(step_index),
                EventKind::StepFinished {
                    step_index,
                    next_frontier_count,
                },
            )
            .await;

        Ok(StepSignal::Committed { interrupted })
    }

    async fn emit_writes_applied(&self, step_index: u32, written: &[String]) {
        for channel in written {
            let debug = self
                .options
                .debug_payloads
                .then(|| serde_json::json!({ "channel": channel }));
            self.queue
                .emit(
                    EventScope::step(step_index),
                    EventKind::WriteApplied {
                        channel: channel.clone(),
                        debug,
                    },
                )
                .await;
        }
    }

    /// Project the finished output per the run's effective projection
    fn project_output(&self, state: &ThreadState) -> Result<Value> {
        let projection = self
            .options
            .output_projection_override
            .as_ref()
            .unwrap_or_else(|| self.graph.output_projection());
        let mut out = serde_json::Map::new();
        match projection {
            OutputProjection::FullStore => {
                for (channel, value) in state.global.iter() {
                    out.insert(channel.clone(), value.clone());
                }
            }
            OutputProjection::Channels(ids) => {
                for id in ids {
                    let spec = self.graph.schema.registry.spec(id)?;
                    if spec.scope != ChannelScope::Global {
                        return Err(RuntimeError::ScopeMismatch {
                            channel: id.clone(),
                            detail: "output projection channels must be global".to_string(),
                        });
                    }
                    let value = state.global.get(id).ok_or_else(|| {
                        RuntimeError::InternalInvariantViolation(format!(
                            "global store has no entry for channel '{id}'"
                        ))
                    })?;
                    out.insert(id.clone(), value.clone());
                }
            }
        }
        Ok(Value::Object(out))
    }
}
