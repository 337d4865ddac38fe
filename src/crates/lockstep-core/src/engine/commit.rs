//! Deterministic commit planning
//!
//! After every frontier task settles successfully, the engine plans the
//! commit as pure data before touching any state:
//!
//! 1. validate all writes (precedence: unknown channel > task-local write in
//!    a disallowed context > type mismatch > update-policy violation >
//!    reducer failure; within a check, smallest task ordinal then smallest
//!    channel id wins);
//! 2. resolve routing — routers run synchronously against fresh-read views
//!    that see only the emitting task's writes;
//! 3. fold the merged write set per channel (contributors ascending by task
//!    ordinal, intra-task emission order preserved) into a full replacement
//!    global store;
//! 4. advance join barriers and collect fired targets;
//! 5. order the next frontier — graph-seeds first (deduplicated; a join fire
//!    upgrades an existing graph-seed so the bypass survives), then
//!    spawn-seeds in emission order (never deduplicated);
//! 6. filter graph-seeds through `runWhen` triggers against the post-commit
//!    channel versions (join-seeds bypass);
//! 7. select the winning interrupt (smallest task ordinal).
//!
//! The caller applies the plan atomically — or discards it wholesale if the
//! checkpoint save fails.

use crate::builder::CompiledGraph;
use crate::engine::types::{Task, ThreadState};
use crate::error::{Result, RuntimeError};
use crate::fingerprint;
use crate::graph::{Next, NodeId, NodeOutput, RunWhen};
use crate::store::fresh_view_for_task;
use lockstep_checkpoint::channels::{ChannelScope, SchemaRegistry, UpdatePolicy};
use lockstep_checkpoint::{value, CheckpointError, TaskProvenance};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

/// One contributor to a fold: a task's ordered writes
///
/// Batches must be supplied in ascending task-ordinal order; the fold and
/// every validation pass rely on that order.
pub(crate) struct WriteBatch<'a> {
    pub writes: &'a [(String, Value)],
}

/// Validate a batch set and fold it over the current global map
///
/// Shared by regular commits, input writes, and external writes; the latter
/// two pass a single synthetic batch. Returns the replacement global map and
/// the ascending list of channels that received at least one write.
pub(crate) fn validate_and_fold(
    registry: &SchemaRegistry,
    current: &BTreeMap<String, Value>,
    batches: &[WriteBatch<'_>],
) -> Result<(BTreeMap<String, Value>, Vec<String>)> {
    // precedence pass 1: unknown channels
    for batch in batches {
        let mut offender: Option<&str> = None;
        for (channel, _) in batch.writes {
            if !registry.contains(channel) && offender.map_or(true, |o| channel.as_str() < o) {
                offender = Some(channel);
            }
        }
        if let Some(channel) = offender {
            return Err(RuntimeError::UnknownChannelId(channel.to_string()));
        }
    }

    // precedence pass 2: task-local writes are never allowed here
    for batch in batches {
        let mut offender: Option<&str> = None;
        for (channel, _) in batch.writes {
            let spec = registry.spec(channel).expect("validated above");
            if spec.scope == ChannelScope::TaskLocal && offender.map_or(true, |o| channel.as_str() < o)
            {
                offender = Some(channel);
            }
        }
        if let Some(channel) = offender {
            return Err(RuntimeError::TaskLocalWriteNotAllowed(channel.to_string()));
        }
    }

    // precedence pass 3: type tags
    for batch in batches {
        let mut offender: Option<(&str, &Value)> = None;
        for (channel, update) in batch.writes {
            let spec = registry.spec(channel).expect("validated above");
            if !value::tag_matches(&spec.value_type, update)
                && offender.map_or(true, |(o, _)| channel.as_str() < o)
            {
                offender = Some((channel, update));
            }
        }
        if let Some((channel, update)) = offender {
            let spec = registry.spec(channel).expect("validated above");
            return Err(RuntimeError::ChannelTypeMismatch {
                channel: channel.to_string(),
                expected: spec.value_type.clone(),
                actual: value::type_tag(update).to_string(),
            });
        }
    }

    // precedence pass 4: update policy
    let mut global_single_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for batch in batches {
        let mut per_task: BTreeMap<&str, usize> = BTreeMap::new();
        for (channel, _) in batch.writes {
            let spec = registry.spec(channel).expect("validated above");
            if spec.update_policy == UpdatePolicy::Single {
                match spec.scope {
                    ChannelScope::Global => {
                        *global_single_counts.entry(channel.as_str()).or_default() += 1;
                    }
                    ChannelScope::TaskLocal => {
                        *per_task.entry(channel.as_str()).or_default() += 1;
                    }
                }
            }
        }
        if let Some((channel, count)) = per_task.iter().find(|(_, &c)| c > 1) {
            return Err(RuntimeError::UpdatePolicyViolation {
                channel: (*channel).to_string(),
                detail: format!("{count} writes within one task on a single-update channel"),
            });
        }
    }
    if let Some((channel, count)) = global_single_counts.iter().find(|(_, &c)| c > 1) {
        return Err(RuntimeError::UpdatePolicyViolation {
            channel: (*channel).to_string(),
            detail: format!("{count} writes in one step on a single-update channel"),
        });
    }

    // fold: channels ascending, contributors ascending by ordinal with
    // intra-batch emission order preserved
    let mut touched: BTreeSet<&str> = BTreeSet::new();
    for batch in batches {
        for (channel, _) in batch.writes {
            touched.insert(channel);
        }
    }

    let mut next = current.clone();
    let mut written = Vec::with_capacity(touched.len());
    for channel in touched {
        let spec = registry.spec(channel).expect("validated above");
        let mut acc = next.get(channel).cloned().unwrap_or(Value::Null);
        for batch in batches {
            for (write_channel, update) in batch.writes {
                if write_channel == channel {
                    acc = (spec.reducer)(&acc, update).map_err(|e| match e {
                        CheckpointError::InvalidMessagesUpdate(detail) => {
                            RuntimeError::InvalidMessagesUpdate {
                                channel: channel.to_string(),
                                detail,
                            }
                        }
                        other => RuntimeError::ReducerFailed {
                            channel: channel.to_string(),
                            detail: other.to_string(),
                        },
                    })?;
                }
            }
        }
        next.insert(channel.to_string(), acc);
        written.push(channel.to_string());
    }

    Ok((next, written))
}

/// Winning interrupt of a commit
#[derive(Debug, Clone)]
pub(crate) struct WinningInterrupt {
    pub task_ordinal: u32,
    pub task_id: String,
    pub interrupt_id: String,
    pub payload: Value,
}

/// Everything a commit changes, computed before anything is applied
pub(crate) struct CommitPlan {
    pub new_global: BTreeMap<String, Value>,
    pub written_channels: Vec<String>,
    pub next_frontier: Vec<Task>,
    pub join_seen_after: BTreeMap<String, BTreeSet<NodeId>>,
    pub winning_interrupt: Option<WinningInterrupt>,
    pub channel_versions_after: BTreeMap<String, u64>,
    pub versions_seen_after: BTreeMap<NodeId, BTreeMap<String, u64>>,
}

/// Plan the commit of one superstep from its settled task outputs
pub(crate) fn plan_commit(
    graph: &CompiledGraph,
    state: &ThreadState,
    run_id: &Uuid,
    outputs: &[(Task, NodeOutput)],
) -> Result<CommitPlan> {
    let registry = &graph.schema.registry;

    // writes validation + fold (precedence passes 1-5)
    let batches: Vec<WriteBatch<'_>> = outputs
        .iter()
        .map(|(_task, output)| WriteBatch {
            writes: &output.writes,
        })
        .collect();
    let pre_step = state.global.snapshot();
    // validation first so routing never observes an invalid write set
    let (new_global, written_channels) = validate_and_fold(registry, &pre_step, &batches)?;

    // spawn overlay validation (parent ordinal order, channel ascending)
    for (task, output) in outputs {
        for seed in &output.spawn {
            if !graph.has_node(&seed.node_id) {
                return Err(RuntimeError::UnknownNodeId(seed.node_id.clone()));
            }
            for (channel, update) in &seed.task_local {
                let spec = registry
                    .spec(channel)
                    .map_err(|_| RuntimeError::UnknownChannelId(channel.clone()))?;
                if spec.scope != ChannelScope::TaskLocal {
                    return Err(RuntimeError::ScopeMismatch {
                        channel: channel.clone(),
                        detail: format!(
                            "spawn overlay from task {} may only seed task-local channels",
                            task.ordinal
                        ),
                    });
                }
                if !value::tag_matches(&spec.value_type, update) {
                    return Err(RuntimeError::ChannelTypeMismatch {
                        channel: channel.clone(),
                        expected: spec.value_type.clone(),
                        actual: value::type_tag(update).to_string(),
                    });
                }
            }
        }
    }

    // routing: resolve each task's targets; routers see fresh views
    let mut resolved_targets: Vec<Vec<NodeId>> = Vec::with_capacity(outputs.len());
    for (task, output) in outputs {
        let targets = match &output.next {
            Next::End => Vec::new(),
            Next::Goto(ids) => {
                for id in ids {
                    if !graph.has_node(id) {
                        return Err(RuntimeError::UnknownNodeId(id.clone()));
                    }
                }
                ids.clone()
            }
            Next::UseGraphEdges => match graph.router_for(&task.node_id) {
                Some(router) => {
                    let view = fresh_view_for_task(
                        registry.clone(),
                        pre_step.clone(),
                        Arc::new(task.task_local.clone()),
                        state.initial.clone(),
                        &output.writes,
                    )?;
                    let decision = router(&view).map_err(|e| RuntimeError::RouterFailed {
                        node: task.node_id.clone(),
                        detail: e.to_string(),
                    })?;
                    match decision {
                        Next::End => Vec::new(),
                        Next::Goto(ids) => {
                            for id in &ids {
                                if !graph.has_node(id) {
                                    return Err(RuntimeError::UnknownNodeId(id.clone()));
                                }
                            }
                            ids
                        }
                        // routed nodes have no static edges (enforced at
                        // compile time); this degenerates to no successors
                        Next::UseGraphEdges => Vec::new(),
                    }
                }
                None => graph.static_edges_from(&task.node_id).to_vec(),
            },
        };
        resolved_targets.push(targets);
    }

    // join barriers: record completed parents, collect fires in edge order
    let completed: BTreeSet<&str> = outputs
        .iter()
        .map(|(task, _)| task.node_id.as_str())
        .collect();
    let mut join_seen_after = state.join_seen.clone();
    let mut fired_targets: Vec<NodeId> = Vec::new();
    for join in graph.join_edges() {
        let seen = join_seen_after
            .entry(join.id.clone())
            .or_default();
        for parent in &join.parents {
            if completed.contains(parent.as_str()) {
                seen.insert(parent.clone());
            }
        }
        if join.parents.iter().all(|p| seen.contains(p)) {
            seen.clear();
            fired_targets.push(join.target.clone());
        }
    }

    // post-commit channel versions: +1 per written global channel
    let mut channel_versions_after = state.channel_versions.clone();
    for channel in &written_channels {
        *channel_versions_after.entry(channel.clone()).or_insert(0) += 1;
    }

    // next frontier: graph-seeds (dedup, join upgrades) then spawn-seeds
    let mut graph_seeds: Vec<(NodeId, TaskProvenance)> = Vec::new();
    let mut seed_index: BTreeMap<NodeId, usize> = BTreeMap::new();
    for targets in &resolved_targets {
        for target in targets {
            if !seed_index.contains_key(target) {
                seed_index.insert(target.clone(), graph_seeds.len());
                graph_seeds.push((target.clone(), TaskProvenance::Graph));
            }
        }
    }
    for target in fired_targets {
        match seed_index.get(&target).copied() {
            Some(i) => graph_seeds[i].1 = TaskProvenance::Join,
            None => {
                seed_index.insert(target.clone(), graph_seeds.len());
                graph_seeds.push((target, TaskProvenance::Join));
            }
        }
    }

    // trigger filtering (join-seeds bypass) + observed-version updates
    let mut versions_seen_after = state.versions_seen.clone();
    let mut scheduled: Vec<(NodeId, TaskProvenance, BTreeMap<String, Value>)> = Vec::new();
    for (node_id, provenance) in graph_seeds {
        let decl = graph.node(&node_id)?;
        let fire = match (&decl.run_when, provenance) {
            (RunWhen::Always, _) => true,
            (_, TaskProvenance::Join) => true,
            (when, _) => trigger_fires(when, &channel_versions_after, state.versions_seen.get(&node_id)),
        };
        if !fire {
            tracing::debug!(node = %node_id, "graph-seed filtered by runWhen trigger");
            continue;
        }
        if !decl.run_when.is_default() {
            let observed = versions_seen_after.entry(node_id.clone()).or_default();
            for channel in decl.run_when.channels() {
                observed.insert(
                    channel.clone(),
                    channel_versions_after.get(channel).copied().unwrap_or(0),
                );
            }
        }
        scheduled.push((node_id, provenance, BTreeMap::new()));
    }
    for (_task, output) in outputs {
        for seed in &output.spawn {
            let decl = graph.node(&seed.node_id)?;
            if !decl.run_when.is_default() {
                let observed = versions_seen_after.entry(seed.node_id.clone()).or_default();
                for channel in decl.run_when.channels() {
                    observed.insert(
                        channel.clone(),
                        channel_versions_after.get(channel).copied().unwrap_or(0),
                    );
                }
            }
            scheduled.push((
                seed.node_id.clone(),
                TaskProvenance::Spawn,
                seed.task_local.clone(),
            ));
        }
    }

    let next_step_index = state.step_index + 1;
    let mut next_frontier = Vec::with_capacity(scheduled.len());
    for (ordinal, (node_id, provenance, task_local)) in scheduled.into_iter().enumerate() {
        next_frontier.push(Task::new(
            graph,
            run_id,
            next_step_index,
            ordinal as u32,
            node_id,
            task_local,
            provenance,
        )?);
    }

    // winning interrupt: smallest task ordinal
    let winning_interrupt = outputs
        .iter()
        .find(|(_, output)| output.interrupt.is_some())
        .map(|(task, output)| WinningInterrupt {
            task_ordinal: task.ordinal,
            task_id: task.id.clone(),
            interrupt_id: fingerprint::interrupt_id(&task.id),
            payload: output.interrupt.as_ref().expect("checked").payload.clone(),
        });

    Ok(CommitPlan {
        new_global,
        written_channels,
        next_frontier,
        join_seen_after,
        winning_interrupt,
        channel_versions_after,
        versions_seen_after,
    })
}

fn trigger_fires(
    when: &RunWhen,
    versions: &BTreeMap<String, u64>,
    observed: Option<&BTreeMap<String, u64>>,
) -> bool {
    // a node that never observed anything fires on first scheduling
    let Some(observed) = observed else {
        return true;
    };
    let advanced = |channel: &String| {
        versions.get(channel).copied().unwrap_or(0) > observed.get(channel).copied().unwrap_or(0)
    };
    match when {
        RunWhen::Always => true,
        RunWhen::AnyOf(channels) => channels.iter().any(advanced),
        RunWhen::AllOf(channels) => channels.iter().all(advanced),
    }
}

/// Seed the step-0 frontier from `graph.start`, honoring triggers
///
/// Scheduled nodes with non-default triggers record the channel versions
/// they observed, exactly as commit-time scheduling does.
pub(crate) fn seed_start_frontier(graph: &CompiledGraph, state: &mut ThreadState) -> Result<()> {
    let run_id = state.run_id;
    let mut tasks = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for node_id in graph.start() {
        if !seen.insert(node_id.clone()) {
            continue;
        }
        let decl = graph.node(node_id)?;
        let fire = match &decl.run_when {
            RunWhen::Always => true,
            when => trigger_fires(when, &state.channel_versions, state.versions_seen.get(node_id)),
        };
        if !fire {
            continue;
        }
        if !decl.run_when.is_default() {
            let observed = state.versions_seen.entry(node_id.clone()).or_default();
            for channel in decl.run_when.channels() {
                observed.insert(
                    channel.clone(),
                    state.channel_versions.get(channel).copied().unwrap_or(0),
                );
            }
        }
        tasks.push(Task::new(
            graph,
            &run_id,
            state.step_index,
            tasks.len() as u32,
            node_id.clone(),
            BTreeMap::new(),
            TaskProvenance::Graph,
        )?);
    }
    state.frontier = tasks;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockstep_checkpoint::channels::{ChannelSpec, SchemaRegistry};
    use lockstep_checkpoint::codec::JsonCodec;
    use lockstep_checkpoint::reducer;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::build(vec![
            ChannelSpec::global("counter", "int", || json!(0), reducer::sum())
                .with_codec(JsonCodec::shared()),
            ChannelSpec::global("log", "array", || json!([]), reducer::append())
                .with_codec(JsonCodec::shared()),
            ChannelSpec::global("slot", "any", || json!(null), reducer::last_write_wins())
                .with_update_policy(lockstep_checkpoint::UpdatePolicy::Single)
                .with_codec(JsonCodec::shared()),
            ChannelSpec::task_local("item", "string", || json!(""), reducer::last_write_wins())
                .with_codec(JsonCodec::shared()),
        ])
        .unwrap()
    }

    fn current(registry: &SchemaRegistry) -> BTreeMap<String, Value> {
        let initial = crate::store::InitialCache::build(registry);
        crate::store::GlobalStore::seed(registry, &initial)
            .snapshot()
            .as_ref()
            .clone()
    }

    #[test]
    fn test_fold_orders_by_ordinal_then_emission() {
        let registry = registry();
        let current = current(&registry);
        let w1 = [
            ("log".to_string(), json!(["b1-first"])),
            ("log".to_string(), json!(["b1-second"])),
        ];
        let w0 = [("log".to_string(), json!(["a0"]))];
        // batches arrive pre-sorted by ordinal
        let batches = [
            WriteBatch { writes: &w0 },
            WriteBatch { writes: &w1 },
        ];
        let (next, written) = validate_and_fold(&registry, &current, &batches).unwrap();
        assert_eq!(next["log"], json!(["a0", "b1-first", "b1-second"]));
        assert_eq!(written, vec!["log".to_string()]);
    }

    #[test]
    fn test_unknown_channel_beats_policy_violation() {
        let registry = registry();
        let current = current(&registry);
        let w0 = [
            ("slot".to_string(), json!(1)),
            ("slot".to_string(), json!(2)),
            ("ghost".to_string(), json!(0)),
        ];
        let batches = [WriteBatch { writes: &w0 }];
        assert!(matches!(
            validate_and_fold(&registry, &current, &batches).unwrap_err(),
            RuntimeError::UnknownChannelId(id) if id == "ghost"
        ));
    }

    #[test]
    fn test_task_local_write_beats_type_mismatch() {
        let registry = registry();
        let current = current(&registry);
        let w0 = [
            ("counter".to_string(), json!("not a number")),
            ("item".to_string(), json!("x")),
        ];
        let batches = [WriteBatch { writes: &w0 }];
        assert!(matches!(
            validate_and_fold(&registry, &current, &batches).unwrap_err(),
            RuntimeError::TaskLocalWriteNotAllowed(id) if id == "item"
        ));
    }

    #[test]
    fn test_single_policy_across_tasks() {
        let registry = registry();
        let current = current(&registry);
        let w0 = [("slot".to_string(), json!(1))];
        let w1 = [("slot".to_string(), json!(2))];
        let batches = [
            WriteBatch { writes: &w0 },
            WriteBatch { writes: &w1 },
        ];
        assert!(matches!(
            validate_and_fold(&registry, &current, &batches).unwrap_err(),
            RuntimeError::UpdatePolicyViolation { channel, .. } if channel == "slot"
        ));
    }

    #[test]
    fn test_reducer_error_surfaces_last() {
        let registry = SchemaRegistry::build(vec![ChannelSpec::global(
            "messages",
            "any",
            || json!([]),
            reducer::message_append(),
        )
        .with_codec(JsonCodec::shared())])
        .unwrap();
        let current = current(&registry);
        let w0 = [("messages".to_string(), json!([{"content": "no role"}]))];
        let batches = [WriteBatch { writes: &w0 }];
        assert!(matches!(
            validate_and_fold(&registry, &current, &batches).unwrap_err(),
            RuntimeError::InvalidMessagesUpdate { channel, .. } if channel == "messages"
        ));
    }

    #[test]
    fn test_empty_batches_no_op() {
        let registry = registry();
        let current = current(&registry);
        let (next, written) = validate_and_fold(&registry, &current, &[]).unwrap();
        assert_eq!(next, current);
        assert!(written.is_empty());
    }
}
