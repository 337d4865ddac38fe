//! Thread state ↔ checkpoint conversion
//!
//! Encoding walks channels in ascending id order so codec failures always
//! report the smallest offending channel (then the smallest frontier
//! ordinal). Restoration validates deterministically, in this order:
//!
//! 1. schema/graph version digests match the compiled artifacts;
//! 2. every persisted channel decodes (smallest channel id first; task-local
//!    entries by smallest channel id, then smallest frontier ordinal);
//! 3. structure is intact: join-barrier keys equal the compiled join ids,
//!    fingerprints are 32 bytes and match recomputation from the persisted
//!    overlays, the interruption binding recomputes, frontier nodes exist.
//!
//! Untracked channels are reset to their initial values; restored
//! checkpointed channels take precedence.

use crate::builder::CompiledGraph;
use crate::engine::types::{Task, ThreadState};
use crate::error::{Result, RuntimeError};
use crate::fingerprint;
use crate::store::{GlobalStore, InitialCache};
use lockstep_checkpoint::channels::{ChannelScope, Persistence};
use lockstep_checkpoint::{
    checkpoint_id, Checkpoint, CheckpointError, FrontierTask, FINGERPRINT_LEN,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Encode the current thread state as a checkpoint
pub(crate) fn encode(
    graph: &CompiledGraph,
    thread_id: &str,
    state: &ThreadState,
) -> Result<Checkpoint> {
    let registry = &graph.schema.registry;

    // global data: every checkpointed global channel, ascending id order
    let mut global_data = BTreeMap::new();
    for spec in registry.sorted_specs() {
        if spec.scope != ChannelScope::Global || spec.persistence != Persistence::Checkpointed {
            continue;
        }
        let value = state.global.get(&spec.id).ok_or_else(|| {
            RuntimeError::InternalInvariantViolation(format!(
                "global store has no entry for channel '{}'",
                spec.id
            ))
        })?;
        let codec = spec
            .codec
            .as_ref()
            .ok_or_else(|| CheckpointError::MissingCodec(spec.id.clone()))?;
        let bytes = codec.encode(value).map_err(|e| {
            CheckpointError::EncodeFailed {
                channel: spec.id.clone(),
                detail: e.to_string(),
            }
        })?;
        global_data.insert(spec.id.clone(), bytes);
    }

    // frontier overlays: channel-major walk so encode failures report the
    // smallest channel id first, then the smallest ordinal
    let mut encoded_overlays: Vec<BTreeMap<String, Vec<u8>>> =
        vec![BTreeMap::new(); state.frontier.len()];
    for spec in registry.sorted_specs() {
        if spec.scope != ChannelScope::TaskLocal {
            continue;
        }
        for task in &state.frontier {
            let Some(value) = task.task_local.get(&spec.id) else {
                continue;
            };
            let codec = spec
                .codec
                .as_ref()
                .ok_or_else(|| CheckpointError::MissingCodec(spec.id.clone()))?;
            let bytes = codec.encode(value).map_err(|e| {
                CheckpointError::EncodeFailed {
                    channel: spec.id.clone(),
                    detail: e.to_string(),
                }
            })?;
            encoded_overlays[task.ordinal as usize].insert(spec.id.clone(), bytes);
        }
    }

    let frontier = state
        .frontier
        .iter()
        .zip(encoded_overlays)
        .map(|(task, local_data)| FrontierTask {
            provenance: task.provenance,
            node_id: task.node_id.clone(),
            local_fingerprint: task.local_fingerprint.to_vec(),
            local_data,
        })
        .collect();

    let join_barriers = state
        .join_seen
        .iter()
        .map(|(id, seen)| (id.clone(), seen.iter().cloned().collect::<Vec<_>>()))
        .collect();

    Ok(Checkpoint {
        id: checkpoint_id(&state.run_id, state.step_index),
        thread_id: thread_id.to_string(),
        run_id: state.run_id,
        step_index: state.step_index,
        schema_version: graph.schema_version().to_string(),
        graph_version: graph.graph_version().to_string(),
        global_data,
        frontier,
        join_barriers,
        interruption: state.pending_interruption.clone(),
        channel_versions: state.channel_versions.clone(),
        versions_seen: state.versions_seen.clone(),
    })
}

/// Validate a checkpoint and rebuild the thread state it describes
pub(crate) fn restore(graph: &CompiledGraph, cp: &Checkpoint) -> Result<ThreadState> {
    let registry = &graph.schema.registry;

    // 1. version gates
    if cp.schema_version != graph.schema_version() {
        return Err(CheckpointError::VersionMismatch {
            field: "schema_version",
            stored: cp.schema_version.clone(),
            current: graph.schema_version().to_string(),
        }
        .into());
    }
    if cp.graph_version != graph.graph_version() {
        return Err(CheckpointError::VersionMismatch {
            field: "graph_version",
            stored: cp.graph_version.clone(),
            current: graph.graph_version().to_string(),
        }
        .into());
    }

    // 2a. global channels: decode checkpointed, reset untracked to initial
    let initial = InitialCache::build(registry);
    let mut global: BTreeMap<String, Value> = BTreeMap::new();
    for spec in registry.sorted_specs() {
        if spec.scope != ChannelScope::Global {
            continue;
        }
        let value = match spec.persistence {
            Persistence::Checkpointed => {
                let bytes = cp.global_data.get(&spec.id).ok_or_else(|| {
                    CheckpointError::Corrupt(format!(
                        "missing global data for channel '{}'",
                        spec.id
                    ))
                })?;
                let codec = spec
                    .codec
                    .as_ref()
                    .ok_or_else(|| CheckpointError::MissingCodec(spec.id.clone()))?;
                codec.decode(bytes).map_err(|e| {
                    CheckpointError::DecodeFailed {
                        channel: spec.id.clone(),
                        detail: e.to_string(),
                    }
                })?
            }
            Persistence::Untracked => initial
                .get(&spec.id)
                .cloned()
                .unwrap_or(Value::Null),
        };
        global.insert(spec.id.clone(), value);
    }
    for key in cp.global_data.keys() {
        let known = registry
            .spec(key)
            .map(|s| s.scope == ChannelScope::Global && s.persistence == Persistence::Checkpointed)
            .unwrap_or(false);
        if !known {
            return Err(
                CheckpointError::Corrupt(format!("unexpected global data key '{key}'")).into(),
            );
        }
    }

    // 3a. fingerprint lengths before any overlay decode
    for task in &cp.frontier {
        if task.local_fingerprint.len() != FINGERPRINT_LEN {
            return Err(RuntimeError::InvalidTaskLocalFingerprintLength(
                task.local_fingerprint.len(),
            ));
        }
    }

    // 2b. task-local decode: smallest channel id, then smallest ordinal
    let mut overlay_channels: BTreeSet<&str> = BTreeSet::new();
    for task in &cp.frontier {
        overlay_channels.extend(task.local_data.keys().map(String::as_str));
    }
    let mut decoded_overlays: Vec<BTreeMap<String, Value>> =
        vec![BTreeMap::new(); cp.frontier.len()];
    for channel in overlay_channels {
        let spec = registry.spec(channel).map_err(|_| {
            CheckpointError::Corrupt(format!(
                "frontier overlay references unknown channel '{channel}'"
            ))
        })?;
        if spec.scope != ChannelScope::TaskLocal {
            return Err(CheckpointError::Corrupt(format!(
                "frontier overlay holds global channel '{channel}'"
            ))
            .into());
        }
        let codec = spec
            .codec
            .as_ref()
            .ok_or_else(|| CheckpointError::MissingCodec(channel.to_string()))?;
        for (ordinal, task) in cp.frontier.iter().enumerate() {
            if let Some(bytes) = task.local_data.get(channel) {
                let value = codec.decode(bytes).map_err(|e| {
                    CheckpointError::DecodeFailed {
                        channel: channel.to_string(),
                        detail: format!("frontier ordinal {ordinal}: {e}"),
                    }
                })?;
                decoded_overlays[ordinal].insert(channel.to_string(), value);
            }
        }
    }

    // 3b. structural checks: fingerprints, join keys, interruption binding
    let mut frontier = Vec::with_capacity(cp.frontier.len());
    for (ordinal, (task, overlay)) in cp.frontier.iter().zip(decoded_overlays).enumerate() {
        let recomputed = fingerprint::fingerprint_encoded(&task.local_data);
        if recomputed.as_slice() != task.local_fingerprint.as_slice() {
            return Err(CheckpointError::Corrupt(format!(
                "local fingerprint mismatch at frontier ordinal {ordinal}"
            ))
            .into());
        }
        if !graph.has_node(&task.node_id) {
            return Err(CheckpointError::Corrupt(format!(
                "frontier references unknown node '{}'",
                task.node_id
            ))
            .into());
        }
        let mut fingerprint_bytes = [0u8; FINGERPRINT_LEN];
        fingerprint_bytes.copy_from_slice(&task.local_fingerprint);
        frontier.push(Task {
            id: fingerprint::task_id(
                &cp.run_id,
                cp.step_index,
                ordinal as u32,
                &task.node_id,
                &fingerprint_bytes,
            ),
            ordinal: ordinal as u32,
            node_id: task.node_id.clone(),
            task_local: overlay,
            local_fingerprint: fingerprint_bytes,
            provenance: task.provenance,
        });
    }

    let compiled_joins: BTreeSet<&str> = graph.join_edges().iter().map(|j| j.id.as_str()).collect();
    let stored_joins: BTreeSet<&str> = cp.join_barriers.keys().map(String::as_str).collect();
    if compiled_joins != stored_joins {
        return Err(CheckpointError::Corrupt(
            "join barrier keys do not match the compiled join edges".to_string(),
        )
        .into());
    }
    let mut join_seen = BTreeMap::new();
    for join in graph.join_edges() {
        let seen_list = &cp.join_barriers[&join.id];
        let mut seen = BTreeSet::new();
        for parent in seen_list {
            if !join.parents.contains(parent) {
                return Err(CheckpointError::Corrupt(format!(
                    "join '{}' has seen-parent '{}' outside its parent set",
                    join.id, parent
                ))
                .into());
            }
            seen.insert(parent.clone());
        }
        join_seen.insert(join.id.clone(), seen);
    }

    if let Some(interruption) = &cp.interruption {
        let recomputed = fingerprint::interrupt_id(&interruption.winning_task_id);
        if recomputed != interruption.interrupt_id {
            return Err(CheckpointError::Corrupt(
                "interruption binding does not recompute".to_string(),
            )
            .into());
        }
    }

    Ok(ThreadState {
        run_id: cp.run_id,
        step_index: cp.step_index,
        global: GlobalStore::from_map(global),
        frontier,
        join_seen,
        pending_interruption: cp.interruption.clone(),
        latest_checkpoint_id: Some(cp.id.clone()),
        channel_versions: cp.channel_versions.clone(),
        versions_seen: cp.versions_seen.clone(),
        initial,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::graph::{NodeFuture, NodeInput, NodeOutput};
    use lockstep_checkpoint::channels::{ChannelSpec, Schema, SchemaRegistry};
    use lockstep_checkpoint::codec::JsonCodec;
    use lockstep_checkpoint::reducer;
    use lockstep_checkpoint::TaskProvenance;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    fn noop() -> impl Fn(NodeInput) -> NodeFuture + Send + Sync {
        |_input: NodeInput| -> NodeFuture { Box::pin(async { Ok(NodeOutput::new().end()) }) }
    }

    fn graph() -> Arc<crate::builder::CompiledGraph> {
        let schema = Schema::new(
            SchemaRegistry::build(vec![
                ChannelSpec::global("counter", "int", || json!(0), reducer::sum())
                    .with_codec(JsonCodec::shared()),
                ChannelSpec::global(
                    "scratch",
                    "any",
                    || json!(null),
                    reducer::last_write_wins(),
                )
                .with_persistence(lockstep_checkpoint::Persistence::Untracked),
                ChannelSpec::task_local("item", "string", || json!(""), reducer::last_write_wins())
                    .with_codec(JsonCodec::shared()),
            ])
            .unwrap(),
        );
        let mut b = GraphBuilder::new(schema);
        b.add_node("worker", noop());
        b.add_node("gate", noop());
        b.add_start("worker");
        b.add_join(["worker"], "gate");
        b.compile().unwrap()
    }

    fn state_with_frontier(graph: &crate::builder::CompiledGraph) -> ThreadState {
        let mut state = ThreadState::fresh(graph, Uuid::from_u128(9));
        state.step_index = 2;
        state.frontier = vec![Task::new(
            graph,
            &state.run_id,
            2,
            0,
            "worker".to_string(),
            BTreeMap::from([("item".to_string(), json!("apple"))]),
            TaskProvenance::Spawn,
        )
        .unwrap()];
        state
    }

    #[test]
    fn test_encode_restore_round_trip() {
        let graph = graph();
        let state = state_with_frontier(&graph);
        let cp = encode(&graph, "t-1", &state).unwrap();

        assert_eq!(cp.step_index, 2);
        // untracked channels never persist
        assert!(cp.global_data.contains_key("counter"));
        assert!(!cp.global_data.contains_key("scratch"));

        let restored = restore(&graph, &cp).unwrap();
        assert_eq!(restored.step_index, 2);
        assert_eq!(restored.frontier.len(), 1);
        assert_eq!(restored.frontier[0].task_local["item"], json!("apple"));
        // task ids recompute identically
        assert_eq!(restored.frontier[0].id, state.frontier[0].id);
        // untracked resets to initial
        assert_eq!(restored.global.get("scratch"), Some(&json!(null)));
    }

    #[test]
    fn test_restore_rejects_version_mismatch() {
        let graph = graph();
        let state = state_with_frontier(&graph);
        let mut cp = encode(&graph, "t-1", &state).unwrap();
        cp.schema_version = "0".repeat(64);
        assert!(matches!(
            restore(&graph, &cp).unwrap_err(),
            RuntimeError::Checkpoint(CheckpointError::VersionMismatch { field, .. })
                if field == "schema_version"
        ));
    }

    #[test]
    fn test_restore_rejects_bad_fingerprint_length() {
        let graph = graph();
        let state = state_with_frontier(&graph);
        let mut cp = encode(&graph, "t-1", &state).unwrap();
        cp.frontier[0].local_fingerprint.truncate(16);
        assert!(matches!(
            restore(&graph, &cp).unwrap_err(),
            RuntimeError::InvalidTaskLocalFingerprintLength(16)
        ));
    }

    #[test]
    fn test_restore_rejects_fingerprint_mismatch() {
        let graph = graph();
        let state = state_with_frontier(&graph);
        let mut cp = encode(&graph, "t-1", &state).unwrap();
        cp.frontier[0]
            .local_data
            .insert("item".to_string(), b"\"tampered\"".to_vec());
        assert!(matches!(
            restore(&graph, &cp).unwrap_err(),
            RuntimeError::Checkpoint(CheckpointError::Corrupt(msg)) if msg.contains("fingerprint")
        ));
    }

    #[test]
    fn test_restore_rejects_join_key_drift() {
        let graph = graph();
        let state = state_with_frontier(&graph);
        let mut cp = encode(&graph, "t-1", &state).unwrap();
        cp.join_barriers.remove("join:worker:gate");
        assert!(matches!(
            restore(&graph, &cp).unwrap_err(),
            RuntimeError::Checkpoint(CheckpointError::Corrupt(msg)) if msg.contains("join")
        ));
    }

    #[test]
    fn test_restore_rejects_decode_failure() {
        let graph = graph();
        let state = state_with_frontier(&graph);
        let mut cp = encode(&graph, "t-1", &state).unwrap();
        cp.global_data.insert("counter".to_string(), b"{broken".to_vec());
        assert!(matches!(
            restore(&graph, &cp).unwrap_err(),
            RuntimeError::Checkpoint(CheckpointError::DecodeFailed { channel, .. })
                if channel == "counter"
        ));
    }

    #[test]
    fn test_restore_rejects_missing_global_entry() {
        let graph = graph();
        let state = state_with_frontier(&graph);
        let mut cp = encode(&graph, "t-1", &state).unwrap();
        cp.global_data.remove("counter");
        assert!(matches!(
            restore(&graph, &cp).unwrap_err(),
            RuntimeError::Checkpoint(CheckpointError::Corrupt(_))
        ));
    }

    #[test]
    fn test_restore_rejects_bad_interruption_binding() {
        let graph = graph();
        let mut state = state_with_frontier(&graph);
        state.pending_interruption = Some(lockstep_checkpoint::PendingInterruption {
            interrupt_id: "f".repeat(64),
            payload: json!("p"),
            winning_task_id: "a".repeat(64),
            step_index: 1,
        });
        let cp = encode(&graph, "t-1", &state).unwrap();
        assert!(matches!(
            restore(&graph, &cp).unwrap_err(),
            RuntimeError::Checkpoint(CheckpointError::Corrupt(msg)) if msg.contains("binding")
        ));
    }
}
