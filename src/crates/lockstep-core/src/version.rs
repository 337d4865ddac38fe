//! Canonical version digests
//!
//! Two digests gate checkpoint restoration:
//!
//! - the **schema version** (`HSV2`) covers every channel specification —
//!   id, scope, persistence, update policy, value type tag, codec id;
//! - the **graph version** (`HGV3`, or `HGV4` once any node declares a
//!   non-default trigger) covers the start set, node ids with retry-policy
//!   encodings, router sources, static edges, join edges, the output
//!   projection, and (HGV4) the trigger specifications.
//!
//! Both are lowercase SHA-256 hex over canonical big-endian, length-prefixed
//! byte strings, byte-identical across runs and processes for the same
//! declarations. Changing any node's retry policy or trigger changes the
//! graph digest.

use crate::graph::{JoinEdge, NodeId, OutputProjection, RunWhen};
use crate::retry::RetryPolicy;
use lockstep_checkpoint::channels::{ChannelScope, Persistence, SchemaRegistry, UpdatePolicy};
use lockstep_checkpoint::sha256_hex;

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn scope_byte(scope: ChannelScope) -> u8 {
    match scope {
        ChannelScope::Global => 0,
        ChannelScope::TaskLocal => 1,
    }
}

fn persistence_byte(p: Persistence) -> u8 {
    match p {
        Persistence::Checkpointed => 0,
        Persistence::Untracked => 1,
    }
}

fn policy_byte(p: UpdatePolicy) -> u8 {
    match p {
        UpdatePolicy::Single => 0,
        UpdatePolicy::Multi => 1,
    }
}

/// Schema version digest (`HSV2`)
pub fn schema_version(registry: &SchemaRegistry) -> String {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"HSV2");
    buf.push(b'C');
    put_u32(&mut buf, registry.len() as u32);
    for spec in registry.sorted_specs() {
        put_str(&mut buf, &spec.id);
        buf.push(scope_byte(spec.scope));
        buf.push(persistence_byte(spec.persistence));
        buf.push(policy_byte(spec.update_policy));
        put_str(&mut buf, &spec.value_type);
        put_str(&mut buf, spec.codec_id());
    }
    sha256_hex(&buf)
}

/// Structural inputs to the graph digest, assembled by the builder
pub(crate) struct GraphDigestInput<'a> {
    /// Start node ids (will be digested sorted)
    pub start: &'a [NodeId],
    /// `(node id, retry policy, trigger)` per declared node
    pub nodes: Vec<(&'a str, &'a RetryPolicy, &'a RunWhen)>,
    /// Router source node ids (will be digested sorted)
    pub router_sources: Vec<&'a str>,
    /// Static edges in insertion order
    pub static_edges: &'a [(NodeId, NodeId)],
    /// Join edges in insertion order (parents already ascending)
    pub join_edges: &'a [JoinEdge],
    /// Output projection (channel ids already sorted and de-duplicated)
    pub projection: &'a OutputProjection,
}

/// Graph version digest (`HGV3` / `HGV4`)
pub(crate) fn graph_version(input: &GraphDigestInput<'_>) -> String {
    let has_triggers = input.nodes.iter().any(|(_, _, w)| !w.is_default());
    let mut buf = Vec::new();
    buf.extend_from_slice(if has_triggers { b"HGV4" } else { b"HGV3" });

    buf.push(b'S');
    let mut start: Vec<&str> = input.start.iter().map(String::as_str).collect();
    start.sort_unstable();
    put_u32(&mut buf, start.len() as u32);
    for id in start {
        put_str(&mut buf, id);
    }

    buf.push(b'N');
    let mut nodes = input.nodes.clone();
    nodes.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
    put_u32(&mut buf, nodes.len() as u32);
    for (id, retry, _) in &nodes {
        put_str(&mut buf, id);
        buf.extend_from_slice(&retry.digest_bytes());
    }

    buf.push(b'R');
    let mut routers = input.router_sources.clone();
    routers.sort_unstable();
    put_u32(&mut buf, routers.len() as u32);
    for id in routers {
        put_str(&mut buf, id);
    }

    buf.push(b'E');
    put_u32(&mut buf, input.static_edges.len() as u32);
    for (from, to) in input.static_edges {
        put_str(&mut buf, from);
        put_str(&mut buf, to);
    }

    buf.push(b'J');
    put_u32(&mut buf, input.join_edges.len() as u32);
    for join in input.join_edges {
        put_u32(&mut buf, join.parents.len() as u32);
        for parent in &join.parents {
            put_str(&mut buf, parent);
        }
        put_str(&mut buf, &join.target);
    }

    buf.push(b'P');
    match input.projection {
        OutputProjection::FullStore => buf.push(0),
        OutputProjection::Channels(ids) => {
            buf.push(1);
            put_u32(&mut buf, ids.len() as u32);
            for id in ids {
                put_str(&mut buf, id);
            }
        }
    }

    if has_triggers {
        buf.push(b'T');
        let mut triggered: Vec<&(&str, &RetryPolicy, &RunWhen)> =
            nodes.iter().filter(|(_, _, w)| !w.is_default()).collect();
        triggered.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        put_u32(&mut buf, triggered.len() as u32);
        for (id, _, when) in triggered {
            put_str(&mut buf, id);
            let (kind, channels) = match when {
                RunWhen::Always => unreachable!("filtered to non-default"),
                RunWhen::AnyOf(c) => (1u8, c),
                RunWhen::AllOf(c) => (2u8, c),
            };
            buf.push(kind);
            let mut sorted: Vec<&str> = channels.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            put_u32(&mut buf, sorted.len() as u32);
            for channel in sorted {
                put_str(&mut buf, channel);
            }
        }
    }

    sha256_hex(&buf)
}
