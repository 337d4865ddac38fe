//! Graph builder and the compiled graph
//!
//! [`GraphBuilder`] collects node, router, edge, and join declarations, then
//! [`compile`](GraphBuilder::compile)s them into an immutable
//! [`CompiledGraph`] after validating in a fixed order (first violation wins;
//! within a check, candidates are visited in ascending id order so the
//! smallest offender is reported):
//!
//! 1. node ids are non-empty and contain neither `:` nor `+`;
//! 2. every referenced node id (start, edge endpoints, router sources, join
//!    parents/targets) is declared;
//! 3. no node id is declared twice;
//! 4. at most one router per source node, and a node may not carry both a
//!    router and static outgoing edges;
//! 5. join parents are non-empty and distinct;
//! 6. output projection channel ids exist and are global;
//! 7. the static-edge graph is acyclic (routers may form cycles);
//! 8. retry policy parameters are valid.
//!
//! Compilation also computes the schema and graph version digests and the
//! static layering (longest path from any start over static edges), used for
//! diagnostics and stable ordering fallbacks.

use crate::error::{Result, RuntimeError};
use crate::graph::{
    join_edge_id, JoinEdge, NodeDecl, NodeId, NodeRun, OutputProjection, RouterFn, RunWhen,
};
use crate::retry::RetryPolicy;
use crate::version::{graph_version, schema_version, GraphDigestInput};
use lockstep_checkpoint::channels::{ChannelScope, Schema};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Builder for a compiled graph
pub struct GraphBuilder {
    schema: Schema,
    declarations: Vec<NodeDecl>,
    static_edges: Vec<(NodeId, NodeId)>,
    routers: Vec<(NodeId, RouterFn)>,
    join_edges: Vec<(Vec<NodeId>, NodeId)>,
    start: Vec<NodeId>,
    projection: OutputProjection,
}

impl GraphBuilder {
    /// Start building a graph over a schema
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            declarations: Vec::new(),
            static_edges: Vec::new(),
            routers: Vec::new(),
            join_edges: Vec::new(),
            start: Vec::new(),
            projection: OutputProjection::FullStore,
        }
    }

    /// Declare a node with the default retry policy and trigger
    pub fn add_node(&mut self, id: impl Into<NodeId>, run: impl NodeRun + 'static) -> &mut Self {
        self.add_node_with(id, RetryPolicy::None, RunWhen::Always, run)
    }

    /// Declare a node with an explicit retry policy and trigger
    pub fn add_node_with(
        &mut self,
        id: impl Into<NodeId>,
        retry: RetryPolicy,
        run_when: RunWhen,
        run: impl NodeRun + 'static,
    ) -> &mut Self {
        self.declarations.push(NodeDecl {
            id: id.into(),
            retry,
            run_when,
            run: Arc::new(run),
        });
        self
    }

    /// Declare a static edge; insertion order is preserved
    pub fn add_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> &mut Self {
        self.static_edges.push((from.into(), to.into()));
        self
    }

    /// Attach a router to a source node
    ///
    /// At most one router per node, and a routed node may not also declare
    /// static outgoing edges; both are rejected at compile time.
    pub fn add_router(&mut self, source: impl Into<NodeId>, router: RouterFn) -> &mut Self {
        self.routers.push((source.into(), router));
        self
    }

    /// Declare a join barrier
    pub fn add_join(
        &mut self,
        parents: impl IntoIterator<Item = impl Into<NodeId>>,
        target: impl Into<NodeId>,
    ) -> &mut Self {
        self.join_edges
            .push((parents.into_iter().map(Into::into).collect(), target.into()));
        self
    }

    /// Add a start node (declared order is the step-0 seeding order)
    pub fn add_start(&mut self, id: impl Into<NodeId>) -> &mut Self {
        self.start.push(id.into());
        self
    }

    /// Set the output projection
    pub fn set_output_projection(&mut self, projection: OutputProjection) -> &mut Self {
        self.projection = projection;
        self
    }

    /// Validate and produce the immutable compiled graph
    pub fn compile(self) -> Result<Arc<CompiledGraph>> {
        // 1. reserved characters / empty ids
        let mut declared_ids: Vec<&str> =
            self.declarations.iter().map(|d| d.id.as_str()).collect();
        declared_ids.sort_unstable();
        for id in &declared_ids {
            if id.is_empty() {
                return Err(RuntimeError::GraphValidation(
                    "node id must not be empty".to_string(),
                ));
            }
            if id.contains(':') || id.contains('+') {
                return Err(RuntimeError::GraphValidation(format!(
                    "node id '{id}' contains a reserved character (':' or '+')"
                )));
            }
        }

        // 2. every referenced node is declared
        let declared: BTreeSet<&str> = declared_ids.iter().copied().collect();
        let mut referenced: BTreeSet<&str> = BTreeSet::new();
        referenced.extend(self.start.iter().map(String::as_str));
        for (from, to) in &self.static_edges {
            referenced.insert(from);
            referenced.insert(to);
        }
        referenced.extend(self.routers.iter().map(|(s, _)| s.as_str()));
        for (parents, target) in &self.join_edges {
            referenced.extend(parents.iter().map(String::as_str));
            referenced.insert(target);
        }
        for id in &referenced {
            if !declared.contains(id) {
                return Err(RuntimeError::UnknownNodeId((*id).to_string()));
            }
        }

        // 3. no duplicate declarations
        for pair in declared_ids.windows(2) {
            if pair[0] == pair[1] {
                return Err(RuntimeError::GraphValidation(format!(
                    "node '{}' is declared twice",
                    pair[0]
                )));
            }
        }

        // 4. at most one router per source, and routers exclude static edges
        let mut router_sources: Vec<&str> = self.routers.iter().map(|(s, _)| s.as_str()).collect();
        router_sources.sort_unstable();
        for pair in router_sources.windows(2) {
            if pair[0] == pair[1] {
                return Err(RuntimeError::GraphValidation(format!(
                    "node '{}' has more than one router",
                    pair[0]
                )));
            }
        }
        let routed: BTreeSet<&str> = router_sources.iter().copied().collect();
        let mut edge_sources: Vec<&str> =
            self.static_edges.iter().map(|(from, _)| from.as_str()).collect();
        edge_sources.sort_unstable();
        for source in edge_sources {
            if routed.contains(source) {
                return Err(RuntimeError::GraphValidation(format!(
                    "node '{source}' has both a router and static outgoing edges"
                )));
            }
        }

        // 5. join parents non-empty and distinct
        for (parents, target) in &self.join_edges {
            if parents.is_empty() {
                return Err(RuntimeError::GraphValidation(format!(
                    "join edge to '{target}' has no parents"
                )));
            }
            let mut sorted = parents.clone();
            sorted.sort_unstable();
            for pair in sorted.windows(2) {
                if pair[0] == pair[1] {
                    return Err(RuntimeError::GraphValidation(format!(
                        "join edge to '{target}' repeats parent '{}'",
                        pair[0]
                    )));
                }
            }
        }

        // 6. projection channels exist and are global
        let projection = match self.projection {
            OutputProjection::FullStore => OutputProjection::FullStore,
            OutputProjection::Channels(ids) => {
                let mut unique: Vec<String> = ids;
                unique.sort_unstable();
                unique.dedup();
                for id in &unique {
                    let spec = self
                        .schema
                        .registry
                        .spec(id)
                        .map_err(|_| RuntimeError::UnknownChannelId(id.clone()))?;
                    if spec.scope != ChannelScope::Global {
                        return Err(RuntimeError::ScopeMismatch {
                            channel: id.clone(),
                            detail: "output projection channels must be global".to_string(),
                        });
                    }
                }
                OutputProjection::Channels(unique)
            }
        };

        // 7. static-edge cycle check + layering
        let (layers, max_depth) = static_layers(&declared, &self.static_edges, &self.start)?;

        // 8. retry policies
        let mut by_id: Vec<&NodeDecl> = self.declarations.iter().collect();
        by_id.sort_by(|a, b| a.id.cmp(&b.id));
        for decl in &by_id {
            decl.retry.validate()?;
        }

        let join_edges: Vec<JoinEdge> = self
            .join_edges
            .iter()
            .map(|(parents, target)| {
                let mut sorted = parents.clone();
                sorted.sort_unstable();
                JoinEdge {
                    id: join_edge_id(&sorted, target),
                    parents: sorted,
                    target: target.clone(),
                }
            })
            .collect();

        let digest_input = GraphDigestInput {
            start: &self.start,
            nodes: self
                .declarations
                .iter()
                .map(|d| (d.id.as_str(), &d.retry, &d.run_when))
                .collect(),
            router_sources: self.routers.iter().map(|(s, _)| s.as_str()).collect(),
            static_edges: &self.static_edges,
            join_edges: &join_edges,
            projection: &projection,
        };
        let graph_version = graph_version(&digest_input);
        let schema_version = schema_version(&self.schema.registry);

        let uses_triggers = self.declarations.iter().any(|d| !d.run_when.is_default());

        let mut static_edges_from: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for (from, to) in &self.static_edges {
            static_edges_from
                .entry(from.clone())
                .or_default()
                .push(to.clone());
        }

        let routers_from: HashMap<NodeId, RouterFn> = self.routers.into_iter().collect();
        let nodes_by_id: HashMap<NodeId, NodeDecl> = self
            .declarations
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();

        tracing::debug!(
            nodes = nodes_by_id.len(),
            static_edges = self.static_edges.len(),
            joins = join_edges.len(),
            %graph_version,
            "graph compiled"
        );

        Ok(Arc::new(CompiledGraph {
            schema: self.schema,
            nodes_by_id,
            static_edges: self.static_edges,
            static_edges_from,
            join_edges,
            routers_from,
            start: self.start,
            projection,
            static_layers: layers,
            max_static_depth: max_depth,
            schema_version,
            graph_version,
            uses_triggers,
        }))
    }
}

/// Longest path from any declared start over static edges; errors on a
/// static cycle. Nodes unreachable over static edges sit at layer 0.
fn static_layers(
    declared: &BTreeSet<&str>,
    edges: &[(NodeId, NodeId)],
    start: &[NodeId],
) -> Result<(HashMap<NodeId, usize>, usize)> {
    // Kahn's algorithm over the static-edge subgraph; leftovers mean a cycle.
    let mut indegree: BTreeMap<&str, usize> = declared.iter().map(|&n| (n, 0)).collect();
    let mut successors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (from, to) in edges {
        *indegree.get_mut(to.as_str()).expect("validated") += 1;
        successors.entry(from.as_str()).or_default().push(to.as_str());
    }

    let mut queue: Vec<&str> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&n, _)| n)
        .collect();
    let mut topo_order: Vec<&str> = Vec::with_capacity(declared.len());
    while let Some(node) = queue.pop() {
        topo_order.push(node);
        for &succ in successors.get(node).map(Vec::as_slice).unwrap_or(&[]) {
            let d = indegree.get_mut(succ).expect("validated");
            *d -= 1;
            if *d == 0 {
                queue.push(succ);
            }
        }
        queue.sort_unstable();
    }

    if topo_order.len() != declared.len() {
        let mut cyclic: Vec<&str> = indegree
            .iter()
            .filter(|(_, &d)| d > 0)
            .map(|(&n, _)| n)
            .collect();
        cyclic.sort_unstable();
        return Err(RuntimeError::GraphValidation(format!(
            "static-edge cycle involving node '{}'",
            cyclic.first().unwrap_or(&"?")
        )));
    }

    // longest-path relaxation from the declared starts, in topo order
    let mut layers: HashMap<NodeId, usize> = HashMap::new();
    for node in start {
        layers.insert(node.clone(), 0);
    }
    for node in &topo_order {
        let Some(node_layer) = layers.get(*node).copied() else {
            continue;
        };
        for &succ in successors.get(node).map(Vec::as_slice).unwrap_or(&[]) {
            let entry = layers.entry(succ.to_string()).or_insert(0);
            *entry = (*entry).max(node_layer + 1);
        }
    }
    for node in declared {
        layers.entry((*node).to_string()).or_insert(0);
    }

    let max_depth = layers.values().copied().max().unwrap_or(0);
    Ok((layers, max_depth))
}

/// Immutable, validated, versioned graph
pub struct CompiledGraph {
    /// Schema the graph executes against
    pub schema: Schema,
    nodes_by_id: HashMap<NodeId, NodeDecl>,
    static_edges: Vec<(NodeId, NodeId)>,
    static_edges_from: HashMap<NodeId, Vec<NodeId>>,
    join_edges: Vec<JoinEdge>,
    routers_from: HashMap<NodeId, RouterFn>,
    start: Vec<NodeId>,
    projection: OutputProjection,
    static_layers: HashMap<NodeId, usize>,
    max_static_depth: usize,
    schema_version: String,
    graph_version: String,
    uses_triggers: bool,
}

impl CompiledGraph {
    /// Declared node by id
    pub fn node(&self, id: &str) -> Result<&NodeDecl> {
        self.nodes_by_id
            .get(id)
            .ok_or_else(|| RuntimeError::UnknownNodeId(id.to_string()))
    }

    /// Whether a node id is declared
    pub fn has_node(&self, id: &str) -> bool {
        self.nodes_by_id.contains_key(id)
    }

    /// Static successors of a node, in edge insertion order
    pub fn static_edges_from(&self, id: &str) -> &[NodeId] {
        self.static_edges_from
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Join edges in declaration order
    pub fn join_edges(&self) -> &[JoinEdge] {
        &self.join_edges
    }

    /// Router attached to a node, if any
    pub fn router_for(&self, id: &str) -> Option<&RouterFn> {
        self.routers_from.get(id)
    }

    /// Start nodes in declaration order
    pub fn start(&self) -> &[NodeId] {
        &self.start
    }

    /// Output projection
    pub fn output_projection(&self) -> &OutputProjection {
        &self.projection
    }

    /// Longest static-edge distance from any start (diagnostics)
    pub fn static_layer(&self, id: &str) -> Option<usize> {
        self.static_layers.get(id).copied()
    }

    /// Maximum static layer in the graph
    pub fn max_static_depth(&self) -> usize {
        self.max_static_depth
    }

    /// Schema version digest (`HSV2`)
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Graph version digest (`HGV3`/`HGV4`)
    pub fn graph_version(&self) -> &str {
        &self.graph_version
    }

    /// Whether any node declares a non-default trigger
    pub fn uses_triggers(&self) -> bool {
        self.uses_triggers
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("nodes", &self.nodes_by_id.len())
            .field("static_edges", &self.static_edges.len())
            .field("join_edges", &self.join_edges.len())
            .field("graph_version", &self.graph_version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeFuture, NodeInput, NodeOutput};
    use lockstep_checkpoint::channels::{ChannelSpec, SchemaRegistry};
    use lockstep_checkpoint::codec::JsonCodec;
    use lockstep_checkpoint::reducer;
    use serde_json::json;

    fn noop() -> impl Fn(NodeInput) -> NodeFuture + Send + Sync {
        |_input: NodeInput| -> NodeFuture { Box::pin(async { Ok(NodeOutput::new().end()) }) }
    }

    fn schema() -> Schema {
        Schema::new(
            SchemaRegistry::build(vec![
                ChannelSpec::global("counter", "int", || json!(0), reducer::sum())
                    .with_codec(JsonCodec::shared()),
                ChannelSpec::task_local("item", "string", || json!(""), reducer::last_write_wins())
                    .with_codec(JsonCodec::shared()),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn test_compile_minimal_graph() {
        let mut b = GraphBuilder::new(schema());
        b.add_node("a", noop());
        b.add_start("a");
        let graph = b.compile().unwrap();
        assert!(graph.has_node("a"));
        assert_eq!(graph.start(), &["a".to_string()]);
        assert_eq!(graph.schema_version().len(), 64);
    }

    #[test]
    fn test_reserved_characters_rejected() {
        let mut b = GraphBuilder::new(schema());
        b.add_node("bad:id", noop());
        assert!(matches!(
            b.compile().unwrap_err(),
            RuntimeError::GraphValidation(msg) if msg.contains("reserved")
        ));
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let mut b = GraphBuilder::new(schema());
        b.add_node("a", noop());
        b.add_start("a");
        b.add_edge("a", "ghost");
        assert!(matches!(
            b.compile().unwrap_err(),
            RuntimeError::UnknownNodeId(id) if id == "ghost"
        ));
    }

    #[test]
    fn test_duplicate_declaration_rejected() {
        let mut b = GraphBuilder::new(schema());
        b.add_node("a", noop());
        b.add_node("a", noop());
        b.add_start("a");
        assert!(matches!(
            b.compile().unwrap_err(),
            RuntimeError::GraphValidation(msg) if msg.contains("declared twice")
        ));
    }

    #[test]
    fn test_duplicate_router_rejected() {
        let mut b = GraphBuilder::new(schema());
        b.add_node("a", noop());
        b.add_start("a");
        let router: RouterFn = Arc::new(|_| Ok(crate::graph::Next::End));
        b.add_router("a", router.clone());
        b.add_router("a", router);
        assert!(matches!(
            b.compile().unwrap_err(),
            RuntimeError::GraphValidation(msg) if msg.contains("router")
        ));
    }

    #[test]
    fn test_router_excludes_static_edges() {
        let mut b = GraphBuilder::new(schema());
        b.add_node("a", noop());
        b.add_node("b", noop());
        b.add_start("a");
        b.add_edge("a", "b");
        let router: RouterFn = Arc::new(|_| Ok(crate::graph::Next::End));
        b.add_router("a", router);
        assert!(matches!(
            b.compile().unwrap_err(),
            RuntimeError::GraphValidation(msg)
                if msg.contains("both a router and static outgoing edges")
        ));
    }

    #[test]
    fn test_join_parent_rules() {
        let mut b = GraphBuilder::new(schema());
        b.add_node("a", noop());
        b.add_node("g", noop());
        b.add_start("a");
        b.add_join(["a", "a"], "g");
        assert!(matches!(
            b.compile().unwrap_err(),
            RuntimeError::GraphValidation(msg) if msg.contains("repeats parent")
        ));

        let mut b = GraphBuilder::new(schema());
        b.add_node("g", noop());
        b.add_start("g");
        b.add_join(Vec::<String>::new(), "g");
        assert!(matches!(
            b.compile().unwrap_err(),
            RuntimeError::GraphValidation(msg) if msg.contains("no parents")
        ));
    }

    #[test]
    fn test_join_id_sorted_parents() {
        let mut b = GraphBuilder::new(schema());
        b.add_node("b", noop());
        b.add_node("a", noop());
        b.add_node("g", noop());
        b.add_start("a");
        b.add_join(["b", "a"], "g");
        let graph = b.compile().unwrap();
        assert_eq!(graph.join_edges()[0].id, "join:a+b:g");
    }

    #[test]
    fn test_projection_must_be_global_and_known() {
        let mut b = GraphBuilder::new(schema());
        b.add_node("a", noop());
        b.add_start("a");
        b.set_output_projection(OutputProjection::Channels(vec!["item".to_string()]));
        assert!(matches!(
            b.compile().unwrap_err(),
            RuntimeError::ScopeMismatch { .. }
        ));

        let mut b = GraphBuilder::new(schema());
        b.add_node("a", noop());
        b.add_start("a");
        b.set_output_projection(OutputProjection::Channels(vec!["ghost".to_string()]));
        assert!(matches!(
            b.compile().unwrap_err(),
            RuntimeError::UnknownChannelId(_)
        ));
    }

    #[test]
    fn test_projection_dedup_and_sort() {
        let mut b = GraphBuilder::new(schema());
        b.add_node("a", noop());
        b.add_start("a");
        b.set_output_projection(OutputProjection::Channels(vec![
            "counter".to_string(),
            "counter".to_string(),
        ]));
        let graph = b.compile().unwrap();
        assert_eq!(
            graph.output_projection(),
            &OutputProjection::Channels(vec!["counter".to_string()])
        );
    }

    #[test]
    fn test_static_cycle_rejected() {
        let mut b = GraphBuilder::new(schema());
        b.add_node("a", noop());
        b.add_node("b", noop());
        b.add_start("a");
        b.add_edge("a", "b");
        b.add_edge("b", "a");
        assert!(matches!(
            b.compile().unwrap_err(),
            RuntimeError::GraphValidation(msg) if msg.contains("cycle")
        ));
    }

    #[test]
    fn test_static_layers_longest_path() {
        let mut b = GraphBuilder::new(schema());
        for id in ["a", "b", "c", "d"] {
            b.add_node(id, noop());
        }
        b.add_start("a");
        // a -> b -> d and a -> d: longest path to d is 2
        b.add_edge("a", "b");
        b.add_edge("b", "d");
        b.add_edge("a", "d");
        b.add_edge("a", "c");
        let graph = b.compile().unwrap();
        assert_eq!(graph.static_layer("a"), Some(0));
        assert_eq!(graph.static_layer("b"), Some(1));
        assert_eq!(graph.static_layer("c"), Some(1));
        assert_eq!(graph.static_layer("d"), Some(2));
        assert_eq!(graph.max_static_depth(), 2);
    }

    #[test]
    fn test_graph_version_present_and_stable() {
        let build = || {
            let mut b = GraphBuilder::new(schema());
            b.add_node("a", noop());
            b.add_node("b", noop());
            b.add_start("a");
            b.add_edge("a", "b");
            b.compile().unwrap()
        };
        assert_eq!(build().graph_version(), build().graph_version());
    }
}
