//! The campaign's model of the target's call graph.
//!
//! A [`CallGraph`] starts life as the static call graph emitted by the
//! compiler (a DOT file, see [`CallGraph::from_dot`]) and is then reshaped
//! every exploitation round: the pruner drops uninteresting vertices, the
//! coverage ingester adds dynamically observed calls and updates coverage
//! counts, and the partitioners colour vertices by the task that owns them.
//!
//! Vertices are kept in a `petgraph` [`StableDiGraph`] so that removing a
//! vertex never shifts the indices of the others. Next to the graph the model
//! keeps two maps, vertex id -> node and function name -> node, which together
//! with the id/name stored on each vertex form the name<->id bijection that
//! every mutation keeps consistent.

use petgraph::Direction;
use petgraph::algo::{astar, is_cyclic_directed};
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::visit::{Bfs, EdgeRef, IntoEdgeReferences};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Colours used to mark partition membership in debug dumps.
///
/// The last colour is never handed out by [`palette_color`]; it stays
/// available for vertices that belong to no task.
pub const PALETTE: [&str; 6] = ["red", "green", "blue", "orange", "purple", "black"];

/// Colour for the task with the given zero-based index.
pub fn palette_color(task_index: usize) -> &'static str {
    PALETTE[task_index % (PALETTE.len() - 1)]
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("No vertex labelled '{0}' found in the call graph")]
    NoEntry(String),
    #[error("Failed to read call graph {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Opaque vertex identity, stable for the lifetime of a campaign.
///
/// Static vertices reuse the node name from the DOT file (`Node0x...`);
/// dynamically discovered ones are keyed by their function name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VertexId(String);

impl VertexId {
    pub fn new(id: impl Into<String>) -> Self {
        VertexId(id.into())
    }

    pub fn dynamic(function_name: &str) -> Self {
        VertexId(format!("dyn:{function_name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a vertex or edge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    /// Present in the compiler's static call graph.
    #[default]
    Static,
    /// Observed at runtime by the profiling binary.
    Dynamic,
}

/// Presentation-only state. Never read back by any algorithm.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Presentation {
    pub color: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionVertex {
    pub id: VertexId,
    pub name: String,
    pub origin: Origin,
    /// Instrumented block count reported by gcov; absent until the first
    /// coverage report mentioning this function has been ingested.
    pub total_blocks: Option<u32>,
    pub covered_prev: u32,
    pub covered_cur: u32,
    /// `(source file, static block count)` pairs resolved from the block index
    /// during pruning.
    pub source_refs: Vec<(String, u32)>,
    pub score: u64,
    pub presentation: Presentation,
}

impl FunctionVertex {
    pub fn new(id: VertexId, name: impl Into<String>, origin: Origin) -> Self {
        Self {
            id,
            name: name.into(),
            origin,
            total_blocks: None,
            covered_prev: 0,
            covered_cur: 0,
            source_refs: Vec::new(),
            score: 0,
            presentation: Presentation::default(),
        }
    }

    /// Static block count of the first source location this function maps to.
    pub fn static_blocks(&self) -> Option<u32> {
        self.source_refs.first().map(|(_, blocks)| *blocks)
    }

    pub fn is_dynamic(&self) -> bool {
        self.origin == Origin::Dynamic
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEdge {
    pub origin: Origin,
    /// Arborescence weight; lower is preferred.
    pub weight: u32,
    pub presentation: Presentation,
}

impl CallEdge {
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            weight: 1,
            presentation: Presentation::default(),
        }
    }
}

/// Directed call graph with a designated entry vertex.
#[derive(Debug, Clone)]
pub struct CallGraph {
    graph: StableDiGraph<FunctionVertex, CallEdge>,
    by_id: HashMap<VertexId, NodeIndex>,
    by_name: HashMap<String, NodeIndex>,
    entry: NodeIndex,
}

impl CallGraph {
    /// Creates a graph holding only the entry vertex.
    pub fn with_entry(entry: FunctionVertex) -> Self {
        let mut graph = StableDiGraph::new();
        let by_id = HashMap::from([(entry.id.clone(), NodeIndex::new(0))]);
        let by_name = HashMap::from([(entry.name.clone(), NodeIndex::new(0))]);
        let entry = graph.add_node(entry);
        Self {
            graph,
            by_id,
            by_name,
            entry,
        }
    }

    pub fn load_dot(path: &Path, entry_name: &str) -> Result<Self, GraphError> {
        let text = fs::read_to_string(path).map_err(|source| GraphError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_dot(&text, entry_name)
    }

    /// Builds the graph from an LLVM `-dot-callgraph` style description.
    ///
    /// Nodes without a usable label are dropped together with their edges. A
    /// label seen a second time is folded into the first vertex carrying it.
    pub fn from_dot(text: &str, entry_name: &str) -> Result<Self, GraphError> {
        let description = parse_dot(text);

        let mut labels: HashMap<&str, String> = HashMap::new();
        let mut order: Vec<&str> = Vec::new();
        for (node, label) in &description.nodes {
            if let Some(name) = label.as_deref().and_then(clean_label) {
                if !labels.contains_key(node.as_str()) {
                    order.push(node.as_str());
                    labels.insert(node.as_str(), name);
                }
            }
        }

        let entry_node: &str = order
            .iter()
            .copied()
            .find(|node| labels[*node] == entry_name)
            .ok_or_else(|| GraphError::NoEntry(entry_name.to_string()))?;

        let mut cg = CallGraph::with_entry(FunctionVertex::new(
            VertexId::new(entry_node),
            entry_name,
            Origin::Static,
        ));
        let mut resolved: HashMap<&str, NodeIndex> = HashMap::new();
        resolved.insert(entry_node, cg.entry);

        for node in order.iter().copied().filter(|n| *n != entry_node) {
            let name = &labels[node];
            let index = match cg.node(name) {
                Some(existing) => {
                    log::trace!("Folding duplicate label '{name}' of {node} into existing vertex");
                    existing
                }
                None => cg.insert_vertex(FunctionVertex::new(
                    VertexId::new(node),
                    name.clone(),
                    Origin::Static,
                )),
            };
            resolved.insert(node, index);
        }

        let mut dropped_edges = 0usize;
        for (from, to) in &description.edges {
            match (resolved.get(from.as_str()), resolved.get(to.as_str())) {
                (Some(&a), Some(&b)) => {
                    cg.add_edge(a, b, CallEdge::new(Origin::Static));
                }
                _ => dropped_edges += 1,
            }
        }
        log::debug!(
            "Loaded call graph: {} vertices, {} edges ({} unlabelled nodes, {} edges dropped)",
            cg.vertex_count(),
            cg.edge_count(),
            description.nodes.len().saturating_sub(order.len()),
            dropped_edges
        );
        Ok(cg)
    }

    pub fn entry(&self) -> NodeIndex {
        self.entry
    }

    pub fn vertex_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Node indices in ascending index order.
    pub fn nodes(&self) -> Vec<NodeIndex> {
        self.graph.node_indices().collect()
    }

    pub fn node(&self, name: &str) -> Option<NodeIndex> {
        self.by_name.get(name).copied()
    }

    pub fn node_by_id(&self, id: &VertexId) -> Option<NodeIndex> {
        self.by_id.get(id).copied()
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn vertex(&self, node: NodeIndex) -> Option<&FunctionVertex> {
        self.graph.node_weight(node)
    }

    pub fn vertex_mut(&mut self, node: NodeIndex) -> Option<&mut FunctionVertex> {
        self.graph.node_weight_mut(node)
    }

    pub fn name(&self, node: NodeIndex) -> Option<&str> {
        self.vertex(node).map(|v| v.name.as_str())
    }

    /// Inserts a vertex, or returns the node already carrying its name.
    pub fn insert_vertex(&mut self, vertex: FunctionVertex) -> NodeIndex {
        if let Some(existing) = self.by_name.get(&vertex.name) {
            return *existing;
        }
        let id = vertex.id.clone();
        let name = vertex.name.clone();
        let node = self.graph.add_node(vertex);
        self.by_id.insert(id, node);
        self.by_name.insert(name, node);
        node
    }

    /// Removes a vertex and its edges. Removing an absent vertex, or the
    /// entry vertex, does nothing and returns `None`.
    pub fn remove_vertex(&mut self, node: NodeIndex) -> Option<FunctionVertex> {
        if node == self.entry {
            return None;
        }
        let vertex = self.graph.remove_node(node)?;
        self.by_id.remove(&vertex.id);
        self.by_name.remove(&vertex.name);
        Some(vertex)
    }

    /// Adds `caller -> callee` unless the edge already exists.
    pub fn add_edge(&mut self, caller: NodeIndex, callee: NodeIndex, edge: CallEdge) -> bool {
        if self.has_edge(caller, callee)
            || !self.graph.contains_node(caller)
            || !self.graph.contains_node(callee)
        {
            return false;
        }
        self.graph.add_edge(caller, callee, edge);
        true
    }

    pub fn has_edge(&self, caller: NodeIndex, callee: NodeIndex) -> bool {
        self.graph.find_edge(caller, callee).is_some()
    }

    pub fn find_edge(&self, caller: NodeIndex, callee: NodeIndex) -> Option<EdgeIndex> {
        self.graph.find_edge(caller, callee)
    }

    pub fn edge(&self, edge: EdgeIndex) -> Option<&CallEdge> {
        self.graph.edge_weight(edge)
    }

    pub fn edge_mut(&mut self, edge: EdgeIndex) -> Option<&mut CallEdge> {
        self.graph.edge_weight_mut(edge)
    }

    /// All edges as `(caller, callee, weight)`, in edge index order.
    pub fn edge_list(&self) -> Vec<(NodeIndex, NodeIndex, u32)> {
        self.graph
            .edge_references()
            .map(|e| (e.source(), e.target(), e.weight().weight))
            .collect()
    }

    pub fn in_degree(&self, node: NodeIndex) -> usize {
        self.graph.edges_directed(node, Direction::Incoming).count()
    }

    pub fn out_degree(&self, node: NodeIndex) -> usize {
        self.graph.edges_directed(node, Direction::Outgoing).count()
    }

    /// Every node reachable from `from`, `from` included.
    pub fn reachable_from(&self, from: NodeIndex) -> HashSet<NodeIndex> {
        let mut seen = HashSet::new();
        if !self.graph.contains_node(from) {
            return seen;
        }
        let mut bfs = Bfs::new(&self.graph, from);
        while let Some(node) = bfs.next(&self.graph) {
            seen.insert(node);
        }
        seen
    }

    /// Number of hops on a shortest path, or `None` when `to` is unreachable.
    pub fn shortest_path_len(&self, from: NodeIndex, to: NodeIndex) -> Option<usize> {
        self.shortest_path(from, to).map(|path| path.len() - 1)
    }

    /// Vertices on a shortest (fewest hops) path from `from` to `to`, both
    /// ends included. Cycles are tolerated.
    pub fn shortest_path(&self, from: NodeIndex, to: NodeIndex) -> Option<Vec<NodeIndex>> {
        if !self.graph.contains_node(from) || !self.graph.contains_node(to) {
            return None;
        }
        astar(&self.graph, from, |n| n == to, |_| 1u32, |_| 0)
            .map(|(_, path)| path)
    }

    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.graph)
    }

    /// Drops every partition colour from vertices and edges.
    pub fn clear_colors(&mut self) {
        for node in self.nodes() {
            if let Some(v) = self.graph.node_weight_mut(node) {
                v.presentation.color = None;
            }
        }
        let edges: Vec<EdgeIndex> = self.graph.edge_indices().collect();
        for edge in edges {
            if let Some(e) = self.graph.edge_weight_mut(edge) {
                e.presentation.color = None;
            }
        }
    }

    /// Checks the name<->id bijection against the graph contents.
    pub fn is_consistent(&self) -> bool {
        if self.by_id.len() != self.graph.node_count()
            || self.by_name.len() != self.graph.node_count()
        {
            return false;
        }
        self.graph.node_indices().all(|node| {
            let v = &self.graph[node];
            self.by_id.get(&v.id) == Some(&node) && self.by_name.get(&v.name) == Some(&node)
        })
    }

    /// Renders the graph in DOT, optionally restricted to a set of edges.
    pub fn to_dot(&self, only_edges: Option<&[(NodeIndex, NodeIndex)]>) -> String {
        let mut out = String::from("digraph \"callgraph\" {\n");
        for node in self.graph.node_indices() {
            let v = &self.graph[node];
            let mut label = v.name.clone();
            if let Some(blocks) = v.static_blocks() {
                label.push_str(&format!("\\n{blocks}"));
            }
            out.push_str(&format!(
                "\t\"{}\" [shape=record,label=\"{{{}}}\"",
                v.id,
                escape(&label)
            ));
            if v.is_dynamic() {
                out.push_str(",style=dashed");
            }
            if let Some(color) = v.presentation.color {
                out.push_str(&format!(",color={color},fontcolor={color}"));
            }
            out.push_str("];\n");
        }
        let write_edge = |out: &mut String, source: NodeIndex, target: NodeIndex| {
            out.push_str(&format!(
                "\t\"{}\" -> \"{}\"",
                self.graph[source].id, self.graph[target].id
            ));
            let mut attrs = Vec::new();
            if let Some(e) = self.find_edge(source, target).and_then(|e| self.edge(e)) {
                if e.origin == Origin::Dynamic {
                    attrs.push("style=dashed".to_string());
                }
                if let Some(color) = e.presentation.color {
                    attrs.push(format!("color={color}"));
                }
            }
            if !attrs.is_empty() {
                out.push_str(&format!(" [{}]", attrs.join(",")));
            }
            out.push_str(";\n");
        };
        match only_edges {
            Some(edges) => {
                for (source, target) in edges {
                    write_edge(&mut out, *source, *target);
                }
            }
            None => {
                for e in self.graph.edge_references() {
                    write_edge(&mut out, e.source(), e.target());
                }
            }
        }
        out.push_str("}\n");
        out
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            entry: self.graph[self.entry].id.clone(),
            vertices: self
                .graph
                .node_indices()
                .map(|node| {
                    let v = &self.graph[node];
                    VertexSnapshot {
                        id: v.id.clone(),
                        name: v.name.clone(),
                        origin: v.origin,
                        total_blocks: v.total_blocks,
                        covered_prev: v.covered_prev,
                        covered_cur: v.covered_cur,
                        static_blocks: v.static_blocks(),
                        score: v.score,
                        color: v.presentation.color,
                    }
                })
                .collect(),
            edges: self
                .graph
                .edge_references()
                .map(|e| EdgeSnapshot {
                    caller: self.graph[e.source()].id.clone(),
                    callee: self.graph[e.target()].id.clone(),
                    origin: e.weight().origin,
                    color: e.weight().presentation.color,
                })
                .collect(),
        }
    }
}

/// Serializable view of a [`CallGraph`], written next to the DOT dump.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSnapshot {
    pub entry: VertexId,
    pub vertices: Vec<VertexSnapshot>,
    pub edges: Vec<EdgeSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VertexSnapshot {
    pub id: VertexId,
    pub name: String,
    pub origin: Origin,
    pub total_blocks: Option<u32>,
    pub covered_prev: u32,
    pub covered_cur: u32,
    pub static_blocks: Option<u32>,
    pub score: u64,
    pub color: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeSnapshot {
    pub caller: VertexId,
    pub callee: VertexId,
    pub origin: Origin,
    pub color: Option<&'static str>,
}

fn escape(label: &str) -> String {
    label.replace('"', "\\\"")
}

/// Strips the record braces and quotes LLVM puts around function names.
fn clean_label(raw: &str) -> Option<String> {
    let name: String = raw
        .chars()
        .filter(|c| !matches!(c, '{' | '}' | '"'))
        .collect();
    let name = name.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[derive(Debug, Default)]
struct DotDescription {
    nodes: Vec<(String, Option<String>)>,
    edges: Vec<(String, String)>,
}

fn parse_dot(text: &str) -> DotDescription {
    let mut description = DotDescription::default();
    for line in text.lines() {
        let statement = line.trim().trim_end_matches(';').trim();
        if statement.is_empty()
            || statement.starts_with("digraph")
            || statement.starts_with("graph")
            || statement.starts_with("//")
            || statement.starts_with('}')
            || statement.starts_with('{')
            || statement.starts_with("label=")
            || statement.starts_with("node ")
            || statement.starts_with("edge ")
        {
            continue;
        }

        let (head, attrs) = match statement.find('[') {
            Some(pos) => (
                statement[..pos].trim(),
                Some(statement[pos + 1..].trim_end_matches(']')),
            ),
            None => (statement, None),
        };

        if let Some((from, to)) = head.split_once("->") {
            let from = unquote(from.trim());
            let to = unquote(to.trim());
            if !from.is_empty() && !to.is_empty() {
                description.edges.push((from, to));
            }
            continue;
        }

        let node = unquote(head);
        if node.is_empty() {
            continue;
        }
        let label = attrs.and_then(|a| parse_attributes(a).remove("label"));
        description.nodes.push((node, label));
    }
    description
}

fn unquote(s: &str) -> String {
    s.trim_matches('"').to_string()
}

fn parse_attributes(attrs: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut parts = Vec::new();
    for c in attrs.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    for part in parts {
        if let Some((key, value)) = part.split_once('=') {
            map.insert(key.trim().to_string(), unquote(value.trim()));
        }
    }
    map
}
