//! Turns the call graph into one task per round worker.
//!
//! Two strategies are available:
//!
//! * [`split_naive`] cuts the vertex ordering into `k` contiguous ranges of
//!   near-equal size, ignoring scores and structure.
//! * [`partition_tree`] scores every vertex, cuts a minimum spanning
//!   arborescence of the graph into connected clusters no heavier than
//!   `ceil(total / k)`, and bin-packs the clusters into `k` tasks. Each
//!   cluster also drags in the functions on a shortest path from the entry to
//!   its top vertex so that a worker always has a reachable foothold.
//!
//! A task is a set of `(source file, function)` obligations that the
//! task-bound fuzzer reads from `task_<n>.txt`.

use crate::arborescence::{Arborescence, min_spanning_arborescence};
use crate::balancer::balance;
use crate::callgraph::{CallGraph, FunctionVertex, palette_color};
use crate::index::FunctionSourceIndex;
use petgraph::stable_graph::NodeIndex;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PartitionError {
    /// Zero tasks requested, or nothing with a positive score to hand out.
    #[error("Cannot split a total score of {total_score} into {tasks} task(s)")]
    Capacity { tasks: usize, total_score: u64 },
    /// The graph still holds vertices the entry cannot reach.
    #[error("Call graph has vertices unreachable from the entry; prune it before partitioning")]
    NotSpanning,
    #[error("Failed to write task file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    Tree,
    Naive,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tree" => Ok(Strategy::Tree),
            "naive" => Ok(Strategy::Naive),
            other => Err(format!("unknown partitioning algorithm '{other}' (expected tree or naive)")),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Tree => f.write_str("tree"),
            Strategy::Naive => f.write_str("naive"),
        }
    }
}

/// Optional clamp applied to vertex scores before partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScoreCap {
    #[default]
    None,
    /// Clamp every score to `floor(median) + floor(mean)`.
    MedianPlusMean,
}

/// `(covered_cur - covered_prev + 1) * (total - covered_cur + 1)`.
///
/// Both differences saturate at zero, so every score is at least 1.
pub fn score(total_blocks: u32, covered_prev: u32, covered_cur: u32) -> u64 {
    let gained = u64::from(covered_cur.saturating_sub(covered_prev)) + 1;
    let remaining = u64::from(total_blocks.saturating_sub(covered_cur)) + 1;
    gained * remaining
}

/// Scores a vertex, falling back to its static block count when gcov never
/// reported on it.
pub fn vertex_score(vertex: &FunctionVertex) -> u64 {
    let total = vertex
        .total_blocks
        .or_else(|| vertex.static_blocks())
        .unwrap_or(0);
    score(total, vertex.covered_prev, vertex.covered_cur)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoreStats {
    pub median: u64,
    pub mean: u64,
    pub max: u64,
    pub total: u64,
}

/// Scores every vertex in place and returns the distribution, the total taken
/// after the cap.
pub fn assign_scores(graph: &mut CallGraph, cap: ScoreCap) -> ScoreStats {
    let nodes = graph.nodes();
    let mut raw: Vec<(NodeIndex, u64)> = nodes
        .iter()
        .filter_map(|&n| graph.vertex(n).map(|v| (n, vertex_score(v))))
        .collect();
    if raw.is_empty() {
        return ScoreStats::default();
    }

    let mut sorted: Vec<u64> = raw.iter().map(|(_, s)| *s).collect();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    let median = if sorted.len().is_multiple_of(2) {
        sorted[mid - 1].saturating_add(sorted[mid]) / 2
    } else {
        sorted[mid]
    };
    let mean = sorted.iter().fold(0u64, |acc, s| acc.saturating_add(*s)) / sorted.len() as u64;
    let max = sorted[sorted.len() - 1];

    if cap == ScoreCap::MedianPlusMean {
        let limit = median.saturating_add(mean);
        for (_, s) in raw.iter_mut() {
            *s = (*s).min(limit);
        }
    }

    let mut total: u64 = 0;
    for (node, s) in raw {
        if let Some(v) = graph.vertex_mut(node) {
            log::trace!(
                "Score of {}: {s} (prev {}, cur {}, total {:?})",
                v.name,
                v.covered_prev,
                v.covered_cur,
                v.total_blocks
            );
            v.score = s;
        }
        total = total.saturating_add(s);
    }
    let stats = ScoreStats {
        median,
        mean,
        max,
        total,
    };
    log::debug!(
        "Scores: median {}, mean {}, max {}, total {}",
        stats.median,
        stats.mean,
        stats.max,
        stats.total
    );
    stats
}

/// A connected piece of the arborescence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    /// Top vertex first, then the merged subtrees.
    pub vertices: Vec<NodeIndex>,
    pub weight: u64,
}

/// Cuts the tree into connected clusters bottom-up.
///
/// Children are visited before their parent; a child's cluster joins the
/// parent's while the sum stays within `capacity` and is closed off otherwise.
/// A single vertex heavier than `capacity` still forms its own cluster.
pub fn bottom_up_clusters(
    tree: &Arborescence,
    weights: &HashMap<NodeIndex, u64>,
    capacity: u64,
) -> Vec<Cluster> {
    let mut open: HashMap<NodeIndex, Cluster> = HashMap::new();
    let mut finished = Vec::new();
    for node in tree.post_order() {
        let mut cluster = Cluster {
            vertices: vec![node],
            weight: weights.get(&node).copied().unwrap_or(0),
        };
        for child in tree.children(node) {
            let Some(sub) = open.remove(child) else {
                continue;
            };
            if cluster.weight.saturating_add(sub.weight) <= capacity {
                cluster.weight = cluster.weight.saturating_add(sub.weight);
                cluster.vertices.extend(sub.vertices);
            } else {
                finished.push(sub);
            }
        }
        open.insert(node, cluster);
    }
    if let Some(root) = open.remove(&tree.root()) {
        finished.push(root);
    }
    finished
}

/// One `source file : function` line of a task file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Obligation {
    pub source_file: String,
    pub function: String,
}

impl fmt::Display for Obligation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_file, self.function)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Task {
    pub vertices: Vec<NodeIndex>,
    pub obligations: BTreeSet<Obligation>,
    pub weight: u64,
}

impl Task {
    fn oblige(&mut self, graph: &CallGraph, node: NodeIndex, sources: &FunctionSourceIndex) {
        let Some(function) = graph.name(node) else {
            return;
        };
        match sources.sources(function) {
            Some(refs) => {
                for (source_file, _) in refs {
                    self.obligations.insert(Obligation {
                        source_file: source_file.clone(),
                        function: function.to_string(),
                    });
                }
            }
            None => log::trace!("No source location for {function}; left out of task"),
        }
    }

    pub fn render(&self) -> String {
        self.obligations.iter().map(|o| format!("{o}\n")).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PartitionPlan {
    pub tasks: Vec<Task>,
    /// Clusters produced before bin-packing; equals `tasks.len()` for the
    /// naive split.
    pub partitions: usize,
    /// Tree edges the tasks were cut from, when the tree strategy ran.
    pub arborescence: Option<Vec<(NodeIndex, NodeIndex)>>,
}

impl PartitionPlan {
    /// Writes `task_1.txt` .. `task_<k>.txt` into `dir`.
    pub fn write_tasks(&self, dir: &Path) -> Result<Vec<PathBuf>, PartitionError> {
        let mut written = Vec::with_capacity(self.tasks.len());
        for (i, task) in self.tasks.iter().enumerate() {
            let path = task_file(dir, i + 1);
            fs::write(&path, task.render()).map_err(|source| PartitionError::Io {
                path: path.display().to_string(),
                source,
            })?;
            written.push(path);
        }
        Ok(written)
    }
}

pub fn task_file(dir: &Path, number: usize) -> PathBuf {
    dir.join(format!("task_{number}.txt"))
}

/// Splits the vertex ordering into `k` contiguous ranges whose sizes differ
/// by at most one, the longer ranges first.
pub fn split_naive(
    graph: &mut CallGraph,
    k: usize,
    sources: &FunctionSourceIndex,
) -> Result<PartitionPlan, PartitionError> {
    if k == 0 {
        return Err(PartitionError::Capacity {
            tasks: k,
            total_score: graph.vertex_count() as u64,
        });
    }
    graph.clear_colors();
    let nodes = graph.nodes();
    let (size, extra) = (nodes.len() / k, nodes.len() % k);
    let mut tasks = Vec::with_capacity(k);
    for i in 0..k {
        let start = i * size + i.min(extra);
        let end = (i + 1) * size + (i + 1).min(extra);
        let mut task = Task::default();
        for &node in &nodes[start..end] {
            task.oblige(graph, node, sources);
            task.vertices.push(node);
            if let Some(v) = graph.vertex_mut(node) {
                v.presentation.color = Some(palette_color(i));
            }
        }
        task.weight = task.vertices.len() as u64;
        tasks.push(task);
    }
    log::debug!("Naive split of {} vertices into {k} tasks", nodes.len());
    Ok(PartitionPlan {
        partitions: tasks.len(),
        tasks,
        arborescence: None,
    })
}

/// Score-balanced partitioning of a pruned graph into `k` tasks.
pub fn partition_tree(
    graph: &mut CallGraph,
    k: usize,
    sources: &FunctionSourceIndex,
    cap: ScoreCap,
) -> Result<PartitionPlan, PartitionError> {
    let tree = min_spanning_arborescence(graph).ok_or(PartitionError::NotSpanning)?;
    let stats = assign_scores(graph, cap);
    if k == 0 || stats.total == 0 {
        return Err(PartitionError::Capacity {
            tasks: k,
            total_score: stats.total,
        });
    }
    graph.clear_colors();

    let capacity = stats.total.div_ceil(k as u64);
    let weights: HashMap<NodeIndex, u64> = graph
        .nodes()
        .into_iter()
        .filter_map(|n| graph.vertex(n).map(|v| (n, v.score)))
        .collect();
    let clusters = bottom_up_clusters(&tree, &weights, capacity);
    let partitions = clusters.len();
    log::debug!("Cut arborescence into {partitions} clusters of capacity {capacity}; packing into {k} tasks");

    let entry = graph.entry();
    let weighted: Vec<(Cluster, u64)> = clusters
        .into_iter()
        .map(|c| {
            let w = c.weight;
            (c, w)
        })
        .collect();
    let bins = balance(weighted, k);
    let mut tasks = Vec::with_capacity(k);
    for (i, bin) in bins.into_iter().enumerate() {
        let color = palette_color(i);
        let mut task = Task {
            weight: bin.weight,
            ..Task::default()
        };
        for cluster in bin.items {
            if let Some(&top) = cluster.vertices.first() {
                for node in graph.shortest_path(entry, top).unwrap_or_default() {
                    task.oblige(graph, node, sources);
                }
            }
            for node in cluster.vertices {
                task.oblige(graph, node, sources);
                if let Some(v) = graph.vertex_mut(node) {
                    v.presentation.color = Some(color);
                }
                for &child in tree.children(node) {
                    if let Some(e) = graph.find_edge(node, child).and_then(|e| graph.edge_mut(e)) {
                        e.presentation.color = Some(color);
                    }
                }
                task.vertices.push(node);
            }
        }
        log::trace!(
            "Task {} holds {} vertices, weight {}, {} obligations",
            i + 1,
            task.vertices.len(),
            task.weight,
            task.obligations.len()
        );
        tasks.push(task);
    }
    Ok(PartitionPlan {
        tasks,
        partitions,
        arborescence: Some(tree.edges().to_vec()),
    })
}
