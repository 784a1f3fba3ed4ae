//! Removes call-graph vertices that cannot usefully be assigned to a task.
//!
//! Three passes run in order, each finishing before the next starts:
//!
//! 1. vertices whose function has no block-index entry (no instrumentation),
//! 2. vertices with neither callers nor callees,
//! 3. vertices not reachable from the entry vertex.
//!
//! The entry vertex survives every pass. Dropped function names are parked in
//! [`CampaignState::spare_functions`]; the coverage ingester takes them back
//! out if they are later observed at runtime.

use crate::callgraph::CallGraph;
use crate::index::FunctionBlockIndex;
use crate::state::CampaignState;
use petgraph::stable_graph::NodeIndex;

/// Vertices removed by each pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub uninstrumented: usize,
    pub disconnected: usize,
    pub unreachable: usize,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.uninstrumented + self.disconnected + self.unreachable
    }
}

pub fn prune(
    graph: &mut CallGraph,
    blocks: &FunctionBlockIndex,
    state: &mut CampaignState,
) -> PruneReport {
    let entry = graph.entry();
    let mut report = PruneReport::default();

    log_size("before pass 1", graph);
    let mut doomed = Vec::new();
    for node in graph.nodes() {
        let Some(vertex) = graph.vertex_mut(node) else {
            continue;
        };
        match blocks.blocks(&vertex.name) {
            Some(refs) => vertex.source_refs = refs.to_vec(),
            None if node != entry => doomed.push(node),
            None => {}
        }
    }
    report.uninstrumented = drop_vertices(graph, &doomed, state, "uninstrumented");

    log_size("before pass 2", graph);
    let doomed: Vec<NodeIndex> = graph
        .nodes()
        .into_iter()
        .filter(|&n| n != entry && graph.in_degree(n) == 0 && graph.out_degree(n) == 0)
        .collect();
    report.disconnected = drop_vertices(graph, &doomed, state, "disconnected");

    log_size("before pass 3", graph);
    let reachable = graph.reachable_from(entry);
    let doomed: Vec<NodeIndex> = graph
        .nodes()
        .into_iter()
        .filter(|n| !reachable.contains(n))
        .collect();
    report.unreachable = drop_vertices(graph, &doomed, state, "unreachable");

    log_size("after pruning", graph);
    report
}

fn drop_vertices(
    graph: &mut CallGraph,
    doomed: &[NodeIndex],
    state: &mut CampaignState,
    reason: &str,
) -> usize {
    let mut dropped = 0;
    for &node in doomed {
        if let Some(vertex) = graph.remove_vertex(node) {
            log::trace!("Pruned {reason} function {}", vertex.name);
            state.spare_functions.insert(vertex.name);
            dropped += 1;
        }
    }
    dropped
}

fn log_size(stage: &str, graph: &CallGraph) {
    log::debug!(
        "Call graph {stage}: {} vertices, {} edges",
        graph.vertex_count(),
        graph.edge_count()
    );
}
