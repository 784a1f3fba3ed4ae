//! Folds runtime profiling facts back into the call graph.
//!
//! Each exploitation round the scheduler picks seeds from the monitor queue
//! ([`select_seeds`]), has a [`ProfilingBackend`] run them, and hands the two
//! textual outputs to [`ingest`]:
//!
//! * the call log, one `Function: <file>:<caller>-><callee>` line per observed
//!   call, which may add dynamic vertices and edges;
//! * the gcov summary, whose per-function block counts slide each vertex's
//!   coverage window (`covered_prev` <- `covered_cur` <- new count).

use crate::callgraph::{CallEdge, CallGraph, FunctionVertex, Origin, VertexId};
use crate::profiler::{ProfileError, ProfilingBackend};
use crate::state::CampaignState;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Marker the fuzzers append to the names of coverage-increasing inputs.
pub const COVERAGE_MARKER: &str = "+cov";

#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("Profiling failed: {0}")]
    Profile(#[from] ProfileError),
    #[error("Failed to list seeds in {path}: {source}")]
    SeedListing {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One observed `caller -> callee` call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallFact {
    pub caller: String,
    pub callee: String,
}

/// Parses the profiling call log. Identical lines are counted once and lines
/// that do not carry a `<file>:<caller>-><callee>` token are ignored.
pub fn parse_call_log(text: &str) -> Vec<CallFact> {
    let mut seen = HashSet::new();
    let mut facts = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let Some(token) = line.split(' ').nth(1) else {
            continue;
        };
        let parts: Vec<&str> = token.trim().split("->").collect();
        if parts.len() != 2 {
            log::trace!("Ignoring call log line: {line}");
            continue;
        }
        if !seen.insert(line) {
            continue;
        }
        let Some(caller) = parts[0].trim().split(':').nth(1) else {
            log::trace!("Ignoring call log line without source file: {line}");
            continue;
        };
        let callee = parts[1].trim();
        if caller.is_empty() || callee.is_empty() {
            continue;
        }
        facts.push(CallFact {
            caller: caller.to_string(),
            callee: callee.to_string(),
        });
    }
    facts
}

/// Adds the observed calls to the graph and returns every function named in
/// them, in first-seen order.
///
/// Unknown functions become dynamic vertices and leave the spare set.
pub fn apply_call_facts(
    graph: &mut CallGraph,
    facts: &[CallFact],
    state: &mut CampaignState,
) -> Vec<String> {
    let mut touched: Vec<String> = Vec::new();
    for fact in facts {
        for name in [&fact.caller, &fact.callee] {
            if !touched.contains(name) {
                touched.push(name.clone());
            }
        }
        let caller = dynamic_vertex(graph, &fact.caller, state);
        let callee = dynamic_vertex(graph, &fact.callee, state);
        graph.add_edge(caller, callee, CallEdge::new(Origin::Dynamic));
    }
    touched
}

fn dynamic_vertex(
    graph: &mut CallGraph,
    name: &str,
    state: &mut CampaignState,
) -> petgraph::stable_graph::NodeIndex {
    if let Some(node) = graph.node(name) {
        return node;
    }
    state.spare_functions.remove(name);
    log::trace!("Adding dynamically observed function {name}");
    graph.insert_vertex(FunctionVertex::new(
        VertexId::dynamic(name),
        name,
        Origin::Dynamic,
    ))
}

/// Per-function block coverage from the gcov summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageRecord {
    pub name: String,
    /// File name of the source, without directories.
    pub file: String,
    pub path: String,
    pub total_blocks: u32,
    pub covered: u32,
}

impl CoverageRecord {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            file: String::new(),
            path: String::new(),
            total_blocks: 0,
            covered: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReportSection {
    Initial,
    Function,
    File,
}

/// Parses a gcov function/file summary into merged coverage records.
///
/// Function sections precede the `File` section they belong to; a blank line
/// (or the end of input) closes a section.
pub fn parse_gcov_report(text: &str) -> Vec<CoverageRecord> {
    let mut records = Vec::new();
    let mut pending: Vec<CoverageRecord> = Vec::new();
    let mut current: Option<CoverageRecord> = None;
    let mut section = ReportSection::Initial;

    let mut close_section =
        |section: &mut ReportSection,
         current: &mut Option<CoverageRecord>,
         pending: &mut Vec<CoverageRecord>| {
            match section {
                ReportSection::Function => pending.extend(current.take()),
                ReportSection::File => merge_records(&mut records, pending.drain(..)),
                ReportSection::Initial => {}
            }
            *current = None;
            *section = ReportSection::Initial;
        };

    for line in text.lines() {
        if line.starts_with("Function") {
            current = line.split('\'').nth(1).map(CoverageRecord::named);
            section = ReportSection::Function;
        } else if line.starts_with("File ") {
            if let Some(path) = line.split('\'').nth(1) {
                let file = path.rsplit('/').next().unwrap_or(path);
                for record in pending.iter_mut() {
                    record.file = file.to_string();
                    record.path = path.to_string();
                }
            }
            section = ReportSection::File;
        } else if line.starts_with("Taken at least once") {
            if section != ReportSection::Function {
                continue;
            }
            match (parse_taken(line), current.as_mut()) {
                (Some((total, covered)), Some(record)) => {
                    record.total_blocks = total;
                    record.covered = covered;
                }
                (None, _) => log::trace!("Ignoring malformed gcov line: {line}"),
                _ => {}
            }
        } else if line.trim().is_empty() {
            close_section(&mut section, &mut current, &mut pending);
        }
    }
    close_section(&mut section, &mut current, &mut pending);
    records
}

/// `Taken at least once:50.00% of 34` -> `(34, 17)`.
fn parse_taken(line: &str) -> Option<(u32, u32)> {
    let (head, total) = line.split_once("% of ")?;
    let total: u32 = total.trim().parse().ok()?;
    let percent: f64 = head.split(':').nth(1)?.trim().parse().ok()?;
    let covered = (percent * f64::from(total) / 100.0).floor();
    Some((total, covered.clamp(0.0, f64::from(total)) as u32))
}

/// Merges records into `records`. A function seen again keeps its original
/// position but takes the incoming record when it covers strictly more.
pub fn merge_records(
    records: &mut Vec<CoverageRecord>,
    incoming: impl IntoIterator<Item = CoverageRecord>,
) {
    for record in incoming {
        match records.iter_mut().find(|r| r.name == record.name) {
            Some(existing) if record.covered > existing.covered => *existing = record,
            Some(_) => {}
            None => records.push(record),
        }
    }
}

/// Slides the coverage window of every vertex named by a record.
pub fn apply_coverage(graph: &mut CallGraph, records: &[CoverageRecord]) -> usize {
    let mut updated = 0;
    for record in records {
        let Some(vertex) = graph.node(&record.name).and_then(|n| graph.vertex_mut(n)) else {
            log::trace!("Coverage for unknown function {}", record.name);
            continue;
        };
        if vertex.total_blocks.is_none() {
            vertex.total_blocks = Some(record.total_blocks);
            vertex.covered_prev = 0;
        } else {
            vertex.covered_prev = vertex.covered_cur;
        }
        vertex.covered_cur = record.covered;
        updated += 1;
    }
    updated
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Functions named in the call log, in first-seen order.
    pub covered_functions: Vec<String>,
    pub seeds_profiled: usize,
    pub vertices_added: usize,
    pub edges_added: usize,
    pub vertices_updated: usize,
}

/// Merges one round's profiling output into the graph.
pub fn ingest(
    graph: &mut CallGraph,
    state: &mut CampaignState,
    call_log: &str,
    gcov_report: &str,
) -> IngestReport {
    let (vertices_before, edges_before) = (graph.vertex_count(), graph.edge_count());
    let facts = parse_call_log(call_log);
    let covered_functions = apply_call_facts(graph, &facts, state);
    let records = parse_gcov_report(gcov_report);
    let vertices_updated = apply_coverage(graph, &records);
    IngestReport {
        covered_functions,
        seeds_profiled: 0,
        vertices_added: graph.vertex_count() - vertices_before,
        edges_added: graph.edge_count().saturating_sub(edges_before),
        vertices_updated,
    }
}

/// Seeds from `seed_dir` that should be profiled this round, sorted by name.
///
/// The first pass takes every seed; later passes only take unprofiled seeds
/// carrying the coverage marker. Selected seeds are recorded as profiled. A
/// missing directory yields no seeds.
pub fn select_seeds(
    seed_dir: &Path,
    is_first_pass: bool,
    state: &mut CampaignState,
) -> Result<Vec<PathBuf>, CoverageError> {
    if !seed_dir.is_dir() {
        log::warn!("Seed directory {} does not exist; nothing to profile", seed_dir.display());
        return Ok(Vec::new());
    }
    let listing_error = |source| CoverageError::SeedListing {
        path: seed_dir.display().to_string(),
        source,
    };
    let mut candidates = Vec::new();
    for entry in fs::read_dir(seed_dir).map_err(listing_error)? {
        let entry = entry.map_err(listing_error)?;
        let path = entry.path();
        if path.is_file() {
            candidates.push((entry.file_name().to_string_lossy().into_owned(), path));
        }
    }
    candidates.sort();

    let mut selected = Vec::new();
    for (name, path) in candidates {
        if !is_first_pass
            && (!name.contains(COVERAGE_MARKER) || state.profiled_seeds.contains(&name))
        {
            continue;
        }
        log::trace!("Selected seed {name} for profiling");
        state.profiled_seeds.insert(name);
        selected.push(path);
    }
    Ok(selected)
}

/// Selects seeds, profiles them and ingests the results.
pub fn refresh(
    graph: &mut CallGraph,
    state: &mut CampaignState,
    profiler: &mut dyn ProfilingBackend,
    seed_dir: &Path,
    is_first_pass: bool,
) -> Result<IngestReport, CoverageError> {
    let seeds = select_seeds(seed_dir, is_first_pass, state)?;
    log::info!("Profiling {} seed(s) from {}", seeds.len(), seed_dir.display());
    let output = profiler.profile(&seeds)?;
    let mut report = ingest(graph, state, &output.call_log, &output.coverage_report);
    report.seeds_profiled = seeds.len();
    Ok(report)
}
