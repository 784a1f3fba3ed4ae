use crate::callgraph::{CallGraph, GraphError};
use crate::config::{CampaignConfig, ConfigError};
use crate::corpus::{StagingError, import_corpus, rotate_artifacts, stage_seeds};
use crate::coverage::{CoverageError, refresh};
use crate::executor::{Worker, WorkerError, WorkerLauncher};
use crate::fleet::FleetCommands;
use crate::index::{FunctionBlockIndex, FunctionSourceIndex, IndexError};
use crate::layout::CampaignLayout;
use crate::partition::{PartitionError, Strategy, partition_tree, split_naive};
use crate::profiler::ProfilingBackend;
use crate::pruner::{PruneReport, prune};
use crate::state::{CampaignState, Phase};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors that end a campaign. Running workers are stopped before any of
/// these reaches the caller.
#[derive(Error, Debug)]
pub enum CampaignError {
    /// The static call graph could not be read or has no entry vertex.
    #[error("Malformed call graph: {0}")]
    MalformedGraph(#[from] GraphError),
    #[error("Failed to load function index: {0}")]
    Index(#[from] IndexError),
    #[error("Seed staging failed: {0}")]
    SeedStaging(#[from] StagingError),
    #[error("Worker launch failed: {0}")]
    WorkerLaunch(#[from] WorkerError),
    /// Partitioning could not produce the requested tasks.
    #[error("Partitioning failed: {0}")]
    PartitionCapacity(#[from] PartitionError),
    #[error("Coverage refresh failed: {0}")]
    Coverage(#[from] CoverageError),
    #[error("Invalid campaign configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to serialize call graph snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("Campaign I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// The operator asked the campaign to stop.
    #[error("Campaign interrupted during round {round}")]
    Interrupted { round: u32 },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CampaignError + '_ {
    move |source| CampaignError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// The two suspension points of the control loop go through a `Pacer`.
pub trait Pacer {
    /// Waits for `duration`. Returns `false` if the wait was cut short by an
    /// interruption request.
    fn pause(&mut self, duration: Duration) -> bool;
}

/// Sleeps in short slices so an interrupt flag is noticed promptly.
#[derive(Debug, Clone)]
pub struct SleepPacer {
    interrupt: Arc<AtomicBool>,
    slice: Duration,
}

impl SleepPacer {
    pub fn new(interrupt: Arc<AtomicBool>) -> Self {
        Self {
            interrupt,
            slice: Duration::from_millis(200),
        }
    }
}

impl Pacer for SleepPacer {
    fn pause(&mut self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.interrupt.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(self.slice.min(deadline - now));
        }
    }
}

/// Everything read from disk before the campaign starts.
#[derive(Debug, Clone)]
pub struct CampaignInputs {
    pub graph: CallGraph,
    pub sources: FunctionSourceIndex,
    pub blocks: FunctionBlockIndex,
}

impl CampaignInputs {
    pub fn load(config: &CampaignConfig) -> Result<Self, CampaignError> {
        let inputs = &config.inputs;
        let graph = CallGraph::load_dot(&inputs.call_graph, &config.campaign.entry_function)?;
        let sources = FunctionSourceIndex::load(&inputs.func_ids)?;
        let blocks = FunctionBlockIndex::load(&inputs.func_bbs)?;
        log::info!(
            "Loaded call graph ({} vertices, {} edges), {} source entries, {} block entries",
            graph.vertex_count(),
            graph.edge_count(),
            sources.len(),
            blocks.len()
        );
        Ok(Self {
            graph,
            sources,
            blocks,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignSummary {
    pub rounds_run: u32,
    pub exploitation_rounds: u32,
    pub vertices: usize,
    pub edges: usize,
    pub spare_functions: usize,
    pub profiled_seeds: usize,
    /// Includes the monitor.
    pub workers_launched: usize,
}

impl fmt::Display for CampaignSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Rounds run:        {} (1 scanning + {} exploitation)",
            self.rounds_run, self.exploitation_rounds
        )?;
        writeln!(f, "Workers launched:  {}", self.workers_launched)?;
        writeln!(f, "Call graph:        {} vertices, {} edges", self.vertices, self.edges)?;
        writeln!(f, "Spare functions:   {}", self.spare_functions)?;
        write!(f, "Profiled seeds:    {}", self.profiled_seeds)
    }
}

/// Drives the round loop: one scanning round, then exploitation rounds that
/// refresh the call graph from the monitor's queue and hand each round
/// worker its own task file.
pub struct CampaignScheduler {
    config: CampaignConfig,
    layout: CampaignLayout,
    commands: FleetCommands,
    graph: CallGraph,
    sources: FunctionSourceIndex,
    blocks: FunctionBlockIndex,
    state: CampaignState,
    exploitation_rounds: u32,
    launcher: Box<dyn WorkerLauncher>,
    profiler: Box<dyn ProfilingBackend>,
    pacer: Box<dyn Pacer>,
    monitor: Option<Box<dyn Worker>>,
    round_workers: Vec<Box<dyn Worker>>,
    rounds_run: u32,
    workers_launched: usize,
}

impl CampaignScheduler {
    pub fn new(
        config: CampaignConfig,
        inputs: CampaignInputs,
        launcher: Box<dyn WorkerLauncher>,
        profiler: Box<dyn ProfilingBackend>,
        pacer: Box<dyn Pacer>,
    ) -> Result<Self, CampaignError> {
        let exploitation_rounds = config.validate()?;
        let layout = CampaignLayout::new(&config.campaign.out_dir);
        let commands = FleetCommands::new(&config, &layout);
        Ok(Self {
            config,
            layout,
            commands,
            graph: inputs.graph,
            sources: inputs.sources,
            blocks: inputs.blocks,
            state: CampaignState::new(),
            exploitation_rounds,
            launcher,
            profiler,
            pacer,
            monitor: None,
            round_workers: Vec::new(),
            rounds_run: 0,
            workers_launched: 0,
        })
    }

    pub fn total_rounds(&self) -> u32 {
        1 + self.exploitation_rounds
    }

    /// Runs the whole campaign. On any failure the round workers and the
    /// monitor are asked to stop before the error is returned.
    pub fn run(mut self) -> Result<CampaignSummary, CampaignError> {
        let outcome = self.drive();
        if let Err(err) = &outcome {
            log::error!("Stopping campaign: {err}");
        }
        self.stop_round_workers();
        self.stop_monitor();
        outcome?;

        let summary = self.summary();
        log::info!(
            "Campaign finished after {} round(s); {} workers launched",
            summary.rounds_run,
            summary.workers_launched
        );
        Ok(summary)
    }

    fn summary(&self) -> CampaignSummary {
        CampaignSummary {
            rounds_run: self.rounds_run,
            exploitation_rounds: self.exploitation_rounds,
            vertices: self.graph.vertex_count(),
            edges: self.graph.edge_count(),
            spare_functions: self.state.spare_functions.len(),
            profiled_seeds: self.state.profiled_seeds.len(),
            workers_launched: self.workers_launched,
        }
    }

    fn drive(&mut self) -> Result<(), CampaignError> {
        self.prepare()?;

        let spec = self.commands.monitor();
        log::info!("Launching {}: {}", spec.name, spec.command_line());
        let monitor = self.launcher.launch(&spec)?;
        log::info!("{} started with pid {}", monitor.name(), monitor.pid());
        self.monitor = Some(monitor);
        self.workers_launched += 1;
        if !self.pacer.pause(self.config.launch_stagger()) {
            return Err(CampaignError::Interrupted { round: 1 });
        }

        let total = self.total_rounds();
        while self.state.round <= total {
            self.run_round()?;
            self.rounds_run += 1;
            self.state.advance();
        }
        Ok(())
    }

    fn prepare(&mut self) -> Result<(), CampaignError> {
        let started = Instant::now();
        let report = prune(&mut self.graph, &self.blocks, &mut self.state);
        log::info!(
            "Initial prune removed {} vertices in {:?}; {} vertices, {} edges remain",
            report.total(),
            started.elapsed(),
            self.graph.vertex_count(),
            self.graph.edge_count()
        );
        self.layout
            .create()
            .map_err(io_error(self.layout.active_runs()))?;
        import_corpus(&self.config.campaign.seed_corpus, &self.layout.seeds_origin())?;
        Ok(())
    }

    fn run_round(&mut self) -> Result<(), CampaignError> {
        let round = self.state.round;
        let phase = self.state.phase;
        log::info!("===== Round {round}/{} ({phase}) =====", self.total_rounds());

        if round > 1 {
            let backup = rotate_artifacts(&self.layout, round - 1, self.config.round_workers())?;
            log::info!("Round {} artifacts moved to {}", round - 1, backup.display());
        }
        let tasks_dir = self.layout.tasks();
        fs::create_dir_all(&tasks_dir).map_err(io_error(&tasks_dir))?;

        let seed_source = if round == 1 {
            self.layout.seeds_origin()
        } else {
            self.layout.monitor_queue()
        };
        let staged = stage_seeds(&seed_source, &self.layout.seeds(), round)?;
        log::info!("Staged {staged} seed(s) from {}", seed_source.display());

        if phase == Phase::Exploiting {
            self.update_graph(round == 2)?;
        }
        log::info!(
            "Call graph is {}",
            if self.graph.is_acyclic() { "acyclic" } else { "cyclic" }
        );
        if phase == Phase::Exploiting {
            self.partition()?;
        }
        self.dump_graph()?;

        self.launch_round(round, phase)?;
        let timeout = match phase {
            Phase::Scanning => self.config.scanning_timeout(),
            Phase::Exploiting => self.config.exploitation_timeout(),
        };
        log::info!("Round {round} running for {timeout:?}");
        if !self.pacer.pause(timeout) {
            return Err(CampaignError::Interrupted { round });
        }
        self.stop_round_workers();
        Ok(())
    }

    /// Profiles the monitor's queue, merges the result and prunes again.
    fn update_graph(&mut self, first_pass: bool) -> Result<(), CampaignError> {
        let started = Instant::now();
        let (vertices, edges) = (self.graph.vertex_count(), self.graph.edge_count());
        let report = refresh(
            &mut self.graph,
            &mut self.state,
            self.profiler.as_mut(),
            &self.layout.monitor_queue(),
            first_pass,
        )?;
        log::info!(
            "Ingested {} seed(s) in {:?}: {} -> {} vertices, {} -> {} edges, {} coverage update(s)",
            report.seeds_profiled,
            started.elapsed(),
            vertices,
            self.graph.vertex_count(),
            edges,
            self.graph.edge_count(),
            report.vertices_updated
        );

        let started = Instant::now();
        let pruned: PruneReport = prune(&mut self.graph, &self.blocks, &mut self.state);
        log::info!(
            "Pruned {} vertices in {:?}; {} vertices, {} edges remain",
            pruned.total(),
            started.elapsed(),
            self.graph.vertex_count(),
            self.graph.edge_count()
        );
        Ok(())
    }

    fn partition(&mut self) -> Result<(), CampaignError> {
        let started = Instant::now();
        let k = self.config.round_workers();
        let strategy = self.config.campaign.algorithm;
        let plan = match strategy {
            Strategy::Tree => partition_tree(
                &mut self.graph,
                k,
                &self.sources,
                self.config.campaign.score_cap,
            )?,
            Strategy::Naive => split_naive(&mut self.graph, k, &self.sources)?,
        };
        let files = plan.write_tasks(&self.layout.tasks())?;
        if let Some(tree) = &plan.arborescence {
            let path = self.layout.msa_dot();
            fs::write(&path, self.graph.to_dot(Some(tree.as_slice()))).map_err(io_error(&path))?;
        }
        for (file, task) in files.iter().zip(&plan.tasks) {
            log::debug!(
                "{}: {} vertices, {} obligations, weight {}",
                file.display(),
                task.vertices.len(),
                task.obligations.len(),
                task.weight
            );
        }
        log::info!(
            "{strategy} strategy wrote {} task file(s) from {} partition(s) in {:?}",
            files.len(),
            plan.partitions,
            started.elapsed()
        );
        Ok(())
    }

    fn dump_graph(&self) -> Result<(), CampaignError> {
        let dot = self.layout.callgraph_dot();
        fs::write(&dot, self.graph.to_dot(None)).map_err(io_error(&dot))?;
        let json = self.layout.callgraph_json();
        let snapshot = serde_json::to_string_pretty(&self.graph.snapshot())?;
        fs::write(&json, snapshot).map_err(io_error(&json))?;
        Ok(())
    }

    fn launch_round(&mut self, round: u32, phase: Phase) -> Result<(), CampaignError> {
        for index in 1..=self.config.round_workers() {
            if index > 1 && !self.pacer.pause(self.config.launch_stagger()) {
                return Err(CampaignError::Interrupted { round });
            }
            let spec = match phase {
                Phase::Scanning => self.commands.scanning(index, round),
                Phase::Exploiting => self.commands.task_bound(index, round),
            };
            log::info!("Launching {}: {}", spec.name, spec.command_line());
            let worker = self.launcher.launch(&spec)?;
            log::info!("{} started with pid {}", worker.name(), worker.pid());
            self.round_workers.push(worker);
            self.workers_launched += 1;
        }
        Ok(())
    }

    fn stop_round_workers(&mut self) {
        for mut worker in self.round_workers.drain(..) {
            stop(worker.as_mut());
        }
    }

    fn stop_monitor(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            stop(monitor.as_mut());
        }
    }
}

fn stop(worker: &mut dyn Worker) {
    log::debug!("Stopping {} (pid {})", worker.name(), worker.pid());
    if let Err(e) = worker.terminate() {
        log::warn!("Could not stop {} cleanly: {e}", worker.name());
    }
}

/// What `--check` reports without launching anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightReport {
    pub exploitation_rounds: u32,
    pub round_workers: usize,
    pub loaded_vertices: usize,
    pub loaded_edges: usize,
    pub pruned: PruneReport,
    pub vertices: usize,
    pub edges: usize,
    pub acyclic: bool,
}

impl fmt::Display for PreflightReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Rounds:       1 scanning + {} exploitation, {} round worker(s) each",
            self.exploitation_rounds, self.round_workers
        )?;
        writeln!(
            f,
            "Call graph:   {} vertices, {} edges as loaded",
            self.loaded_vertices, self.loaded_edges
        )?;
        writeln!(
            f,
            "Pruned:       {} uninstrumented, {} disconnected, {} unreachable",
            self.pruned.uninstrumented, self.pruned.disconnected, self.pruned.unreachable
        )?;
        write!(
            f,
            "After prune:  {} vertices, {} edges ({})",
            self.vertices,
            self.edges,
            if self.acyclic { "acyclic" } else { "cyclic" }
        )
    }
}

/// Validates the configuration and inputs and prunes a scratch copy of the
/// graph.
pub fn preflight(config: &CampaignConfig) -> Result<PreflightReport, CampaignError> {
    let exploitation_rounds = config.validate()?;
    let mut inputs = CampaignInputs::load(config)?;
    let (loaded_vertices, loaded_edges) = (inputs.graph.vertex_count(), inputs.graph.edge_count());
    let mut scratch = CampaignState::new();
    let pruned = prune(&mut inputs.graph, &inputs.blocks, &mut scratch);
    Ok(PreflightReport {
        exploitation_rounds,
        round_workers: config.round_workers(),
        loaded_vertices,
        loaded_edges,
        pruned,
        vertices: inputs.graph.vertex_count(),
        edges: inputs.graph.edge_count(),
        acyclic: inputs.graph.is_acyclic(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::WorkerSpec;
    use crate::profiler::{ProfileError, ProfileOutput};
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::rc::Rc;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct Journal {
        launched: Vec<WorkerSpec>,
        stopped: Vec<String>,
    }

    struct FakeWorker {
        name: String,
        pid: u32,
        journal: Rc<RefCell<Journal>>,
    }

    impl Worker for FakeWorker {
        fn name(&self) -> &str {
            &self.name
        }

        fn pid(&self) -> u32 {
            self.pid
        }

        fn terminate(&mut self) -> Result<(), WorkerError> {
            self.journal.borrow_mut().stopped.push(self.name.clone());
            Ok(())
        }
    }

    /// Records launches and leaves a log file behind like a real fuzzer.
    struct RecordingLauncher {
        journal: Rc<RefCell<Journal>>,
        fail_on: Option<String>,
    }

    impl WorkerLauncher for RecordingLauncher {
        fn launch(&mut self, spec: &WorkerSpec) -> Result<Box<dyn Worker>, WorkerError> {
            if self.fail_on.as_deref() == Some(spec.name.as_str()) {
                return Err(WorkerError::Spawn {
                    name: spec.name.clone(),
                    program: spec.program.display().to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such fuzzer"),
                });
            }
            if let Some(log) = &spec.log_file {
                fs::write(log, format!("{}\n", spec.command_line())).unwrap();
            }
            let mut journal = self.journal.borrow_mut();
            journal.launched.push(spec.clone());
            Ok(Box::new(FakeWorker {
                name: spec.name.clone(),
                pid: 1000 + journal.launched.len() as u32,
                journal: Rc::clone(&self.journal),
            }))
        }
    }

    /// Returns the same profiling output every pass and records how many
    /// seeds each pass was given.
    struct CannedProfiler {
        output: ProfileOutput,
        passes: Rc<RefCell<Vec<usize>>>,
    }

    impl ProfilingBackend for CannedProfiler {
        fn profile(&mut self, seeds: &[PathBuf]) -> Result<ProfileOutput, ProfileError> {
            self.passes.borrow_mut().push(seeds.len());
            Ok(self.output.clone())
        }
    }

    /// Never sleeps; optionally reports an interruption on the n-th pause.
    struct ScriptedPacer {
        pauses: Rc<RefCell<Vec<Duration>>>,
        interrupt_at: Option<usize>,
    }

    impl Pacer for ScriptedPacer {
        fn pause(&mut self, duration: Duration) -> bool {
            let mut pauses = self.pauses.borrow_mut();
            pauses.push(duration);
            self.interrupt_at != Some(pauses.len())
        }
    }

    const DOT: &str = r#"digraph "Call graph" {
	Node0x1 [shape=record,label="{main}"];
	Node0x1 -> Node0x2;
	Node0x1 -> Node0x3;
	Node0x2 [shape=record,label="{parse}"];
	Node0x2 -> Node0x4;
	Node0x3 [shape=record,label="{render}"];
	Node0x4 [shape=record,label="{inflate}"];
	Node0x5 [shape=record,label="{unused}"];
}
"#;

    const FUNC_IDS: &str = "main.c:main 1\nparse.c:parse 2\nrender.c:render 3\n\
                            zlib.c:inflate 4\nzlib.c:crc 5\n";

    // `unused` has no blocks; `crc` only ever shows up dynamically.
    const FUNC_BBS: &str = "main.c:main:4\nparse.c:parse:10\nrender.c:render:6\n\
                            zlib.c:inflate:20\nzlib.c:crc:8\n";

    const CALL_LOG: &str = "Function: zlib.c:inflate->crc\nFunction: zlib.c:inflate->crc\n";

    const GCOV: &str = "Function 'parse'\nLines executed:50.00% of 10\n\
                        Taken at least once:50.00% of 10\n\n\
                        Function 'inflate'\nTaken at least once:25.00% of 20\n\n\
                        File 'src/zlib.c'\nLines executed:30.00% of 40\n\n";

    struct Fixture {
        dir: TempDir,
        journal: Rc<RefCell<Journal>>,
        passes: Rc<RefCell<Vec<usize>>>,
        pauses: Rc<RefCell<Vec<Duration>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path();
            fs::write(root.join("callgraph.dot"), DOT).unwrap();
            fs::write(root.join("func_ids.log"), FUNC_IDS).unwrap();
            fs::write(root.join("func_bbs.log"), FUNC_BBS).unwrap();
            fs::create_dir(root.join("corpus")).unwrap();
            fs::write(root.join("corpus/a.png"), b"PNG").unwrap();
            Self {
                dir,
                journal: Rc::default(),
                passes: Rc::default(),
                pauses: Rc::default(),
            }
        }

        fn out_dir(&self) -> PathBuf {
            self.dir.path().join("out")
        }

        fn config(&self, algorithm: &str) -> CampaignConfig {
            let root = self.dir.path().display();
            let text = format!(
                r#"
[campaign]
out-dir = "{root}/out"
seed-corpus = "{root}/corpus"
worker-count = 3
total-timeout-secs = 30
scanning-timeout-secs = 10
exploitation-timeout-secs = 10
launch-stagger-ms = 250
algorithm = "{algorithm}"

[inputs]
call-graph = "{root}/callgraph.dot"
func-ids = "{root}/func_ids.log"
func-bbs = "{root}/func_bbs.log"

[fuzzer]
afl-binary = "/bin/target.afl"
task-binary = "/bin/target.horse"

[profiling]
profiling-binary = "/bin/target.prof"
gcov-binary = "/bin/target.gcov"
gcov-folder = "{root}/gcov"
"#
            );
            CampaignConfig::from_toml(&text).unwrap()
        }

        /// The monitor's queue as it looks once the campaign has been running.
        fn seed_monitor_queue(&self) {
            let queue = CampaignLayout::new(&self.out_dir()).monitor_queue();
            fs::create_dir_all(&queue).unwrap();
            fs::write(queue.join("id:000000,orig:a.png"), b"PNG").unwrap();
            fs::write(queue.join("id:000001,src:000000,op:havoc"), b"PNX").unwrap();
            fs::write(queue.join("id:000002,src:000000,op:flip1,+cov"), b"PNG!").unwrap();
        }

        fn scheduler(
            &self,
            config: CampaignConfig,
            fail_on: Option<&str>,
            interrupt_at: Option<usize>,
        ) -> CampaignScheduler {
            let inputs = CampaignInputs::load(&config).unwrap();
            CampaignScheduler::new(
                config,
                inputs,
                Box::new(RecordingLauncher {
                    journal: Rc::clone(&self.journal),
                    fail_on: fail_on.map(str::to_string),
                }),
                Box::new(CannedProfiler {
                    output: ProfileOutput {
                        call_log: CALL_LOG.to_string(),
                        coverage_report: GCOV.to_string(),
                    },
                    passes: Rc::clone(&self.passes),
                }),
                Box::new(ScriptedPacer {
                    pauses: Rc::clone(&self.pauses),
                    interrupt_at,
                }),
            )
            .unwrap()
        }

        fn launched_names(&self) -> Vec<String> {
            self.journal
                .borrow()
                .launched
                .iter()
                .map(|s| s.name.clone())
                .collect()
        }
    }

    #[test]
    fn full_campaign_runs_one_scanning_and_two_exploitation_rounds() {
        let fx = Fixture::new();
        fx.seed_monitor_queue();
        let summary = fx.scheduler(fx.config("tree"), None, None).run().unwrap();

        assert_eq!(summary.rounds_run, 3);
        assert_eq!(summary.exploitation_rounds, 2);
        assert_eq!(summary.workers_launched, 7, "Monitor plus two workers per round");
        assert_eq!(
            fx.launched_names(),
            ["monitor", "fuzzer_1", "fuzzer_2", "fuzzer_3", "fuzzer_4", "fuzzer_5", "fuzzer_6"]
        );

        let journal = fx.journal.borrow();
        let programs: Vec<String> = journal
            .launched
            .iter()
            .map(|s| s.program.display().to_string())
            .collect();
        assert_eq!(
            programs,
            ["afl-fuzz", "afl-fuzz", "afl-fuzz", "horse-fuzz", "horse-fuzz", "horse-fuzz", "horse-fuzz"]
        );
        assert_eq!(journal.stopped.len(), 7, "Every worker is stopped exactly once");
        assert_eq!(journal.stopped.last().map(String::as_str), Some("monitor"));
        assert_eq!(&journal.stopped[..2], ["fuzzer_1", "fuzzer_2"]);
        drop(journal);

        // First refresh profiles the whole queue, the second finds nothing new.
        assert_eq!(*fx.passes.borrow(), [3, 0]);
        assert_eq!(summary.profiled_seeds, 3);

        // crc joined from the call log; unused was pruned for lack of blocks.
        assert_eq!(summary.vertices, 5);
        assert_eq!(summary.edges, 4);
        assert_eq!(summary.spare_functions, 1);

        let out = fx.out_dir();
        let active = out.join("active_runs");
        assert!(out.join("backup_round_1/fuzzer_1.log").is_file());
        assert!(out.join("backup_round_1/seeds/seed_1").is_file());
        assert!(out.join("backup_round_1/callgraph.dot").is_file());
        assert!(out.join("backup_round_2/tasks/task_2.txt").is_file());
        assert!(out.join("backup_round_2/fuzzer_4.log").is_file());
        assert!(!out.join("backup_round_3").exists(), "The last round is never rotated");
        assert!(active.join("tasks/task_1.txt").is_file());
        assert!(active.join("tasks/msa.dot").is_file());
        assert!(active.join("callgraph.json").is_file());
        assert!(active.join("fuzzer_6.log").is_file());

        // Round 3 staged only the original and the coverage-increasing seed.
        let staged = fs::read_dir(active.join("seeds")).unwrap().count();
        assert_eq!(staged, 2);

        let mut obligations = String::new();
        for n in 1..=2 {
            obligations += &fs::read_to_string(active.join(format!("tasks/task_{n}.txt"))).unwrap();
        }
        for expected in ["main.c:main", "parse.c:parse", "render.c:render", "zlib.c:inflate", "zlib.c:crc"] {
            assert!(
                obligations.lines().any(|l| l == expected),
                "Missing obligation {expected} in:\n{obligations}"
            );
        }
    }

    #[test]
    fn pacing_staggers_launches_and_waits_out_each_phase() {
        let fx = Fixture::new();
        fx.scheduler(fx.config("naive"), None, None).run().unwrap();

        let stagger = Duration::from_millis(250);
        let phase = Duration::from_secs(10);
        assert_eq!(
            *fx.pauses.borrow(),
            [stagger, stagger, phase, stagger, phase, stagger, phase],
            "After the monitor, between round workers, then the phase timeout"
        );
    }

    #[test]
    fn naive_strategy_writes_tasks_without_tree() {
        let fx = Fixture::new();
        fx.seed_monitor_queue();
        fx.scheduler(fx.config("naive"), None, None).run().unwrap();

        let tasks = fx.out_dir().join("active_runs/tasks");
        assert!(tasks.join("task_1.txt").is_file());
        assert!(tasks.join("task_2.txt").is_file());
        assert!(!tasks.join("msa.dot").exists());
    }

    #[test]
    fn launch_failure_stops_everything_already_running() {
        let fx = Fixture::new();
        let err = fx
            .scheduler(fx.config("tree"), Some("fuzzer_4"), None)
            .run()
            .unwrap_err();
        assert!(
            matches!(err, CampaignError::WorkerLaunch(WorkerError::Spawn { ref name, .. }) if name == "fuzzer_4"),
            "Unexpected error: {err}"
        );

        let journal = fx.journal.borrow();
        assert_eq!(
            journal.stopped,
            ["fuzzer_1", "fuzzer_2", "fuzzer_3", "monitor"],
            "Round 2's first worker and the monitor must be stopped on abort"
        );
    }

    #[test]
    fn interruption_during_a_phase_aborts_gracefully() {
        let fx = Fixture::new();
        // Pauses: monitor stagger, worker stagger, then round 1's phase wait.
        let err = fx
            .scheduler(fx.config("tree"), None, Some(3))
            .run()
            .unwrap_err();
        assert!(matches!(err, CampaignError::Interrupted { round: 1 }), "Got {err}");
        assert_eq!(fx.journal.borrow().stopped, ["fuzzer_1", "fuzzer_2", "monitor"]);
        assert!(!fx.out_dir().join("backup_round_1").exists());
    }

    #[test]
    fn empty_corpus_fails_before_any_launch() {
        let fx = Fixture::new();
        fs::remove_file(fx.dir.path().join("corpus/a.png")).unwrap();
        let err = fx.scheduler(fx.config("tree"), None, None).run().unwrap_err();
        assert!(matches!(
            err,
            CampaignError::SeedStaging(StagingError::EmptyCorpus(_))
        ));
        assert!(fx.journal.borrow().launched.is_empty());
    }

    #[test]
    fn invalid_timing_is_rejected_at_construction() {
        let fx = Fixture::new();
        let mut config = fx.config("tree");
        config.campaign.exploitation_timeout_secs = 7;
        let inputs = CampaignInputs::load(&config).unwrap();
        let result = CampaignScheduler::new(
            config,
            inputs,
            Box::new(RecordingLauncher {
                journal: Rc::clone(&fx.journal),
                fail_on: None,
            }),
            Box::new(CannedProfiler {
                output: ProfileOutput::default(),
                passes: Rc::clone(&fx.passes),
            }),
            Box::new(ScriptedPacer {
                pauses: Rc::clone(&fx.pauses),
                interrupt_at: None,
            }),
        );
        assert!(matches!(
            result,
            Err(CampaignError::Config(ConfigError::NonIntegralRounds { .. }))
        ));
    }

    #[test]
    fn missing_entry_is_a_malformed_graph() {
        let fx = Fixture::new();
        let mut config = fx.config("tree");
        config.campaign.entry_function = "start".to_string();
        assert!(matches!(
            CampaignInputs::load(&config),
            Err(CampaignError::MalformedGraph(GraphError::NoEntry(_)))
        ));
    }

    #[test]
    fn preflight_reports_pruned_graph() {
        let fx = Fixture::new();
        let report = preflight(&fx.config("tree")).unwrap();
        assert_eq!(report.exploitation_rounds, 2);
        assert_eq!(report.round_workers, 2);
        assert_eq!(report.loaded_vertices, 5);
        assert_eq!(report.pruned.uninstrumented, 1);
        assert_eq!(report.vertices, 4);
        assert_eq!(report.edges, 3);
        assert!(report.acyclic);
        assert!(report.to_string().contains("1 scanning + 2 exploitation"));
    }

    #[test]
    fn sleep_pacer_returns_early_when_interrupted() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut pacer = SleepPacer::new(Arc::clone(&flag));
        let started = Instant::now();
        assert!(!pacer.pause(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(5));

        flag.store(false, Ordering::SeqCst);
        assert!(pacer.pause(Duration::from_millis(10)));
    }
}
