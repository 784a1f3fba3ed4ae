use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Directory layout of a campaign under its output folder.
///
/// ```text
/// <out>/active_runs/            fuzzer output dir shared by the whole fleet
///     seeds_origin/             copy of the operator's corpus
///     seeds/                    seeds staged for the current round
///     tasks/                    task_<n>.txt and msa.dot
///     monitor/queue/            the monitor's queue
///     fuzzer_<n>/, fuzzer_<n>.log
///     callgraph.dot, callgraph.json
/// <out>/backup_round_<r>/       artifacts of finished round r
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignLayout {
    out_dir: PathBuf,
    active: PathBuf,
}

pub const MONITOR_NAME: &str = "monitor";

impl CampaignLayout {
    pub fn new(out_dir: &Path) -> Self {
        Self {
            out_dir: out_dir.to_path_buf(),
            active: out_dir.join("active_runs"),
        }
    }

    /// Creates the directories that must exist before the monitor starts.
    pub fn create(&self) -> io::Result<()> {
        for dir in [self.seeds_origin(), self.seeds(), self.tasks()] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn active_runs(&self) -> &Path {
        &self.active
    }

    pub fn seeds_origin(&self) -> PathBuf {
        self.active.join("seeds_origin")
    }

    pub fn seeds(&self) -> PathBuf {
        self.active.join("seeds")
    }

    pub fn tasks(&self) -> PathBuf {
        self.active.join("tasks")
    }

    pub fn monitor_queue(&self) -> PathBuf {
        self.active.join(MONITOR_NAME).join("queue")
    }

    pub fn callgraph_dot(&self) -> PathBuf {
        self.active.join("callgraph.dot")
    }

    pub fn callgraph_json(&self) -> PathBuf {
        self.active.join("callgraph.json")
    }

    pub fn msa_dot(&self) -> PathBuf {
        self.tasks().join("msa.dot")
    }

    pub fn monitor_log(&self) -> PathBuf {
        self.active.join(format!("{MONITOR_NAME}.log"))
    }

    pub fn worker_dir(&self, name: &str) -> PathBuf {
        self.active.join(name)
    }

    pub fn worker_log(&self, name: &str) -> PathBuf {
        self.active.join(format!("{name}.log"))
    }

    pub fn backup_dir(&self, round: u32) -> PathBuf {
        self.out_dir.join(format!("backup_round_{round}"))
    }
}

/// Campaign-unique name of the `index`-th (1-based) round worker of `round`.
pub fn worker_name(index: usize, round: u32, round_workers: usize) -> String {
    let number = index + round_workers * (round.saturating_sub(1) as usize);
    format!("fuzzer_{number}")
}
