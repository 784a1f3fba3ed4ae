use crate::partition::{ScoreCap, Strategy};
use crate::profiler::CommandProfilerConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker-count must be at least 2 (one monitor plus round workers), got {0}")]
    TooFewWorkers(usize),
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("scanning-timeout-secs ({scanning}) exceeds total-timeout-secs ({total})")]
    ScanningExceedsTotal { scanning: u64, total: u64 },
    #[error(
        "total minus scanning time ({remaining}s) is not a whole number of {exploitation}s exploitation rounds"
    )]
    NonIntegralRounds { remaining: u64, exploitation: u64 },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignSettings {
    pub out_dir: PathBuf,
    pub seed_corpus: PathBuf,
    pub worker_count: usize,
    pub total_timeout_secs: u64,
    pub scanning_timeout_secs: u64,
    pub exploitation_timeout_secs: u64,
    #[serde(default = "default_launch_stagger_ms")]
    pub launch_stagger_ms: u64,
    #[serde(default)]
    pub algorithm: Strategy,
    #[serde(default)]
    pub score_cap: ScoreCap,
    #[serde(default = "default_entry_function")]
    pub entry_function: String,
    pub log_file: Option<PathBuf>,
}

fn default_launch_stagger_ms() -> u64 {
    5000
}

pub fn default_entry_function() -> String {
    "main".to_string()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct InputFiles {
    pub call_graph: PathBuf,
    pub func_ids: PathBuf,
    pub func_bbs: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_afl_fuzz")]
    pub afl_fuzz: PathBuf,
    #[serde(default = "default_task_fuzz")]
    pub task_fuzz: PathBuf,
    pub afl_binary: PathBuf,
    pub task_binary: PathBuf,
    pub dictionary: Option<PathBuf>,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout: String,
    #[serde(default)]
    pub pre_args: Vec<String>,
    #[serde(default)]
    pub post_args: Vec<String>,
}

fn default_afl_fuzz() -> PathBuf {
    PathBuf::from("afl-fuzz")
}

fn default_task_fuzz() -> PathBuf {
    PathBuf::from("horse-fuzz")
}

fn default_memory_limit() -> String {
    "1G".to_string()
}

fn default_exec_timeout() -> String {
    "20000+".to_string()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ProfilingSettings {
    pub profiling_binary: PathBuf,
    pub gcov_binary: PathBuf,
    pub gcov_folder: PathBuf,
    #[serde(default = "default_gcov_script")]
    pub gcov_script: PathBuf,
    /// Defaults to `/tmp/<profiling binary name>/covered_functions.log`.
    pub call_log: Option<PathBuf>,
    #[serde(default = "default_seed_timeout_ms")]
    pub seed_timeout_ms: u64,
}

fn default_gcov_script() -> PathBuf {
    PathBuf::from("run-gcov.sh")
}

fn default_seed_timeout_ms() -> u64 {
    5000
}

impl ProfilingSettings {
    pub fn call_log_path(&self) -> PathBuf {
        match &self.call_log {
            Some(path) => path.clone(),
            None => {
                let binary = self
                    .profiling_binary
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "target".to_string());
                Path::new("/tmp").join(binary).join("covered_functions.log")
            }
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    pub campaign: CampaignSettings,
    pub inputs: InputFiles,
    pub fuzzer: FuzzerSettings,
    pub profiling: ProfilingSettings,
}

impl CampaignConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        Self::from_toml(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Checks the timing and fleet settings, returning the number of
    /// exploitation rounds that follow the single scanning round.
    pub fn validate(&self) -> Result<u32, ConfigError> {
        let c = &self.campaign;
        if c.worker_count < 2 {
            return Err(ConfigError::TooFewWorkers(c.worker_count));
        }
        for (name, value) in [
            ("total-timeout-secs", c.total_timeout_secs),
            ("scanning-timeout-secs", c.scanning_timeout_secs),
            ("exploitation-timeout-secs", c.exploitation_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }
        if c.scanning_timeout_secs > c.total_timeout_secs {
            return Err(ConfigError::ScanningExceedsTotal {
                scanning: c.scanning_timeout_secs,
                total: c.total_timeout_secs,
            });
        }
        let remaining = c.total_timeout_secs - c.scanning_timeout_secs;
        if !remaining.is_multiple_of(c.exploitation_timeout_secs) {
            return Err(ConfigError::NonIntegralRounds {
                remaining,
                exploitation: c.exploitation_timeout_secs,
            });
        }
        Ok((remaining / c.exploitation_timeout_secs) as u32)
    }

    /// Round workers per round; one slot of the fleet is the monitor.
    pub fn round_workers(&self) -> usize {
        self.campaign.worker_count.saturating_sub(1)
    }

    pub fn scanning_timeout(&self) -> Duration {
        Duration::from_secs(self.campaign.scanning_timeout_secs)
    }

    pub fn exploitation_timeout(&self) -> Duration {
        Duration::from_secs(self.campaign.exploitation_timeout_secs)
    }

    pub fn launch_stagger(&self) -> Duration {
        Duration::from_millis(self.campaign.launch_stagger_ms)
    }

    pub fn profiler_config(&self) -> CommandProfilerConfig {
        let p = &self.profiling;
        CommandProfilerConfig {
            profiling_binary: p.profiling_binary.clone(),
            gcov_binary: p.gcov_binary.clone(),
            gcov_folder: p.gcov_folder.clone(),
            gcov_script: p.gcov_script.clone(),
            call_log: p.call_log_path(),
            pre_args: self.fuzzer.pre_args.clone(),
            post_args: self.fuzzer.post_args.clone(),
            seed_timeout: Duration::from_millis(p.seed_timeout_ms),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = r#"
[campaign]
out-dir = "/work/out"
seed-corpus = "/work/seeds"
worker-count = 4
total-timeout-secs = 7200
scanning-timeout-secs = 1200
exploitation-timeout-secs = 1200
algorithm = "naive"
score-cap = "median-plus-mean"

[inputs]
call-graph = "callgraph.dot"
func-ids = "func_ids.log"
func-bbs = "func_bbs.log"

[fuzzer]
afl-binary = "/work/bin/target.afl"
task-binary = "/work/bin/target.horse"
dictionary = "/work/png.dict"
pre-args = ["-d"]

[profiling]
profiling-binary = "/work/bin/target.prof"
gcov-binary = "/work/bin/target.gcov"
gcov-folder = "/work/gcov"
"#;

    #[test]
    fn parses_sample_and_fills_defaults() {
        let config = CampaignConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.campaign.worker_count, 4);
        assert_eq!(config.campaign.algorithm, Strategy::Naive);
        assert_eq!(config.campaign.score_cap, ScoreCap::MedianPlusMean);
        assert_eq!(config.campaign.launch_stagger_ms, 5000);
        assert_eq!(config.campaign.entry_function, "main");
        assert_eq!(config.fuzzer.afl_fuzz, PathBuf::from("afl-fuzz"));
        assert_eq!(config.fuzzer.task_fuzz, PathBuf::from("horse-fuzz"));
        assert_eq!(config.fuzzer.memory_limit, "1G");
        assert_eq!(config.fuzzer.exec_timeout, "20000+");
        assert!(config.fuzzer.post_args.is_empty());
        assert_eq!(config.profiling.gcov_script, PathBuf::from("run-gcov.sh"));
        assert_eq!(
            config.profiling.call_log_path(),
            PathBuf::from("/tmp/target.prof/covered_functions.log")
        );
        assert_eq!(config.validate(), Ok(5));
        assert_eq!(config.round_workers(), 3);

        let profiler = config.profiler_config();
        assert_eq!(profiler.pre_args, ["-d"]);
        assert_eq!(profiler.seed_timeout, Duration::from_secs(5));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = SAMPLE.replace("worker-count = 4", "worker-count = 4\nthreads = 8");
        assert!(CampaignConfig::from_toml(&text).is_err());
    }

    #[test]
    fn validation_rejects_bad_fleets_and_timings() {
        let base = CampaignConfig::from_toml(SAMPLE).unwrap();

        let mut c = base.clone();
        c.campaign.worker_count = 1;
        assert_eq!(c.validate(), Err(ConfigError::TooFewWorkers(1)));

        let mut c = base.clone();
        c.campaign.exploitation_timeout_secs = 0;
        assert_eq!(
            c.validate(),
            Err(ConfigError::ZeroTimeout("exploitation-timeout-secs"))
        );

        let mut c = base.clone();
        c.campaign.scanning_timeout_secs = 9000;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::ScanningExceedsTotal { .. })
        ));

        let mut c = base.clone();
        c.campaign.exploitation_timeout_secs = 1300;
        assert_eq!(
            c.validate(),
            Err(ConfigError::NonIntegralRounds {
                remaining: 6000,
                exploitation: 1300
            })
        );

        let mut c = base;
        c.campaign.total_timeout_secs = 1200;
        assert_eq!(c.validate(), Ok(0), "A scanning-only campaign is allowed");
    }

    #[test]
    fn load_from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("campaign.toml");
        let err = CampaignConfig::load_from_file(&path).unwrap_err();
        assert!(err.to_string().contains("campaign.toml"));

        std::fs::write(&path, SAMPLE).unwrap();
        assert!(CampaignConfig::load_from_file(&path).is_ok());
    }
}
