use crate::config::CampaignConfig;
use crate::executor::WorkerSpec;
use crate::layout::{CampaignLayout, MONITOR_NAME, worker_name};
use crate::partition::task_file;
use std::path::{Path, PathBuf};

/// Banner the monitor shows in its status screen.
const MONITOR_BANNER: &str = "teamfuzz-monitor";

/// Builds the command lines of the monitor and of every round worker.
#[derive(Debug, Clone)]
pub struct FleetCommands {
    layout: CampaignLayout,
    afl_fuzz: PathBuf,
    task_fuzz: PathBuf,
    afl_binary: PathBuf,
    task_binary: PathBuf,
    dictionary: Option<PathBuf>,
    memory_limit: String,
    exec_timeout: String,
    pre_args: Vec<String>,
    post_args: Vec<String>,
    round_workers: usize,
}

impl FleetCommands {
    pub fn new(config: &CampaignConfig, layout: &CampaignLayout) -> Self {
        let f = &config.fuzzer;
        Self {
            layout: layout.clone(),
            afl_fuzz: f.afl_fuzz.clone(),
            task_fuzz: f.task_fuzz.clone(),
            afl_binary: f.afl_binary.clone(),
            task_binary: f.task_binary.clone(),
            dictionary: f.dictionary.clone(),
            memory_limit: f.memory_limit.clone(),
            exec_timeout: f.exec_timeout.clone(),
            pre_args: f.pre_args.clone(),
            post_args: f.post_args.clone(),
            round_workers: config.round_workers(),
        }
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            self.memory_limit.clone(),
            "-t".to_string(),
            self.exec_timeout.clone(),
        ];
        if let Some(dict) = &self.dictionary {
            args.push("-x".to_string());
            args.push(path_arg(dict));
        }
        args.push("-o".to_string());
        args.push(path_arg(self.layout.active_runs()));
        args
    }

    fn target_args(&self, binary: &Path) -> Vec<String> {
        let mut args = vec!["--".to_string(), path_arg(binary)];
        args.extend(self.pre_args.iter().cloned());
        args.push("@@".to_string());
        args.extend(self.post_args.iter().cloned());
        args
    }

    /// The long-lived generic worker fed from the original corpus.
    pub fn monitor(&self) -> WorkerSpec {
        let mut args = self.common_args();
        args.extend([
            "-i".to_string(),
            path_arg(&self.layout.seeds_origin()),
            "-S".to_string(),
            MONITOR_NAME.to_string(),
            "-T".to_string(),
            MONITOR_BANNER.to_string(),
        ]);
        args.extend(self.target_args(&self.afl_binary));
        WorkerSpec {
            name: MONITOR_NAME.to_string(),
            program: self.afl_fuzz.clone(),
            args,
            working_dir: None,
            log_file: Some(self.layout.monitor_log()),
        }
    }

    /// Generic-strategy round worker `index` (1-based) of a scanning round.
    pub fn scanning(&self, index: usize, round: u32) -> WorkerSpec {
        let name = worker_name(index, round, self.round_workers);
        let mut args = self.common_args();
        args.extend([
            "-i".to_string(),
            path_arg(&self.layout.seeds()),
            "-S".to_string(),
            name.clone(),
        ]);
        args.extend(self.target_args(&self.afl_binary));
        WorkerSpec {
            log_file: Some(self.layout.worker_log(&name)),
            name,
            program: self.afl_fuzz.clone(),
            args,
            working_dir: None,
        }
    }

    /// Task-bound round worker `index` (1-based), restricted to `task_<index>.txt`.
    pub fn task_bound(&self, index: usize, round: u32) -> WorkerSpec {
        let name = worker_name(index, round, self.round_workers);
        let mut args = self.common_args();
        args.extend([
            "-i".to_string(),
            path_arg(&self.layout.seeds()),
            "-S".to_string(),
            name.clone(),
            "-p".to_string(),
            path_arg(&task_file(&self.layout.tasks(), index)),
        ]);
        args.extend(self.target_args(&self.task_binary));
        WorkerSpec {
            log_file: Some(self.layout.worker_log(&name)),
            name,
            program: self.task_fuzz.clone(),
            args,
            working_dir: None,
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;

    fn commands() -> FleetCommands {
        let config = CampaignConfig::from_toml(SAMPLE).unwrap();
        let layout = CampaignLayout::new(&config.campaign.out_dir);
        FleetCommands::new(&config, &layout)
    }

    #[test]
    fn monitor_reads_original_corpus() {
        let spec = commands().monitor();
        assert_eq!(spec.name, "monitor");
        assert_eq!(
            spec.command_line(),
            "afl-fuzz -m 1G -t 20000+ -x /work/png.dict -o /work/out/active_runs \
             -i /work/out/active_runs/seeds_origin -S monitor -T teamfuzz-monitor \
             -- /work/bin/target.afl -d @@"
        );
        assert_eq!(
            spec.log_file,
            Some(PathBuf::from("/work/out/active_runs/monitor.log"))
        );
    }

    #[test]
    fn scanning_workers_are_numbered_across_rounds() {
        let spec = commands().scanning(2, 1);
        assert_eq!(spec.name, "fuzzer_2");
        assert_eq!(
            spec.command_line(),
            "afl-fuzz -m 1G -t 20000+ -x /work/png.dict -o /work/out/active_runs \
             -i /work/out/active_runs/seeds -S fuzzer_2 -- /work/bin/target.afl -d @@"
        );
        assert_eq!(commands().scanning(1, 3).name, "fuzzer_7");
    }

    #[test]
    fn task_bound_worker_gets_its_task_file() {
        let spec = commands().task_bound(3, 2);
        assert_eq!(spec.name, "fuzzer_6");
        assert_eq!(spec.program, PathBuf::from("horse-fuzz"));
        let line = spec.command_line();
        assert!(
            line.contains("-S fuzzer_6 -p /work/out/active_runs/tasks/task_3.txt -- /work/bin/target.horse -d @@"),
            "Unexpected command line: {line}"
        );
        assert_eq!(
            spec.log_file,
            Some(PathBuf::from("/work/out/active_runs/fuzzer_6.log"))
        );
    }
}
