use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// File the gcov summarizer script leaves in the gcov folder.
pub const GCOV_LOG: &str = "gcov.log";

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Error waiting for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Profiling I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Raw textual output of one profiling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileOutput {
    /// Contents of the call log written by the profiling binary.
    pub call_log: String,
    /// gcov function/file summary.
    pub coverage_report: String,
}

/// Runs the instrumented profiling binaries over a set of seeds.
pub trait ProfilingBackend {
    /// Executes every seed and returns the collected call log and coverage
    /// summary. Individual seed failures and timeouts are not errors.
    fn profile(&mut self, seeds: &[PathBuf]) -> Result<ProfileOutput, ProfileError>;
}

#[derive(Debug, Clone)]
pub struct CommandProfilerConfig {
    pub profiling_binary: PathBuf,
    pub gcov_binary: PathBuf,
    pub gcov_folder: PathBuf,
    pub gcov_script: PathBuf,
    pub call_log: PathBuf,
    pub pre_args: Vec<String>,
    pub post_args: Vec<String>,
    pub seed_timeout: Duration,
}

pub struct CommandProfiler {
    config: CommandProfilerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Exited(ExitStatus),
    TimedOut,
}

impl CommandProfiler {
    pub fn new(config: CommandProfilerConfig) -> Self {
        Self { config }
    }

    fn seed_command(&self, program: &Path, seed: &Path) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(&self.config.pre_args)
            .arg(seed)
            .args(&self.config.post_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    fn run_and_wait_with_timeout(
        &self,
        program: &Path,
        mut child: Child,
        timeout: Duration,
    ) -> Result<RunOutcome, ProfileError> {
        let start_time = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(RunOutcome::Exited(status)),
                Ok(None) => {
                    if start_time.elapsed() > timeout {
                        if let Err(e) = child.kill() {
                            log::warn!("Failed to kill timed-out {}: {e}", program.display());
                        }
                        match child.wait() {
                            Ok(status) => log::debug!(
                                "Reaped timed-out {}: {status}",
                                program.display()
                            ),
                            Err(e) => log::debug!(
                                "Failed to reap timed-out {}: {e}",
                                program.display()
                            ),
                        }
                        return Ok(RunOutcome::TimedOut);
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(source) => {
                    return Err(ProfileError::Wait {
                        program: program.display().to_string(),
                        source,
                    });
                }
            }
        }
    }

    fn run_seed(&self, program: &Path, seed: &Path) -> Result<RunOutcome, ProfileError> {
        let child = self
            .seed_command(program, seed)
            .spawn()
            .map_err(|source| ProfileError::Spawn {
                program: program.display().to_string(),
                source,
            })?;
        let outcome = self.run_and_wait_with_timeout(program, child, self.config.seed_timeout)?;
        if outcome == RunOutcome::TimedOut {
            log::debug!(
                "{} timed out on seed {}",
                program.display(),
                seed.display()
            );
        }
        Ok(outcome)
    }

    fn summarize_gcov(&self) -> Result<(), ProfileError> {
        let script = &self.config.gcov_script;
        let status = Command::new(script)
            .arg(&self.config.gcov_folder)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| ProfileError::Spawn {
                program: script.display().to_string(),
                source,
            })?;
        if !status.success() {
            log::warn!("{} exited with {status}", script.display());
        }
        Ok(())
    }

    fn clear_call_log(&self) -> Result<(), ProfileError> {
        match fs::remove_file(&self.config.call_log) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ProfileError::Io {
                path: self.config.call_log.display().to_string(),
                source,
            }),
        }
    }
}

fn read_or_empty(path: &Path) -> Result<String, ProfileError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::warn!("{} was not produced; treating it as empty", path.display());
            Ok(String::new())
        }
        Err(source) => Err(ProfileError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

impl ProfilingBackend for CommandProfiler {
    fn profile(&mut self, seeds: &[PathBuf]) -> Result<ProfileOutput, ProfileError> {
        self.clear_call_log()?;
        let mut timeouts = 0usize;
        for seed in seeds {
            for program in [&self.config.profiling_binary, &self.config.gcov_binary] {
                if self.run_seed(program, seed)? == RunOutcome::TimedOut {
                    timeouts += 1;
                }
            }
        }
        if timeouts > 0 {
            log::info!("{timeouts} profiling run(s) hit the per-seed timeout");
        }
        self.summarize_gcov()?;
        Ok(ProfileOutput {
            call_log: read_or_empty(&self.config.call_log)?,
            coverage_report: read_or_empty(&self.config.gcov_folder.join(GCOV_LOG))?,
        })
    }
}
