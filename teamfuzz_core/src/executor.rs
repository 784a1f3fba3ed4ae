use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker '{name}' ({program}): {source}")]
    Spawn {
        name: String,
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to open log file {path} for worker '{name}': {source}")]
    LogFile {
        name: String,
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to signal worker '{name}' (pid {pid}): {source}")]
    Signal {
        name: String,
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("Error waiting for worker '{name}' (pid {pid}): {source}")]
    Wait {
        name: String,
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// Everything needed to start one fuzzing worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Where stdout and stderr go; inherited when `None`.
    pub log_file: Option<PathBuf>,
}

impl WorkerSpec {
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// A running worker process.
pub trait Worker {
    fn name(&self) -> &str;
    fn pid(&self) -> u32;
    /// Asks the worker to stop (SIGTERM) and blocks until it has exited.
    fn terminate(&mut self) -> Result<(), WorkerError>;
}

/// Starts workers. The scheduler only ever sees this seam, which lets tests
/// run whole campaigns without spawning fuzzers.
pub trait WorkerLauncher {
    fn launch(&mut self, spec: &WorkerSpec) -> Result<Box<dyn Worker>, WorkerError>;
}

#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl WorkerLauncher for ProcessLauncher {
    fn launch(&mut self, spec: &WorkerSpec) -> Result<Box<dyn Worker>, WorkerError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).stdin(Stdio::null());
        if let Some(cwd) = &spec.working_dir {
            cmd.current_dir(cwd);
        }
        if let Some(path) = &spec.log_file {
            let log_error = |source| WorkerError::LogFile {
                name: spec.name.clone(),
                path: path.display().to_string(),
                source,
            };
            let stdout = File::create(path).map_err(log_error)?;
            let stderr = stdout.try_clone().map_err(log_error)?;
            cmd.stdout(stdout).stderr(stderr);
        }

        let child = cmd.spawn().map_err(|source| WorkerError::Spawn {
            name: spec.name.clone(),
            program: spec.program.display().to_string(),
            source,
        })?;
        Ok(Box::new(ProcessWorker {
            name: spec.name.clone(),
            child,
            exit_status: None,
        }))
    }
}

#[derive(Debug)]
pub struct ProcessWorker {
    name: String,
    child: Child,
    exit_status: Option<ExitStatus>,
}

impl ProcessWorker {
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    #[cfg(unix)]
    fn send_sigterm(&mut self) -> Result<(), WorkerError> {
        let pid = self.child.id();
        // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs
        // to a child we have not yet reaped, so it cannot have been recycled.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            return Ok(());
        }
        let source = io::Error::last_os_error();
        if source.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(WorkerError::Signal {
            name: self.name.clone(),
            pid,
            source,
        })
    }

    #[cfg(not(unix))]
    fn send_sigterm(&mut self) -> Result<(), WorkerError> {
        let pid = self.child.id();
        self.child.kill().map_err(|source| WorkerError::Signal {
            name: self.name.clone(),
            pid,
            source,
        })
    }
}

impl Worker for ProcessWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn terminate(&mut self) -> Result<(), WorkerError> {
        if self.exit_status.is_some() {
            return Ok(());
        }
        let pid = self.child.id();
        let already_exited = self.child.try_wait().map_err(|source| WorkerError::Wait {
            name: self.name.clone(),
            pid,
            source,
        })?;
        if let Some(status) = already_exited {
            log::debug!("Worker {} (pid {pid}) had already exited: {status}", self.name);
            self.exit_status = Some(status);
            return Ok(());
        }
        self.send_sigterm()?;
        let status = self.child.wait().map_err(|source| WorkerError::Wait {
            name: self.name.clone(),
            pid,
            source,
        })?;
        log::debug!("Worker {} (pid {pid}) stopped: {status}", self.name);
        self.exit_status = Some(status);
        Ok(())
    }
}
