//! Instance process spawning.

use chrono::{DateTime, Utc};
use procmesh_core::InstanceSpec;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::os;

/// A freshly spawned instance process.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub child: Child,
    pub pid: u32,

    /// Kernel start time, for PID reuse detection.
    pub start_ticks: Option<u64>,

    pub stdout_log: PathBuf,

    /// Length of the stdout log before this process wrote to it. Output
    /// left by earlier runs of the same instance lies before this offset.
    pub stdout_offset: u64,

    pub stderr_log: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// Launches instances as background processes with captured output.
///
/// Each process:
/// - leads its own process group, so teardown can kill its whole tree
/// - appends stdout/stderr to `<log_dir>/<instance>.stdout.log` / `.stderr.log`
/// - reads from `/dev/null`
/// - survives the orchestrator being dropped (detached runs)
#[derive(Debug, Clone)]
pub struct Spawner {
    log_dir: PathBuf,
}

impl Spawner {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn stdout_log(&self, instance: &str) -> PathBuf {
        self.log_dir.join(format!("{}.stdout.log", instance))
    }

    pub fn stderr_log(&self, instance: &str) -> PathBuf {
        self.log_dir.join(format!("{}.stderr.log", instance))
    }

    /// Spawn one instance. Returns promptly: the call never waits on the
    /// child beyond `fork`/`exec`.
    pub fn spawn(&self, instance: &InstanceSpec) -> std::io::Result<SpawnedProcess> {
        // Validate command
        let Some((exe, args)) = instance.command.split_first() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("instance {} has empty command", instance.name),
            ));
        };

        std::fs::create_dir_all(&self.log_dir)?;
        let stdout_log = self.stdout_log(&instance.name);
        let stderr_log = self.stderr_log(&instance.name);
        let stdout_offset = std::fs::metadata(&stdout_log).map(|m| m.len()).unwrap_or(0);

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .envs(&instance.env)
            .stdin(Stdio::null())
            .stdout(open_log(&stdout_log)?)
            .stderr(open_log(&stderr_log)?)
            .kill_on_drop(false);
        if let Some(dir) = &instance.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("instance {} exited before its pid was read", instance.name),
            )
        })?;

        Ok(SpawnedProcess {
            child,
            pid,
            start_ticks: os::start_ticks(pid),
            stdout_log,
            stdout_offset,
            stderr_log,
            started_at: Utc::now(),
        })
    }
}

fn open_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
