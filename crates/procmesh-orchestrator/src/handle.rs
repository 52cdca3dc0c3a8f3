//! Run handle: the registry of processes a run owns.
//!
//! The handle is the owner-of-record for every PID it tracks. Teardown in
//! owned mode only ever signals PIDs found here. Entries are never dropped:
//! a killed or exited process stays as a terminal tombstone, so status keeps
//! reporting `Killed` or `Exited` and a repeated teardown finds nothing to do.

use chrono::{DateTime, Utc};
use procmesh_core::{
    obs, InstanceSpec, InstanceState, RecordedInstance, RunRecord, TeardownFailure,
    TeardownReport, TeardownSpec, Terminated, METRICS,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::os::{self, KillOutcome};
use crate::spawner::SpawnedProcess;
use crate::status::Status;

/// One tracked instance process.
#[derive(Debug)]
pub(crate) struct TrackedProcess {
    pub role: String,
    pub index: Option<u32>,
    pub name: String,
    pub pid: u32,
    pub start_ticks: Option<u64>,

    /// Present when this process spawned the child; absent for handles
    /// restored from a run record.
    pub child: Option<Child>,

    pub state: InstanceState,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub running_at: Option<DateTime<Utc>>,
    pub stdout_log: Option<PathBuf>,

    /// Where this process's own output starts in `stdout_log`.
    pub stdout_offset: u64,
}

impl TrackedProcess {
    pub(crate) fn spawned(instance: &InstanceSpec, proc: SpawnedProcess) -> Self {
        Self {
            role: instance.role.clone(),
            index: instance.index,
            name: instance.name.clone(),
            pid: proc.pid,
            start_ticks: proc.start_ticks,
            child: Some(proc.child),
            state: InstanceState::Starting,
            exit_code: None,
            started_at: proc.started_at,
            running_at: None,
            stdout_log: Some(proc.stdout_log),
            stdout_offset: proc.stdout_offset,
        }
    }

    fn restored(rec: &RecordedInstance) -> Self {
        Self {
            role: rec.role.clone(),
            index: rec.index,
            name: rec.name.clone(),
            pid: rec.pid,
            start_ticks: rec.start_ticks,
            child: None,
            state: InstanceState::Running,
            exit_code: None,
            started_at: rec.started_at,
            running_at: Some(rec.started_at),
            stdout_log: None,
            stdout_offset: 0,
        }
    }

    /// Poll liveness without blocking. A process found dead while live
    /// is moved to `Exited` and reported once.
    pub(crate) fn poll(&mut self) -> bool {
        if !self.state.is_live() {
            return false;
        }

        let exited = match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => None,
                Ok(Some(status)) => Some(status.code()),
                // wait status unavailable; fall back to the process table
                Err(_) if os::is_same_live_process(self.pid, self.start_ticks) => None,
                Err(_) => Some(None),
            },
            None if os::is_same_live_process(self.pid, self.start_ticks) => None,
            None => Some(None),
        };

        match exited {
            None => true,
            Some(code) => {
                self.settle(InstanceState::Exited);
                self.exit_code = code;
                METRICS.inc_unexpected_exits();
                obs::emit_instance_exited(&self.name, self.pid, code);
                false
            }
        }
    }

    /// Enter a terminal state and release the child handle.
    fn settle(&mut self, next: InstanceState) {
        match self.state.transition(next) {
            Ok(state) => self.state = state,
            Err(e) => tracing::warn!(instance = %self.name, error = %e, "state not changed"),
        }
        self.child = None;
    }

    fn to_record(&self) -> RecordedInstance {
        RecordedInstance {
            role: self.role.clone(),
            index: self.index,
            name: self.name.clone(),
            pid: self.pid,
            start_ticks: self.start_ticks,
            started_at: self.started_at,
        }
    }
}

struct HandleInner {
    run_id: Uuid,
    plan_digest: String,
    count: i64,
    kill_wait: Duration,
    processes: Mutex<Vec<TrackedProcess>>,
}

/// Handle to every process group a run spawned.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct RunHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.inner.run_id)
            .field("plan_digest", &self.inner.plan_digest)
            .field("count", &self.inner.count)
            .field("processes", &self.len())
            .finish()
    }
}

impl RunHandle {
    pub fn new(plan_digest: impl Into<String>, count: i64, kill_wait: Duration) -> Self {
        Self::with_id(Uuid::new_v4(), plan_digest.into(), count, kill_wait, Vec::new())
    }

    /// Rebuild a handle for the processes of a detached run.
    pub fn from_record(record: &RunRecord, kill_wait: Duration) -> Self {
        Self::with_id(
            record.run_id,
            record.plan_digest.clone(),
            record.count,
            kill_wait,
            record.instances.iter().map(TrackedProcess::restored).collect(),
        )
    }

    fn with_id(
        run_id: Uuid,
        plan_digest: String,
        count: i64,
        kill_wait: Duration,
        processes: Vec<TrackedProcess>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                run_id,
                plan_digest,
                count,
                kill_wait,
                processes: Mutex::new(processes),
            }),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.inner.run_id
    }

    pub fn plan_digest(&self) -> &str {
        &self.inner.plan_digest
    }

    pub fn count(&self) -> i64 {
        self.inner.count
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<TrackedProcess>> {
        // a panic while holding the lock leaves the registry itself intact
        self.inner
            .processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of tracked processes, tombstones included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Instance names in spawn order.
    pub fn instance_names(&self) -> Vec<String> {
        self.lock().iter().map(|p| p.name.clone()).collect()
    }

    pub fn pid_of(&self, name: &str) -> Option<u32> {
        self.lock().iter().find(|p| p.name == name).map(|p| p.pid)
    }

    /// PIDs of every tracked process.
    pub fn pids(&self) -> Vec<u32> {
        self.lock().iter().map(|p| p.pid).collect()
    }

    pub(crate) fn track(&self, process: TrackedProcess) {
        self.lock().push(process);
    }

    /// Names of the instances still `Starting` or `Running`.
    pub fn live_names(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|p| p.state.is_live())
            .map(|p| p.name.clone())
            .collect()
    }

    /// Stdout log of an instance and the offset its output starts at, when
    /// output was captured.
    pub fn stdout_log(&self, name: &str) -> Option<(PathBuf, u64)> {
        self.lock()
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| Some((p.stdout_log.clone()?, p.stdout_offset)))
    }

    /// Poll the named instances; returns those found dead with exit codes.
    pub(crate) fn poll_names(&self, names: &[String]) -> Vec<(String, Option<i32>)> {
        let mut exited = Vec::new();
        for p in self.lock().iter_mut() {
            if names.contains(&p.name) && p.state.is_live() && !p.poll() {
                exited.push((p.name.clone(), p.exit_code));
            }
        }
        exited
    }

    /// Move the named `Starting` instances to `Running`.
    pub(crate) fn mark_running(&self, names: &[String], at: DateTime<Utc>) {
        for p in self.lock().iter_mut() {
            if names.contains(&p.name) && p.state == InstanceState::Starting {
                if let Ok(next) = p.state.transition(InstanceState::Running) {
                    p.state = next;
                    p.running_at = Some(at);
                }
            }
        }
    }

    /// Lazy, restartable liveness snapshot.
    pub fn status(&self) -> Status {
        Status::new(self.clone())
    }

    /// Poll every live process; returns how many were found newly exited.
    pub fn refresh(&self) -> usize {
        self.lock()
            .iter_mut()
            .filter(|p| p.state.is_live())
            .map(|p| p.poll())
            .filter(|alive| !alive)
            .count()
    }

    /// Number of processes currently `Starting` or `Running`.
    pub fn live_count(&self) -> usize {
        self.lock().iter().filter(|p| p.state.is_live()).count()
    }

    /// Poll liveness every `interval` until `cancel` fires or nothing is
    /// left alive. Unexpected exits are logged as warnings.
    pub async fn watch(&self, interval: Duration, cancel: &CancellationToken) {
        loop {
            self.refresh();
            if self.live_count() == 0 {
                tracing::warn!("no instance of the run is alive; stopping supervision");
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Record of the live processes, for detached runs.
    pub fn to_record(&self) -> RunRecord {
        let mut record = RunRecord::new(self.inner.plan_digest.clone(), self.inner.count);
        record.run_id = self.inner.run_id;
        record.instances = self
            .lock()
            .iter()
            .filter(|p| p.state.is_live())
            .map(TrackedProcess::to_record)
            .collect();
        record
    }

    /// Owned teardown of the tracked instances `spec` targets. Only the
    /// registry is scanned; the count in `spec` is never expanded.
    pub async fn teardown(&self, spec: &TeardownSpec) -> TeardownReport {
        let names: Vec<String> = self
            .lock()
            .iter()
            .filter(|p| spec.matches(&p.role, p.index))
            .map(|p| p.name.clone())
            .collect();
        self.terminate(&names).await
    }

    /// Owned teardown of everything this handle tracks.
    pub async fn teardown_all(&self) -> TeardownReport {
        let names = self.instance_names();
        self.terminate(&names).await
    }

    /// Force-kill the named processes. Killed entries become `Killed`,
    /// already-dead ones `Exited`; entries whose signal failed stay live for
    /// a later retry.
    async fn terminate(&self, names: &[String]) -> TeardownReport {
        let mut report = TeardownReport::default();

        for name in names {
            let taken = {
                let mut procs = self.lock();
                match procs.iter_mut().find(|p| &p.name == name) {
                    Some(p) => {
                        if p.poll() {
                            Some((p.pid, p.start_ticks, p.child.take()))
                        } else {
                            // exited on its own or already torn down
                            None
                        }
                    }
                    None => None,
                }
            };

            let Some((pid, start_ticks, child)) = taken else {
                report.not_found.push(name.clone());
                continue;
            };

            match kill_and_reap(pid, start_ticks, child, self.inner.kill_wait).await {
                Ok(true) => {
                    self.settle(name, InstanceState::Killed);
                    METRICS.inc_killed();
                    obs::emit_instance_killed(name, pid);
                    report.terminated.push(Terminated {
                        name: name.clone(),
                        pid,
                    });
                }
                Ok(false) => {
                    self.settle(name, InstanceState::Exited);
                    report.not_found.push(name.clone());
                }
                Err((reason, child)) => {
                    tracing::warn!(instance = %name, pid = pid, error = %reason, "failed to terminate");
                    if let Some(p) = self.lock().iter_mut().find(|p| &p.name == name) {
                        p.child = child;
                    }
                    report.failures.push(TeardownFailure {
                        name: name.clone(),
                        pid,
                        reason,
                    });
                }
            }
        }

        report
    }

    fn settle(&self, name: &str, next: InstanceState) {
        if let Some(p) = self.lock().iter_mut().find(|p| p.name == name) {
            p.settle(next);
        }
    }
}

/// SIGKILL the process group of `pid` and wait (bounded) for it to go away.
///
/// `Ok(true)` when killed, `Ok(false)` when it was already gone, `Err` with
/// the child handed back when the signal could not be delivered.
async fn kill_and_reap(
    pid: u32,
    start_ticks: Option<u64>,
    child: Option<Child>,
    wait: Duration,
) -> Result<bool, (String, Option<Child>)> {
    if child.is_none() && !os::is_same_live_process(pid, start_ticks) {
        return Ok(false);
    }

    match os::force_kill(pid, true) {
        Ok(KillOutcome::Delivered) => {}
        Ok(KillOutcome::NoSuchProcess) => return Ok(false),
        Err(reason) => return Err((reason, child)),
    }

    match child {
        Some(mut child) => {
            if tokio::time::timeout(wait, child.wait()).await.is_err() {
                tracing::warn!(pid = pid, "killed process not reaped within {:?}", wait);
            }
        }
        None => {
            let deadline = tokio::time::Instant::now() + wait;
            while os::is_same_live_process(pid, start_ticks)
                && tokio::time::Instant::now() < deadline
            {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
    Ok(true)
}
