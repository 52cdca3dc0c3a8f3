//! Start sequence: ordered steps, readiness windows, failure collection.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use procmesh_core::{
    obs, InstanceSpec, LifecyclePlan, OrchestratorError, PlanStep, Settings, TeardownReport,
    METRICS,
};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::handle::{RunHandle, TrackedProcess};
use crate::readiness::{self, ProbeOutcome, ReadinessCheck};
use crate::spawner::Spawner;

/// Why an instance failed to launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchFailureKind {
    /// Could not be executed, or exited non-zero during the spawn grace.
    Spawn { reason: String },

    /// Readiness probe did not succeed within the step's timeout.
    Timeout { timeout_ms: u64 },
}

/// A launch failure attributed to its step, role and instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchFailure {
    pub step: usize,
    pub step_name: String,
    pub role: String,
    pub instance: String,
    #[serde(flatten)]
    pub kind: LaunchFailureKind,
}

impl LaunchFailure {
    fn spawn(step: &PlanStep, instance: &InstanceSpec, reason: impl Into<String>) -> Self {
        Self {
            step: step.index,
            step_name: step.name.clone(),
            role: instance.role.clone(),
            instance: instance.name.clone(),
            kind: LaunchFailureKind::Spawn {
                reason: reason.into(),
            },
        }
    }

    fn timeout(step: &PlanStep, instance: &InstanceSpec) -> Self {
        Self {
            step: step.index,
            step_name: step.name.clone(),
            role: instance.role.clone(),
            instance: instance.name.clone(),
            kind: LaunchFailureKind::Timeout {
                timeout_ms: step.ready_timeout.as_millis() as u64,
            },
        }
    }

    pub fn to_error(&self) -> OrchestratorError {
        match &self.kind {
            LaunchFailureKind::Spawn { reason } => OrchestratorError::SpawnFailure {
                step: self.step,
                step_name: self.step_name.clone(),
                role: self.role.clone(),
                instance: self.instance.clone(),
                reason: reason.clone(),
            },
            LaunchFailureKind::Timeout { timeout_ms } => OrchestratorError::SpawnTimeout {
                step: self.step,
                step_name: self.step_name.clone(),
                role: self.role.clone(),
                instance: self.instance.clone(),
                timeout_ms: *timeout_ms,
            },
        }
    }
}

impl std::fmt::Display for LaunchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_error())
    }
}

/// Timing of one executed step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub name: String,

    /// Instances launched by this step.
    pub instances: Vec<String>,

    pub started_at: DateTime<Utc>,

    /// When the readiness window closed; `None` if the step was cut short.
    pub ready_at: Option<DateTime<Utc>>,

    /// Time from the last spawn to the end of the readiness window.
    pub waited_ms: u64,
}

/// Result of executing a lifecycle plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartReport {
    pub steps: Vec<StepReport>,
    pub failures: Vec<LaunchFailure>,

    /// Remaining steps were skipped after a failure (`fail_fast`).
    pub aborted: bool,

    pub cancelled: bool,

    /// Teardown performed because the run was cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_teardown: Option<TeardownReport>,

    pub duration_ms: u64,
}

impl StartReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    /// The first failure as an error, or `Cancelled`.
    pub fn error(&self) -> Option<OrchestratorError> {
        if let Some(failure) = self.failures.first() {
            return Some(failure.to_error());
        }
        self.cancelled.then_some(OrchestratorError::Cancelled)
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// A started run: the handle owning its processes plus the report.
#[derive(Debug)]
pub struct StartOutcome {
    pub handle: RunHandle,
    pub report: StartReport,
}

enum StepEnd {
    Completed,
    Cancelled,
}

/// Executes lifecycle plans.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    settings: Settings,
    spawner: Spawner,
}

impl Orchestrator {
    pub fn new(settings: Settings) -> Self {
        let spawner = Spawner::new(settings.log_dir.clone());
        Self { settings, spawner }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Empty handle for `plan`; pass it to [`Orchestrator::run`] to observe
    /// status while the plan executes.
    pub fn prepare(&self, plan: &LifecyclePlan) -> RunHandle {
        RunHandle::new(plan.digest.clone(), plan.count, self.settings.kill_wait())
    }

    /// Execute `plan` and return the owning handle.
    pub async fn start(&self, plan: &LifecyclePlan, cancel: &CancellationToken) -> StartOutcome {
        let handle = self.prepare(plan);
        let report = self.run(&handle, plan, cancel).await;
        StartOutcome { handle, report }
    }

    /// Execute `plan`, tracking every spawned process in `handle`.
    ///
    /// Steps run strictly in order. Launch failures are collected; with
    /// `fail_fast` the remaining steps are skipped, but processes already
    /// running stay up for the caller to tear down. Cancellation tears down
    /// everything spawned so far.
    pub async fn run(
        &self,
        handle: &RunHandle,
        plan: &LifecyclePlan,
        cancel: &CancellationToken,
    ) -> StartReport {
        let run_id = handle.run_id().to_string();
        let span = obs::run_span(&run_id);
        async move {
            let start = Instant::now();
            obs::emit_run_started(&run_id, &plan.digest, plan.instance_count());

            let mut report = StartReport::default();
            for step in &plan.steps {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }

                let end = self.run_step(handle, step, cancel, &mut report).await;
                if matches!(end, StepEnd::Cancelled) {
                    report.cancelled = true;
                    break;
                }
                if self.settings.fail_fast && !report.failures.is_empty() {
                    warn!(step = %step.name, failures = report.failures.len(), "aborting start");
                    report.aborted = true;
                    break;
                }
            }

            if report.cancelled {
                info!("start cancelled; tearing down spawned processes");
                let teardown = handle.teardown_all().await;
                obs::emit_teardown_finished(
                    teardown.terminated.len(),
                    teardown.not_found.len(),
                    teardown.failures.len(),
                );
                report.cancel_teardown = Some(teardown);
            }

            report.duration_ms = start.elapsed().as_millis() as u64;
            obs::emit_run_finished(&run_id, report.duration_ms, handle.len(), report.success());
            METRICS.flush();
            report
        }
        .instrument(span)
        .await
    }

    async fn run_step(
        &self,
        handle: &RunHandle,
        step: &PlanStep,
        cancel: &CancellationToken,
        report: &mut StartReport,
    ) -> StepEnd {
        let started_at = Utc::now();
        obs::emit_step_started(step.index, &step.name, step.instances.len());

        let mut step_report = StepReport {
            index: step.index,
            name: step.name.clone(),
            instances: Vec::new(),
            started_at,
            ready_at: None,
            waited_ms: 0,
        };
        let failures_before = report.failures.len();

        for instance in &step.instances {
            if cancel.is_cancelled() {
                report.steps.push(step_report);
                return StepEnd::Cancelled;
            }
            match self.spawner.spawn(instance) {
                Ok(process) => {
                    let pid = process.pid;
                    handle.track(TrackedProcess::spawned(instance, process));
                    METRICS.inc_spawned();
                    obs::emit_instance_spawned(&instance.name, &instance.role, pid);
                    step_report.instances.push(instance.name.clone());
                }
                Err(e) => {
                    METRICS.inc_spawn_failures();
                    warn!(instance = %instance.name, error = %e, "spawn failed");
                    report
                        .failures
                        .push(LaunchFailure::spawn(step, instance, e.to_string()));
                }
            }
        }

        // readiness delay counts from the last spawn
        let window_start = tokio::time::Instant::now();

        if !step_report.instances.is_empty() {
            let grace = self.settings.spawn_grace();
            tokio::select! {
                _ = cancel.cancelled() => {
                    report.steps.push(step_report);
                    return StepEnd::Cancelled;
                }
                _ = tokio::time::sleep(grace) => {}
            }
        }

        let mut alive = step_report.instances.clone();
        for (name, code) in handle.poll_names(&step_report.instances) {
            alive.retain(|n| n != &name);
            let Some(instance) = step.instances.iter().find(|i| i.name == name) else {
                continue;
            };
            match code {
                Some(0) => {
                    warn!(instance = %name, "exited with status 0 during startup");
                }
                code => {
                    METRICS.inc_spawn_failures();
                    let reason = match code {
                        Some(c) => format!("exited during startup with status {}", c),
                        None => "killed by a signal during startup".to_string(),
                    };
                    report.failures.push(LaunchFailure::spawn(step, instance, reason));
                }
            }
        }

        if self.settings.fail_fast && report.failures.len() > failures_before {
            report.steps.push(step_report);
            return StepEnd::Completed;
        }

        // build probes for the instances still alive
        let request_timeout = self.settings.probe_interval().max(Duration::from_secs(1));
        let mut probes: Vec<(&InstanceSpec, Box<dyn ReadinessCheck>)> = Vec::new();
        for instance in step.instances.iter().filter(|i| alive.contains(&i.name)) {
            let Some(spec) = &instance.readiness else {
                continue;
            };
            let log = handle.stdout_log(&instance.name);
            let log = log.as_ref().map(|(path, offset)| (path.as_path(), *offset));
            match readiness::check_for(spec, log, request_timeout) {
                Ok(check) => probes.push((instance, check)),
                Err(e) => {
                    report
                        .failures
                        .push(LaunchFailure::spawn(step, instance, e.to_string()));
                }
            }
        }

        let interval = self.settings.probe_interval();
        let delay_until = readiness::deadline_from(window_start, step.ready_delay);
        let delay = async {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep_until(delay_until) => {}
            }
        };
        let waits = join_all(probes.iter().map(|(_, check)| {
            readiness::wait_until_ready(&**check, step.ready_timeout, interval, cancel)
        }));
        let ((), outcomes) = tokio::join!(delay, waits);

        if cancel.is_cancelled() {
            report.steps.push(step_report);
            return StepEnd::Cancelled;
        }

        let mut ready = alive;
        for ((instance, check), outcome) in probes.iter().zip(outcomes) {
            match outcome {
                ProbeOutcome::Ready => {}
                ProbeOutcome::TimedOut | ProbeOutcome::Cancelled => {
                    warn!(instance = %instance.name, probe = %check.describe(), "not ready in time");
                    METRICS.inc_spawn_failures();
                    ready.retain(|n| n != &instance.name);
                    report.failures.push(LaunchFailure::timeout(step, instance));
                }
            }
        }

        let ready_at = Utc::now();
        handle.mark_running(&ready, ready_at);
        step_report.waited_ms = window_start.elapsed().as_millis() as u64;
        step_report.ready_at = Some(ready_at);
        obs::emit_step_ready(step.index, &step.name, step_report.waited_ms);
        report.steps.push(step_report);
        StepEnd::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procmesh_core::{MeshConfig, RoleSpec, StepSpec};

    fn settings(dir: &std::path::Path) -> Settings {
        Settings {
            probe_interval_ms: 20,
            log_dir: dir.to_path_buf(),
            ..Settings::default()
        }
    }

    fn config(roles: Vec<RoleSpec>, steps: Vec<StepSpec>) -> MeshConfig {
        MeshConfig {
            settings: Settings::default(),
            roles,
            steps,
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_empty_plan_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(settings(dir.path()));
        let outcome = orch
            .start(&LifecyclePlan::empty(0), &CancellationToken::new())
            .await;
        assert!(outcome.report.success());
        assert!(outcome.report.steps.is_empty());
        assert!(outcome.handle.is_empty());
    }

    #[tokio::test]
    async fn test_immediate_nonzero_exit_is_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            vec![
                RoleSpec::singleton("vanity", sh("exit 7")),
                RoleSpec::singleton("attestation", vec!["sleep".to_string(), "30".to_string()]),
            ],
            vec![
                StepSpec::new("services", &["vanity"], 0.0),
                StepSpec::new("late", &["attestation"], 0.0),
            ],
        );
        let plan = LifecyclePlan::build(&cfg, Some(1)).unwrap();
        let orch = Orchestrator::new(settings(dir.path()));
        let outcome = orch.start(&plan, &CancellationToken::new()).await;

        let report = &outcome.report;
        assert!(!report.success());
        assert!(report.aborted);
        assert_eq!(report.failures.len(), 1);
        let err = report.error().unwrap();
        assert!(matches!(
            err,
            OrchestratorError::SpawnFailure { ref role, step: 0, .. } if role == "vanity"
        ));
        // second step never ran
        assert!(report.step("late").is_none());
        assert!(outcome.handle.pid_of("attestation").is_none());
    }

    #[tokio::test]
    async fn test_clean_exit_during_startup_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            vec![RoleSpec::singleton("matcher", vec!["true".to_string()])],
            vec![StepSpec::new("services", &["matcher"], 0.0)],
        );
        let plan = LifecyclePlan::build(&cfg, Some(1)).unwrap();
        let orch = Orchestrator::new(settings(dir.path()));
        let outcome = orch.start(&plan, &CancellationToken::new()).await;
        assert!(outcome.report.success());
        assert_eq!(outcome.handle.live_count(), 0);
    }

    #[tokio::test]
    async fn test_log_line_probe_gates_running() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(
            vec![RoleSpec::singleton("router", sh("sleep 0.2; echo router ready; sleep 30"))
                .with_readiness(procmesh_core::ProbeSpec::LogLine {
                    pattern: "ready$".to_string(),
                })],
            vec![StepSpec::new("network", &["router"], 0.0).with_ready_timeout(5.0)],
        );
        let plan = LifecyclePlan::build(&cfg, Some(1)).unwrap();
        let orch = Orchestrator::new(settings(dir.path()));
        let outcome = orch.start(&plan, &CancellationToken::new()).await;

        assert!(outcome.report.success(), "{:?}", outcome.report.failures);
        let entry = outcome.handle.status().iter().next().unwrap();
        assert_eq!(entry.state, procmesh_core::InstanceState::Running);
        assert!(outcome.report.steps[0].waited_ms >= 150);

        outcome.handle.teardown_all().await;
    }

    #[tokio::test]
    async fn test_log_line_from_previous_run_does_not_count() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("router.stdout.log"), "router ready\n").unwrap();

        let cfg = config(
            vec![RoleSpec::singleton("router", vec!["sleep".to_string(), "30".to_string()])
                .with_readiness(procmesh_core::ProbeSpec::LogLine {
                    pattern: "ready$".to_string(),
                })],
            vec![StepSpec::new("network", &["router"], 0.0).with_ready_timeout(0.5)],
        );
        let plan = LifecyclePlan::build(&cfg, Some(1)).unwrap();
        let orch = Orchestrator::new(settings(dir.path()));
        let outcome = orch.start(&plan, &CancellationToken::new()).await;

        assert!(matches!(
            outcome.report.error(),
            Some(OrchestratorError::SpawnTimeout { ref role, timeout_ms: 500, .. }) if role == "router"
        ));
        let entry = outcome.handle.status().iter().next().unwrap();
        assert_eq!(entry.state, procmesh_core::InstanceState::Starting);

        outcome.handle.teardown_all().await;
    }

    #[tokio::test]
    async fn test_keep_going_collects_failures_across_steps() {
        let dir = tempfile::tempdir().unwrap();
        let sleeper = || vec!["sleep".to_string(), "30".to_string()];
        let cfg = config(
            vec![
                RoleSpec::singleton("router", sleeper()),
                RoleSpec::singleton("vanity", sh("exit 4")),
                RoleSpec::indexed("provider", sleeper()),
                RoleSpec::singleton("attestation", sh("exit 5")),
            ],
            vec![
                StepSpec::new("network", &["router", "vanity"], 0.0),
                StepSpec::new("nodes", &["provider", "attestation"], 0.0),
            ],
        );
        let plan = LifecyclePlan::build(&cfg, Some(2)).unwrap();
        let orch = Orchestrator::new(Settings {
            fail_fast: false,
            ..settings(dir.path())
        });
        let outcome = orch.start(&plan, &CancellationToken::new()).await;
        let report = &outcome.report;

        assert!(!report.success());
        assert!(!report.aborted);
        assert_eq!(report.steps.len(), 2);

        let failed: Vec<(usize, &str, &str)> = report
            .failures
            .iter()
            .map(|f| (f.step, f.step_name.as_str(), f.role.as_str()))
            .collect();
        assert_eq!(
            failed,
            vec![(0, "network", "vanity"), (1, "nodes", "attestation")]
        );
        assert!(report
            .failures
            .iter()
            .all(|f| matches!(f.kind, LaunchFailureKind::Spawn { .. })));

        // the later step still launched its healthy role
        assert_eq!(
            report.step("nodes").unwrap().instances,
            vec!["provider-0", "provider-1", "attestation"]
        );
        assert!(outcome.handle.pid_of("provider-1").is_some());
        assert_eq!(
            outcome.handle.live_names(),
            vec!["router", "provider-0", "provider-1"]
        );

        outcome.handle.teardown_all().await;
    }
}
