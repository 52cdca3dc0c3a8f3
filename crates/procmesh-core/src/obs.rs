//! Structured lifecycle events for a run.
//!
//! Every event is a single `tracing` record with an `event` field, so JSON
//! output (`--json`) can be filtered by event name:
//!
//! - `run.started`, `run.finished`
//! - `step.started`, `step.ready`
//! - `instance.spawned`, `instance.exited`, `instance.killed`
//! - `teardown.finished`

use tracing::{info, warn};

/// Span carrying the run id; instrument a run's future with it so every
/// record inside is tagged.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("procmesh.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, plan_digest: &str, instances: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        plan_digest = %plan_digest,
        instances = instances,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, spawned: usize, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        spawned = spawned,
        success = success,
    );
}

pub fn emit_step_started(step: usize, name: &str, instances: usize) {
    info!(event = "step.started", step = step, name = %name, instances = instances);
}

/// Emit event: the step's readiness window closed.
pub fn emit_step_ready(step: usize, name: &str, waited_ms: u64) {
    info!(event = "step.ready", step = step, name = %name, waited_ms = waited_ms);
}

pub fn emit_instance_spawned(name: &str, role: &str, pid: u32) {
    info!(event = "instance.spawned", instance = %name, role = %role, pid = pid);
}

/// Emit event: a process died without being asked to (warning level).
pub fn emit_instance_exited(name: &str, pid: u32, exit_code: Option<i32>) {
    warn!(
        event = "instance.exited",
        instance = %name,
        pid = pid,
        exit_code = exit_code.unwrap_or(-1),
        "process exited unexpectedly"
    );
}

pub fn emit_instance_killed(name: &str, pid: u32) {
    info!(event = "instance.killed", instance = %name, pid = pid);
}

pub fn emit_teardown_finished(terminated: usize, not_found: usize, failures: usize) {
    info!(
        event = "teardown.finished",
        terminated = terminated,
        not_found = not_found,
        failures = failures,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let span = run_span("test-run-id");
        let _guard = span.enter();
        emit_step_started(0, "network", 1);
    }
}
