//! Teardown: owned (registry) and legacy pattern modes.

use procmesh_core::{
    obs, TeardownFailure, TeardownMode, TeardownReport, TeardownSpec, Terminated, METRICS,
};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

use crate::handle::RunHandle;
use crate::os::{self, KillOutcome};

/// Tear down the targets of `spec`.
///
/// Owned mode signals only PIDs tracked by `handle`; without a handle there
/// is nothing owned and every target is reported not found. Pattern mode
/// ignores the handle and scans the process table.
pub async fn teardown(
    handle: Option<&RunHandle>,
    spec: &TeardownSpec,
    kill_wait: Duration,
) -> TeardownReport {
    let report = match spec.mode {
        TeardownMode::Owned => match handle {
            Some(handle) => handle.teardown(spec).await,
            None => TeardownReport {
                not_found: spec.targets().into_iter().map(|t| t.name).collect(),
                ..Default::default()
            },
        },
        TeardownMode::Pattern => teardown_by_pattern(spec, kill_wait).await,
    };

    obs::emit_teardown_finished(
        report.terminated.len(),
        report.not_found.len(),
        report.failures.len(),
    );
    METRICS.flush();
    report
}

/// Kill every process whose command line contains a target name.
///
/// Matching is substring-based, as with `pkill -f`: `provider-1` also
/// matches `provider-10`, and processes this tool never started are killed
/// too.
pub async fn teardown_by_pattern(spec: &TeardownSpec, kill_wait: Duration) -> TeardownReport {
    let targets = spec.targets();
    if !targets.is_empty() {
        tracing::warn!(
            targets = targets.len(),
            "pattern teardown kills any process whose command line matches"
        );
    }

    let mut report = TeardownReport::default();
    let mut killed: BTreeSet<u32> = BTreeSet::new();
    let mut pending: Vec<(u32, Option<u64>)> = Vec::new();

    for target in targets {
        let hits: Vec<_> = os::find_by_pattern(&target.name)
            .into_iter()
            .filter(|p| !killed.contains(&p.pid))
            .collect();
        if hits.is_empty() {
            report.not_found.push(target.name);
            continue;
        }

        for hit in hits {
            let ticks = os::start_ticks(hit.pid);
            match os::force_kill(hit.pid, false) {
                Ok(KillOutcome::Delivered) => {
                    killed.insert(hit.pid);
                    pending.push((hit.pid, ticks));
                    METRICS.inc_killed();
                    obs::emit_instance_killed(&target.name, hit.pid);
                    report.terminated.push(Terminated {
                        name: target.name.clone(),
                        pid: hit.pid,
                    });
                }
                // exited between the scan and the signal
                Ok(KillOutcome::NoSuchProcess) => {}
                Err(reason) => {
                    tracing::warn!(target = %target.name, pid = hit.pid, error = %reason, "failed to terminate");
                    report.failures.push(TeardownFailure {
                        name: target.name.clone(),
                        pid: hit.pid,
                        reason,
                    });
                }
            }
        }
    }

    // processes we do not parent are reaped elsewhere; wait until they are gone
    let deadline = Instant::now() + kill_wait;
    while pending
        .iter()
        .any(|(pid, ticks)| os::is_same_live_process(*pid, *ticks))
        && Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use procmesh_core::RolePattern;

    fn spec(role: &str, indexed: bool, count: i64, mode: TeardownMode) -> TeardownSpec {
        TeardownSpec {
            count,
            patterns: vec![RolePattern {
                role: role.to_string(),
                indexed,
            }],
            mode,
        }
    }

    #[tokio::test]
    async fn test_owned_without_handle_kills_nothing() {
        let spec = spec("provider", true, 2, TeardownMode::Owned);
        let report = teardown(None, &spec, Duration::from_millis(100)).await;
        assert!(report.removed_nothing());
        assert!(report.success());
        assert_eq!(report.not_found, vec!["provider-0", "provider-1"]);
    }

    #[tokio::test]
    async fn test_non_positive_count_is_noop() {
        for count in [0, -3] {
            let spec = spec("requestor", true, count, TeardownMode::Pattern);
            let report = teardown(None, &spec, Duration::from_millis(100)).await;
            assert!(report.is_empty());
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_pattern_teardown_kills_matching_process() {
        let role = format!("pmtest{}", std::process::id());
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30; true", &format!("{}-0", role)])
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let spec = spec(&role, true, 1, TeardownMode::Pattern);
        let report = teardown(None, &spec, Duration::from_secs(2)).await;
        assert_eq!(report.terminated.len(), 1);
        assert_eq!(report.terminated[0].pid, pid);
        child.wait().await.unwrap();

        // second pass finds nothing
        let again = teardown(None, &spec, Duration::from_secs(2)).await;
        assert!(again.removed_nothing());
        assert_eq!(again.not_found, vec![format!("{}-0", role)]);
    }
}
