//! OS process table helpers: liveness, forced kill, and `/proc` scanning.
//!
//! The orchestrator spawns every instance as the leader of its own process
//! group, so killing the group also takes down anything the instance forked.

use serde::{Deserialize, Serialize};

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{kill, killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Result of delivering a kill signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Delivered,
    NoSuchProcess,
}

/// A process found in the OS process table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub cmdline: String,
}

/// `pid` as a signal target. 0 and values past `i32::MAX` would address
/// process groups instead of a single process.
#[cfg(unix)]
fn signal_target(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|&p| p > 0).map(Pid::from_raw)
}

/// Whether any process (including a zombie) holds `pid`.
#[cfg(unix)]
pub fn pid_exists(pid: u32) -> bool {
    let Some(target) = signal_target(pid) else {
        return false;
    };
    match kill(target, None) {
        Ok(()) => true,
        // exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_exists(_pid: u32) -> bool {
    false
}

/// SIGKILL `pid`. With `group`, the whole process group led by `pid` is
/// killed, falling back to the single process when it leads no group.
#[cfg(unix)]
pub fn force_kill(pid: u32, group: bool) -> Result<KillOutcome, String> {
    let Some(target) = signal_target(pid) else {
        return Ok(KillOutcome::NoSuchProcess);
    };
    if group {
        match killpg(target, Signal::SIGKILL) {
            Ok(()) => return Ok(KillOutcome::Delivered),
            Err(Errno::ESRCH) => {}
            Err(e) => return Err(e.desc().to_string()),
        }
    }
    match kill(target, Signal::SIGKILL) {
        Ok(()) => Ok(KillOutcome::Delivered),
        Err(Errno::ESRCH) => Ok(KillOutcome::NoSuchProcess),
        Err(e) => Err(e.desc().to_string()),
    }
}

#[cfg(not(unix))]
pub fn force_kill(pid: u32, _group: bool) -> Result<KillOutcome, String> {
    Err(format!("signals are not supported on this platform (pid {})", pid))
}

/// Kernel start time of `pid` in clock ticks since boot.
#[cfg(target_os = "linux")]
pub fn start_ticks(pid: u32) -> Option<u64> {
    stat_fields(pid)?.get(19)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
pub fn start_ticks(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    stat_fields(pid)
        .and_then(|f| f.first().map(|s| s == "Z"))
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Fields of `/proc/<pid>/stat` after the command name, starting at `state`.
#[cfg(target_os = "linux")]
fn stat_fields(pid: u32) -> Option<Vec<String>> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm may contain spaces and parentheses; it ends at the last ')'
    let rest = stat.get(stat.rfind(')')? + 1..)?;
    Some(rest.split_whitespace().map(str::to_string).collect())
}

/// Whether `pid` is alive and is still the process recorded with
/// `expected_ticks` (guards against PID reuse).
pub fn is_same_live_process(pid: u32, expected_ticks: Option<u64>) -> bool {
    if !pid_exists(pid) || is_zombie(pid) {
        return false;
    }
    match (expected_ticks, start_ticks(pid)) {
        (Some(expected), Some(actual)) => expected == actual,
        _ => true,
    }
}

/// Space-joined command line of `pid`; `None` for kernel threads and zombies.
#[cfg(target_os = "linux")]
pub fn cmdline(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{}/cmdline", pid)).ok()?;
    let args: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|a| !a.is_empty())
        .map(|a| String::from_utf8_lossy(a).into_owned())
        .collect();
    if args.is_empty() {
        None
    } else {
        Some(args.join(" "))
    }
}

#[cfg(not(target_os = "linux"))]
pub fn cmdline(_pid: u32) -> Option<String> {
    None
}

/// Every process whose command line contains `pattern`, excluding this
/// process. Same matching rule as `pkill -f`.
#[cfg(target_os = "linux")]
pub fn find_by_pattern(pattern: &str) -> Vec<ProcessInfo> {
    let own = std::process::id();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        tracing::warn!("cannot read /proc; pattern matching finds nothing");
        return Vec::new();
    };

    let mut out: Vec<ProcessInfo> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| *pid != own)
        .filter_map(|pid| {
            let cmdline = cmdline(pid)?;
            cmdline
                .contains(pattern)
                .then_some(ProcessInfo { pid, cmdline })
        })
        .collect();
    out.sort_by_key(|p| p.pid);
    out
}

#[cfg(not(target_os = "linux"))]
pub fn find_by_pattern(_pattern: &str) -> Vec<ProcessInfo> {
    tracing::warn!("process table scanning is only supported on Linux");
    Vec::new()
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        let pid = std::process::id();
        assert!(pid_exists(pid));
        let ticks = start_ticks(pid);
        assert!(ticks.is_some());
        assert!(is_same_live_process(pid, ticks));
        assert!(!is_same_live_process(pid, ticks.map(|t| t + 1)));
    }

    #[test]
    fn test_group_addressing_pids_are_never_signalled() {
        for pid in [0, u32::MAX, i32::MAX as u32 + 1] {
            assert!(!pid_exists(pid));
            assert_eq!(force_kill(pid, true), Ok(KillOutcome::NoSuchProcess));
        }
    }

    #[test]
    fn test_own_cmdline_is_readable_but_excluded_from_scan() {
        let own = cmdline(std::process::id()).unwrap();
        assert!(!own.is_empty());
        let hits = find_by_pattern(&own);
        assert!(hits.iter().all(|p| p.pid != std::process::id()));
    }

    #[test]
    fn test_force_kill_and_scan_child() {
        use std::os::unix::process::CommandExt;

        let marker = format!("procmesh-os-test-{}", std::process::id());
        // compound command so the shell stays around with the marker as $0
        let mut child = std::process::Command::new("sh")
            .args(["-c", "sleep 30; true", &marker])
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();

        // give the kernel a moment to publish the cmdline
        std::thread::sleep(std::time::Duration::from_millis(100));
        let hits = find_by_pattern(&marker);
        assert!(hits.iter().any(|p| p.pid == pid));

        assert_eq!(force_kill(pid, true), Ok(KillOutcome::Delivered));
        child.wait().unwrap();
        assert!(!pid_exists(pid));
        assert_eq!(force_kill(pid, false), Ok(KillOutcome::NoSuchProcess));
    }
}
