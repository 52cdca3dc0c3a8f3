//! Teardown targets and reports.

use crate::config::MeshConfig;
use crate::error::OrchestratorError;
use crate::plan::MAX_INSTANCE_COUNT;
use serde::{Deserialize, Serialize};

/// How teardown finds the processes it kills.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TeardownMode {
    /// Only PIDs recorded by the run handle.
    #[default]
    Owned,

    /// Any OS process whose command line contains the target name.
    ///
    /// Legacy behaviour: an unrelated process sharing a name fragment is
    /// killed too.
    Pattern,
}

/// A role name to expand into teardown targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolePattern {
    pub role: String,
    pub indexed: bool,
}

/// One expanded teardown target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TeardownTarget {
    pub role: String,
    pub index: Option<u32>,

    /// `<role>-<index>` or `<role>`.
    pub name: String,
}

/// Target count plus the role patterns to terminate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeardownSpec {
    pub count: i64,
    pub patterns: Vec<RolePattern>,
    #[serde(default)]
    pub mode: TeardownMode,
}

impl TeardownSpec {
    /// Every role of `config`, enabled or not, so that a role disabled after
    /// a start is still cleaned up.
    pub fn from_config(config: &MeshConfig, count: i64) -> Self {
        Self {
            count,
            patterns: config
                .roles
                .iter()
                .map(|r| RolePattern {
                    role: r.name.clone(),
                    indexed: r.indexed,
                })
                .collect(),
            mode: TeardownMode::Owned,
        }
    }

    pub fn with_mode(mut self, mode: TeardownMode) -> Self {
        self.mode = mode;
        self
    }

    /// Keep only the named roles; an empty filter keeps everything.
    pub fn only_roles(mut self, roles: &[String]) -> Self {
        if !roles.is_empty() {
            self.patterns.retain(|p| roles.contains(&p.role));
        }
        self
    }

    /// Whether the instance `role`/`index` is a target, without expanding
    /// the patterns. Cost is independent of `count`.
    pub fn matches(&self, role: &str, index: Option<u32>) -> bool {
        if self.count <= 0 {
            return false;
        }
        self.patterns
            .iter()
            .filter(|p| p.role == role)
            .any(|p| match (p.indexed, index) {
                (true, Some(i)) => i64::from(i) < self.count,
                (false, None) => true,
                _ => false,
            })
    }

    /// Expand patterns: `<role>-<i>` for i in `[0, count-1]` for indexed
    /// roles, the bare role name for singletons. Empty when `count <= 0`;
    /// indexes stop at [`MAX_INSTANCE_COUNT`].
    pub fn targets(&self) -> Vec<TeardownTarget> {
        if self.count <= 0 {
            return Vec::new();
        }
        let mut out = Vec::new();
        for pattern in &self.patterns {
            if pattern.indexed {
                for i in 0..self.count.min(MAX_INSTANCE_COUNT) as u32 {
                    out.push(TeardownTarget {
                        role: pattern.role.clone(),
                        index: Some(i),
                        name: format!("{}-{}", pattern.role, i),
                    });
                }
            } else {
                out.push(TeardownTarget {
                    role: pattern.role.clone(),
                    index: None,
                    name: pattern.role.clone(),
                });
            }
        }
        out
    }
}

/// A process that was killed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Terminated {
    pub name: String,
    pub pid: u32,
}

/// A signal that could not be delivered to a live process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeardownFailure {
    pub name: String,
    pub pid: u32,
    pub reason: String,
}

impl From<TeardownFailure> for OrchestratorError {
    fn from(f: TeardownFailure) -> Self {
        OrchestratorError::TerminationFailure {
            target: f.name,
            pid: f.pid,
            reason: f.reason,
        }
    }
}

/// Outcome of a teardown; partial success is normal.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeardownReport {
    pub terminated: Vec<Terminated>,

    /// Targets with no live process. Not an error.
    pub not_found: Vec<String>,

    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    /// Whether every live target was terminated.
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether nothing was removed.
    pub fn removed_nothing(&self) -> bool {
        self.terminated.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.terminated.is_empty() && self.not_found.is_empty() && self.failures.is_empty()
    }

    pub fn terminated_names(&self) -> Vec<&str> {
        self.terminated.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn merge(&mut self, other: TeardownReport) {
        self.terminated.extend(other.terminated);
        self.not_found.extend(other.not_found);
        self.failures.extend(other.failures);
    }
}
