//! Declarative environment configuration.
//!
//! A config lists the roles, the steps that start them in dependency order,
//! and orchestrator settings. It is read from TOML; when no file exists the
//! builtin demo network is used.

use crate::error::{OrchestratorError, Result};
use crate::plan::check_instance_count;
use crate::role::{BuiltinRole, RoleSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Orchestrator-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Abort remaining steps after the first launch failure.
    pub fail_fast: bool,

    /// How long a fresh process must survive before it counts as launched.
    pub spawn_grace_ms: u64,

    /// Poll interval for readiness probes and liveness checks.
    pub probe_interval_ms: u64,

    /// Bound on reaping a killed process during teardown.
    pub kill_wait_ms: u64,

    /// Directory receiving `<instance>.stdout.log` / `<instance>.stderr.log`.
    pub log_dir: PathBuf,

    /// Run record written by detached starts.
    pub state_file: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fail_fast: true,
            spawn_grace_ms: 200,
            probe_interval_ms: 250,
            kill_wait_ms: 2_000,
            log_dir: PathBuf::from(".procmesh/logs"),
            state_file: PathBuf::from(".procmesh/run.json"),
        }
    }
}

impl Settings {
    pub fn spawn_grace(&self) -> Duration {
        Duration::from_millis(self.spawn_grace_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }
}

/// One step of the startup sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    /// Label used in logs and errors (defaults to `step-<n>`).
    #[serde(default)]
    pub name: Option<String>,

    /// Roles started concurrently by this step.
    pub roles: Vec<String>,

    /// Minimum wait after launching before the next step may begin.
    #[serde(default)]
    pub ready_delay_secs: f64,

    /// Upper bound on readiness probes of this step.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: f64,
}

fn default_ready_timeout() -> f64 {
    30.0
}

impl StepSpec {
    pub fn new(name: &str, roles: &[&str], ready_delay_secs: f64) -> Self {
        Self {
            name: Some(name.to_string()),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            ready_delay_secs,
            ready_timeout_secs: default_ready_timeout(),
        }
    }

    pub fn with_ready_timeout(mut self, secs: f64) -> Self {
        self.ready_timeout_secs = secs;
        self
    }

    /// Zero for negative or NaN values, `Duration::MAX` for values too
    /// large to represent. `MeshConfig::validate` rejects both.
    pub fn ready_delay(&self) -> Duration {
        secs_to_duration(self.ready_delay_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        secs_to_duration(self.ready_timeout_secs)
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Complete environment description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeshConfig {
    #[serde(default)]
    pub settings: Settings,

    pub roles: Vec<RoleSpec>,

    pub steps: Vec<StepSpec>,
}

impl Default for MeshConfig {
    /// The builtin demo network: router, then the auxiliary services, then
    /// providers, then requestors. The matcher ships disabled.
    fn default() -> Self {
        let roles = BuiltinRole::ALL
            .iter()
            .map(|r| {
                let spec = RoleSpec::from_builtin(*r);
                if *r == BuiltinRole::Matcher {
                    spec.disabled()
                } else {
                    spec
                }
            })
            .collect();

        Self {
            settings: Settings::default(),
            roles,
            steps: vec![
                StepSpec::new("network", &["router"], 2.0),
                StepSpec::new("services", &["matcher", "vanity", "attestation"], 2.0),
                StepSpec::new("providers", &["provider"], 5.0),
                StepSpec::new("requestors", &["requestor"], 0.0),
            ],
        }
    }
}

impl MeshConfig {
    /// Parse and validate a TOML config.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: MeshConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), roles = config.roles.len(), "config loaded");
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to the builtin network.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "config file not found; using builtin network");
            Ok(Self::default())
        }
    }

    pub fn role(&self, name: &str) -> Option<&RoleSpec> {
        self.roles.iter().find(|r| r.name == name)
    }

    /// Roles that take part in a run, in step order.
    pub fn enabled_roles(&self) -> Vec<&RoleSpec> {
        self.steps
            .iter()
            .flat_map(|s| s.roles.iter())
            .filter_map(|name| self.role(name))
            .filter(|r| r.enabled)
            .collect()
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(OrchestratorError::InvalidConfig(msg));

        if self.steps.is_empty() {
            return invalid("at least one step is required".to_string());
        }

        let mut names = HashSet::new();
        for role in &self.roles {
            if role.name.trim().is_empty() {
                return invalid("role name must not be empty".to_string());
            }
            if !names.insert(role.name.as_str()) {
                return invalid(format!("duplicate role: {}", role.name));
            }
            if role.command.is_empty() || role.command[0].trim().is_empty() {
                return invalid(format!("role {} has empty command", role.name));
            }
            if let Some(count) = role.instance_count {
                if count < 0 {
                    return Err(OrchestratorError::InvalidArgument(format!(
                        "role {} has negative instance_count {}",
                        role.name, count
                    )));
                }
                check_instance_count(count)?;
            }
            if role.base_port.is_none() && role.templates().iter().any(|t| t.contains("{port}")) {
                return invalid(format!(
                    "role {} uses {{port}} but has no base_port",
                    role.name
                ));
            }
        }

        let mut scheduled = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.roles.is_empty() {
                return invalid(format!("step {} has no roles", i));
            }
            for secs in [step.ready_delay_secs, step.ready_timeout_secs] {
                if secs < 0.0 || Duration::try_from_secs_f64(secs).is_err() {
                    return invalid(format!("step {} has invalid duration {}", i, secs));
                }
            }
            for role in &step.roles {
                if !names.contains(role.as_str()) {
                    return invalid(format!("step {} references unknown role {}", i, role));
                }
                if !scheduled.insert(role.as_str()) {
                    return invalid(format!("role {} is scheduled in more than one step", role));
                }
            }
        }

        Ok(())
    }
}
