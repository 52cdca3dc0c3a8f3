//! Lifecycle plan: the resolved, ordered startup sequence for one run.

use crate::config::MeshConfig;
use crate::error::{OrchestratorError, Result};
use crate::role::InstanceSpec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// One resolved step: every instance it launches plus its readiness window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    /// Position in the plan (0-based).
    pub index: usize,

    pub name: String,

    /// Instances launched concurrently by this step.
    pub instances: Vec<InstanceSpec>,

    /// Minimum wait before the next step may begin.
    pub ready_delay: Duration,

    /// Upper bound on readiness probes.
    pub ready_timeout: Duration,
}

impl PlanStep {
    /// Distinct role names of this step, in declaration order.
    pub fn roles(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for inst in &self.instances {
            if !out.contains(&inst.role.as_str()) {
                out.push(&inst.role);
            }
        }
        out
    }
}

/// Largest instance count (N) a run may request.
pub const MAX_INSTANCE_COUNT: i64 = 10_000;

/// Reject counts above [`MAX_INSTANCE_COUNT`]. Non-positive counts are
/// valid and mean "nothing to do".
pub fn check_instance_count(count: i64) -> Result<()> {
    if count > MAX_INSTANCE_COUNT {
        return Err(OrchestratorError::InvalidArgument(format!(
            "instance count {} exceeds the maximum of {}",
            count, MAX_INSTANCE_COUNT
        )));
    }
    Ok(())
}

/// Ordered steps of a run; consumed once by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecyclePlan {
    /// Requested instance count (N).
    pub count: i64,

    pub steps: Vec<PlanStep>,

    /// SHA-256 over the ordered steps and rendered commands.
    pub digest: String,
}

impl LifecyclePlan {
    /// Resolve a plan from a validated config.
    ///
    /// With `Some(n)`, indexed roles get `n` copies; `n <= 0` yields an empty
    /// plan (nothing to start). With `None`, each indexed role uses its own
    /// `instance_count` (default 1).
    pub fn build(config: &MeshConfig, count: Option<i64>) -> Result<Self> {
        config.validate()?;

        if let Some(n) = count {
            if n <= 0 {
                return Ok(Self::empty(n));
            }
            check_instance_count(n)?;
        }

        let mut steps = Vec::new();
        for (pos, step) in config.steps.iter().enumerate() {
            let mut instances = Vec::new();
            for role_name in &step.roles {
                let Some(role) = config.role(role_name) else {
                    continue;
                };
                if !role.enabled {
                    tracing::debug!(role = %role.name, "role disabled; not planned");
                    continue;
                }
                let copies = match (role.indexed, count) {
                    (false, _) => 1,
                    (true, Some(n)) => n,
                    (true, None) => role.instance_count.unwrap_or(1).max(0),
                };
                // both bounded by MAX_INSTANCE_COUNT
                let copies = copies as u32;
                let total = count.map(|n| n as u32).unwrap_or(copies);
                for i in 0..copies {
                    instances.push(role.instantiate(i, total));
                }
            }

            if instances.is_empty() {
                continue;
            }

            steps.push(PlanStep {
                index: steps.len(),
                name: step.name.clone().unwrap_or_else(|| format!("step-{}", pos)),
                instances,
                ready_delay: step.ready_delay(),
                ready_timeout: step.ready_timeout(),
            });
        }

        let digest = compute_plan_digest(&steps);
        Ok(Self {
            count: count.unwrap_or(0),
            steps,
            digest,
        })
    }

    /// A plan that starts nothing.
    pub fn empty(count: i64) -> Self {
        Self {
            count,
            steps: Vec::new(),
            digest: compute_plan_digest(&[]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(|s| s.instances.is_empty())
    }

    /// Total number of processes the plan launches.
    pub fn instance_count(&self) -> usize {
        self.steps.iter().map(|s| s.instances.len()).sum()
    }

    /// Lower bound on plan duration: the sum of readiness delays.
    pub fn minimum_duration(&self) -> Duration {
        self.steps.iter().map(|s| s.ready_delay).sum()
    }

    /// Short digest prefix for labels.
    pub fn short_digest(&self) -> &str {
        self.digest.get(..12).unwrap_or(&self.digest)
    }
}

/// Compute deterministic digest of ordered steps and their commands.
fn compute_plan_digest(steps: &[PlanStep]) -> String {
    let mut hasher = Sha256::new();
    for step in steps {
        hasher.update(step.name.as_bytes());
        hasher.update(b"\0");
        for inst in &step.instances {
            hasher.update(inst.name.as_bytes());
            hasher.update(b"\0");
            for arg in &inst.command {
                hasher.update(arg.as_bytes());
                hasher.update(b"\0");
            }
        }
        hasher.update(step.ready_delay.as_millis().to_le_bytes());
    }
    hex::encode(hasher.finalize())
}
