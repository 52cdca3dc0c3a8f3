//! Error taxonomy for process orchestration.

use crate::state::InstanceState;

/// Errors produced while planning, starting, inspecting or tearing down a run.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("step {step} ({step_name}): failed to spawn {instance} (role {role}): {reason}")]
    SpawnFailure {
        step: usize,
        step_name: String,
        role: String,
        instance: String,
        reason: String,
    },

    #[error("step {step} ({step_name}): {instance} (role {role}) not ready after {timeout_ms}ms")]
    SpawnTimeout {
        step: usize,
        step_name: String,
        role: String,
        instance: String,
        timeout_ms: u64,
    },

    #[error("failed to terminate {target} (pid {pid}): {reason}")]
    TerminationFailure {
        target: String,
        pid: u32,
        reason: String,
    },

    #[error("invalid instance state transition: {from} -> {to}")]
    InvalidTransition {
        from: InstanceState,
        to: InstanceState,
    },

    #[error("orchestration cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Name of the role this error is attributed to, if any.
    pub fn role(&self) -> Option<&str> {
        match self {
            OrchestratorError::SpawnFailure { role, .. }
            | OrchestratorError::SpawnTimeout { role, .. } => Some(role),
            _ => None,
        }
    }

    /// Whether this error came from launching an instance.
    pub fn is_launch_error(&self) -> bool {
        matches!(
            self,
            OrchestratorError::SpawnFailure { .. } | OrchestratorError::SpawnTimeout { .. }
        )
    }
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_failure_names_role_and_step() {
        let err = OrchestratorError::SpawnFailure {
            step: 1,
            step_name: "nodes".to_string(),
            role: "provider".to_string(),
            instance: "provider-2".to_string(),
            reason: "No such file or directory".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("step 1"));
        assert!(msg.contains("provider-2"));
        assert!(msg.contains("No such file"));
        assert_eq!(err.role(), Some("provider"));
        assert!(err.is_launch_error());
    }

    #[test]
    fn test_spawn_timeout_display() {
        let err = OrchestratorError::SpawnTimeout {
            step: 0,
            step_name: "network".to_string(),
            role: "router".to_string(),
            instance: "router".to_string(),
            timeout_ms: 1500,
        };
        assert!(err.to_string().contains("1500ms"));
        assert!(err.is_launch_error());
    }

    #[test]
    fn test_termination_failure_is_not_launch_error() {
        let err = OrchestratorError::TerminationFailure {
            target: "requestor-0".to_string(),
            pid: 4242,
            reason: "EPERM".to_string(),
        };
        assert!(err.to_string().contains("pid 4242"));
        assert!(!err.is_launch_error());
        assert_eq!(err.role(), None);
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = OrchestratorError::InvalidTransition {
            from: InstanceState::Killed,
            to: InstanceState::Running,
        };
        assert_eq!(
            err.to_string(),
            "invalid instance state transition: killed -> running"
        );
    }
}
