//! Per-instance lifecycle state machine.
//!
//! ```text
//! NotStarted -> Starting -> Running -> (Exited | Killed)
//!                  |
//!                  +-------> (Exited | Killed)
//! ```
//!
//! `Starting -> Running` is inferred from the step's readiness window (and
//! probe, when configured), never from a health signal of the process itself.

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a single tracked process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    NotStarted,
    Starting,
    Running,
    Exited,
    Killed,
}

impl InstanceState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Exited | InstanceState::Killed)
    }

    /// Whether the instance is expected to have a live process.
    pub fn is_live(&self) -> bool {
        matches!(self, InstanceState::Starting | InstanceState::Running)
    }

    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Running)
                | (Starting, Exited)
                | (Starting, Killed)
                | (Running, Exited)
                | (Running, Killed)
        )
    }

    /// Validate and return the next state.
    pub fn transition(self, next: InstanceState) -> Result<InstanceState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::NotStarted => "not_started",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Exited => "exited",
            InstanceState::Killed => "killed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceState::*;

    #[test]
    fn test_happy_path_transitions() {
        let s = NotStarted.transition(Starting).unwrap();
        let s = s.transition(Running).unwrap();
        let s = s.transition(Killed).unwrap();
        assert!(s.is_terminal());
    }

    #[test]
    fn test_startup_death_is_allowed() {
        assert!(Starting.can_transition_to(Exited));
        assert!(Starting.can_transition_to(Killed));
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for next in [NotStarted, Starting, Running, Exited, Killed] {
            assert!(Exited.transition(next).is_err());
            assert!(Killed.transition(next).is_err());
        }
    }

    #[test]
    fn test_cannot_skip_starting() {
        assert!(NotStarted.transition(Running).is_err());
        assert!(Running.transition(Starting).is_err());
    }

    #[test]
    fn test_liveness_flags() {
        assert!(Starting.is_live());
        assert!(Running.is_live());
        assert!(!NotStarted.is_live());
        assert!(!Exited.is_live());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&NotStarted).unwrap();
        assert_eq!(json, "\"not_started\"");
    }
}
