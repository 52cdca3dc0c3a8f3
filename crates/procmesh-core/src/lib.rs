//! procmesh core
//!
//! Domain model for starting, inspecting and tearing down a multi-process
//! demo network: roles and their command templates, the declarative config,
//! the resolved lifecycle plan, the per-instance state machine, teardown
//! targets, and the on-disk record of detached runs.

pub mod config;
pub mod error;
pub mod metrics;
pub mod obs;
pub mod plan;
pub mod role;
pub mod run_record;
pub mod state;
pub mod teardown;
pub mod telemetry;

pub use config::{MeshConfig, Settings, StepSpec};
pub use error::{OrchestratorError, Result};
pub use metrics::METRICS;
pub use plan::{check_instance_count, LifecyclePlan, PlanStep, MAX_INSTANCE_COUNT};
pub use role::{BuiltinRole, InstanceSpec, ProbeSpec, RoleSpec};
pub use run_record::{RecordedInstance, RunRecord};
pub use state::InstanceState;
pub use teardown::{
    RolePattern, TeardownFailure, TeardownMode, TeardownReport, TeardownSpec, TeardownTarget,
    Terminated,
};
pub use telemetry::init_tracing;

/// procmesh version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
