//! procmesh orchestrator
//!
//! Executes lifecycle plans against the OS: spawns each instance as its own
//! process group, gates steps on readiness windows, tracks every PID it
//! started in a [`RunHandle`], and tears runs down again.
//!
//! ```text
//! LifecyclePlan ──▶ Orchestrator::start ──▶ RunHandle ──▶ status / watch
//!                                              │
//!                                              ▼
//!                                   teardown (owned | pattern)
//! ```

pub mod handle;
pub mod orchestrator;
pub mod os;
pub mod readiness;
pub mod spawner;
pub mod status;
pub mod teardown;

pub use handle::RunHandle;
pub use orchestrator::{
    LaunchFailure, LaunchFailureKind, Orchestrator, StartOutcome, StartReport, StepReport,
};
pub use readiness::{HttpCheck, LogLineCheck, ProbeOutcome, ReadinessCheck, TcpCheck};
pub use spawner::{SpawnedProcess, Spawner};
pub use status::{Status, StatusEntry, StatusIter};
pub use teardown::{teardown, teardown_by_pattern};
