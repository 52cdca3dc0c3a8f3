//! Liveness view of a run.
//!
//! `Status` does not poll anything up front: each entry is checked when the
//! iterator reaches it, and every call to [`Status::iter`] starts over with
//! fresh observations.

use chrono::{DateTime, Utc};
use procmesh_core::InstanceState;
use serde::Serialize;

use crate::handle::RunHandle;

/// One instance as observed when its entry was pulled.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusEntry {
    pub role: String,
    pub index: Option<u32>,
    pub name: String,
    pub pid: u32,
    pub state: InstanceState,
    pub alive: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    pub started_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_at: Option<DateTime<Utc>>,
}

/// Restartable status sequence over a run handle.
#[derive(Debug, Clone)]
pub struct Status {
    handle: RunHandle,
}

impl Status {
    pub(crate) fn new(handle: RunHandle) -> Self {
        Self { handle }
    }

    pub fn iter(&self) -> StatusIter {
        StatusIter {
            handle: self.handle.clone(),
            names: self.handle.instance_names().into_iter(),
        }
    }

    /// Poll every entry now.
    pub fn snapshot(&self) -> Vec<StatusEntry> {
        self.iter().collect()
    }
}

impl<'a> IntoIterator for &'a Status {
    type Item = StatusEntry;
    type IntoIter = StatusIter;

    fn into_iter(self) -> StatusIter {
        self.iter()
    }
}

/// Iterator yielding one freshly polled entry per tracked instance.
///
/// Instances tracked after iteration began are not included.
pub struct StatusIter {
    handle: RunHandle,
    names: std::vec::IntoIter<String>,
}

impl Iterator for StatusIter {
    type Item = StatusEntry;

    fn next(&mut self) -> Option<StatusEntry> {
        loop {
            let name = self.names.next()?;
            let mut procs = self.handle.lock();
            let Some(p) = procs.iter_mut().find(|p| p.name == name) else {
                continue;
            };
            let alive = p.poll();
            return Some(StatusEntry {
                role: p.role.clone(),
                index: p.index,
                name: p.name.clone(),
                pid: p.pid,
                state: p.state,
                alive,
                exit_code: p.exit_code,
                started_at: p.started_at,
                running_at: p.running_at,
            });
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.names.len()))
    }
}
