//! On-disk record of a detached run.
//!
//! A detached `start` exits while its processes keep running. The record
//! keeps the PIDs it owns so a later `teardown` or `status` still acts only
//! on processes this tool spawned.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// One spawned process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordedInstance {
    pub role: String,
    pub index: Option<u32>,
    pub name: String,
    pub pid: u32,

    /// Kernel start time of the process (clock ticks since boot), used to
    /// tell the original process from a later one reusing its PID.
    #[serde(default)]
    pub start_ticks: Option<u64>,

    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub plan_digest: String,
    pub count: i64,
    pub created_at: DateTime<Utc>,
    pub instances: Vec<RecordedInstance>,
}

impl RunRecord {
    pub fn new(plan_digest: impl Into<String>, count: i64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            plan_digest: plan_digest.into(),
            count,
            created_at: Utc::now(),
            instances: Vec::new(),
        }
    }

    /// Load a record; `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the record atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Save, or delete the file once no instances remain.
    pub fn save_or_remove(&self, path: &Path) -> Result<()> {
        if self.instances.is_empty() {
            match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        } else {
            self.save(path)
        }
    }

    pub fn instance(&self, name: &str) -> Option<&RecordedInstance> {
        self.instances.iter().find(|i| i.name == name)
    }

    /// Drop the named instances; returns how many were removed.
    pub fn remove_instances(&mut self, names: &[&str]) -> usize {
        let before = self.instances.len();
        self.instances.retain(|i| !names.contains(&i.name.as_str()));
        before - self.instances.len()
    }
}
