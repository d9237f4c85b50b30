use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Per-project single-flight gate shared by backups and restores.
///
/// Acquisition is a single check-and-insert under the lock; a held project
/// is reported immediately instead of queueing.
#[derive(Debug, Clone, Default)]
pub struct BackupGate {
    busy: Arc<Mutex<HashSet<String>>>,
}

impl BackupGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when an operation for `project` is already running.
    pub fn try_acquire(&self, project: &str) -> Option<GateGuard> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(project.to_owned()) {
            return None;
        }
        Some(GateGuard {
            busy: Arc::clone(&self.busy),
            project: project.to_owned(),
        })
    }

    pub fn is_busy(&self, project: &str) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(project)
    }
}

/// Releases the project on drop, whichever way the operation ended.
#[derive(Debug)]
pub struct GateGuard {
    busy: Arc<Mutex<HashSet<String>>>,
    project: String,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.project);
    }
}
