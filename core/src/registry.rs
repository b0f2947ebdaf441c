use crate::record::ScanId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handle to a live scan process. Cancelling the token asks the worker that
/// owns the child to kill and reap it.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    token: CancellationToken,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            token: CancellationToken::new(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn terminate(&self) {
        self.token.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Live process handles keyed by scan id.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<ScanId, ProcessHandle>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned map is still structurally valid; keep serving it.
    fn jobs(&self) -> MutexGuard<'_, HashMap<ScanId, ProcessHandle>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, id: ScanId, handle: ProcessHandle) {
        if let Some(previous) = self.jobs().insert(id, handle) {
            warn!(scan_id = %id, pid = ?previous.pid(), "replaced an already registered scan process");
        }
    }

    pub fn lookup(&self, id: ScanId) -> Option<ProcessHandle> {
        self.jobs().get(&id).cloned()
    }

    pub fn unregister(&self, id: ScanId) -> Option<ProcessHandle> {
        self.jobs().remove(&id)
    }

    /// Removes the handle and signals it. Returns `false` when nothing was
    /// registered, which includes a process that already exited and was
    /// unregistered by its worker.
    pub fn terminate(&self, id: ScanId) -> bool {
        let handle = self.jobs().remove(&id);
        match handle {
            Some(handle) => {
                debug!(scan_id = %id, pid = ?handle.pid(), "terminating scan process");
                handle.terminate();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }

    pub fn active_ids(&self) -> Vec<ScanId> {
        let mut ids: Vec<ScanId> = self.jobs().keys().copied().collect();
        ids.sort();
        ids
    }
}
