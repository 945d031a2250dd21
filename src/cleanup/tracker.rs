//! Cleanup tracker
//!
//! Status store for in-flight cleanups. The map guards membership only;
//! each entry carries its own lock for state transitions, so observers
//! never touch the map to record a result. Absent-only insertion is what
//! enforces at most one concurrent cleanup per PV name.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

// =============================================================================
// Entry Types
// =============================================================================

/// How a cleanup is being executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupKind {
    /// Child process supervised by this provisioner
    Process,
    /// Cluster Job running the cleanup contract
    Job { namespace: String, name: String },
}

/// Observed state of one cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupState {
    InFlight,
    Succeeded,
    Failed,
}

/// One tracked cleanup. The state mutex is per-entry so observers update
/// results without holding the tracker map lock.
#[derive(Debug)]
pub struct CleanupEntry {
    kind: CleanupKind,
    state: Mutex<CleanupState>,
    started_at: Instant,
}

impl CleanupEntry {
    fn new(kind: CleanupKind) -> Self {
        Self {
            kind,
            state: Mutex::new(CleanupState::InFlight),
            started_at: Instant::now(),
        }
    }

    pub fn kind(&self) -> &CleanupKind {
        &self.kind
    }

    pub fn state(&self) -> CleanupState {
        *self.state.lock()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Transition InFlight to a terminal state. Exactly one transition
    /// wins; later calls are ignored.
    pub fn finish(&self, success: bool) {
        let mut state = self.state.lock();
        if *state == CleanupState::InFlight {
            *state = if success {
                CleanupState::Succeeded
            } else {
                CleanupState::Failed
            };
        }
    }
}

// =============================================================================
// Cleanup Tracker
// =============================================================================

/// Tracks all cleanups this instance has started and not yet retired.
#[derive(Default)]
pub struct CleanupTracker {
    entries: Mutex<HashMap<String, Arc<CleanupEntry>>>,
}

impl CleanupTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inline process cleanup. Fails when a cleanup for the PV
    /// is already tracked, whatever its state.
    pub fn insert_process(&self, pv_name: &str) -> Option<Arc<CleanupEntry>> {
        self.insert(pv_name, CleanupKind::Process)
    }

    /// Register a Job cleanup. Same absent-only semantics.
    pub fn insert_job(
        &self,
        pv_name: &str,
        namespace: &str,
        job_name: &str,
    ) -> Option<Arc<CleanupEntry>> {
        self.insert(
            pv_name,
            CleanupKind::Job {
                namespace: namespace.to_string(),
                name: job_name.to_string(),
            },
        )
    }

    fn insert(&self, pv_name: &str, kind: CleanupKind) -> Option<Arc<CleanupEntry>> {
        let mut entries = self.entries.lock();
        if entries.contains_key(pv_name) {
            return None;
        }
        let entry = Arc::new(CleanupEntry::new(kind));
        entries.insert(pv_name.to_string(), entry.clone());
        debug!(pv = pv_name, "Tracking cleanup");
        Some(entry)
    }

    /// Current state of the PV's cleanup, `None` when untracked.
    pub fn status(&self, pv_name: &str) -> Option<CleanupState> {
        self.entries.lock().get(pv_name).map(|e| e.state())
    }

    /// Kind of the PV's tracked cleanup, `None` when untracked.
    pub fn kind(&self, pv_name: &str) -> Option<CleanupKind> {
        self.entries.lock().get(pv_name).map(|e| e.kind().clone())
    }

    /// Remove the entry. The caller decides when a terminal result has
    /// been fully acted on (PV deleted, or failure recorded for retry).
    pub fn remove(&self, pv_name: &str) {
        self.entries.lock().remove(pv_name);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_absent_only() {
        let tracker = CleanupTracker::new();
        assert!(tracker.insert_process("pv-a").is_some());
        assert!(tracker.insert_process("pv-a").is_none());
        assert!(tracker.insert_job("pv-a", "ns", "cleanup-pv-a").is_none());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_status_transitions_once() {
        let tracker = CleanupTracker::new();
        let entry = tracker.insert_process("pv-a").unwrap();
        assert_eq!(tracker.status("pv-a"), Some(CleanupState::InFlight));

        entry.finish(true);
        assert_eq!(tracker.status("pv-a"), Some(CleanupState::Succeeded));

        // A late failure report cannot overwrite the terminal state.
        entry.finish(false);
        assert_eq!(tracker.status("pv-a"), Some(CleanupState::Succeeded));
    }

    #[test]
    fn test_remove_allows_new_cleanup() {
        let tracker = CleanupTracker::new();
        let entry = tracker.insert_process("pv-a").unwrap();
        entry.finish(false);

        tracker.remove("pv-a");
        assert_eq!(tracker.status("pv-a"), None);
        assert!(tracker.insert_process("pv-a").is_some());
    }

    #[test]
    fn test_job_kind_preserved() {
        let tracker = CleanupTracker::new();
        tracker.insert_job("pv-a", "storage", "cleanup-pv-a").unwrap();
        assert_eq!(
            tracker.kind("pv-a"),
            Some(CleanupKind::Job {
                namespace: "storage".to_string(),
                name: "cleanup-pv-a".to_string(),
            })
        );
    }

    #[test]
    fn test_concurrent_insert_single_winner() {
        let tracker = Arc::new(CleanupTracker::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            handles.push(std::thread::spawn(move || {
                tracker.insert_process("pv-a").is_some() as usize
            }));
        }
        let winners: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(winners, 1);
    }
}
