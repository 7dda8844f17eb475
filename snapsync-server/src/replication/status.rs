use super::types::ReplicationState;
use crate::core::SnapshotHandle;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

/// How a transfer ended, as far as the shared counters are concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The transfer ran (successfully or not) after reaching the replica
    Finished,
    /// The replica could not be reached
    Failed,
}

/// Point-in-time copy of the shared counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatusCounters {
    pub started: u64,
    pub finished: u64,
    pub failed: u64,
    pub state: ReplicationState,
    pub has_snapshot: bool,
}

impl StatusCounters {
    /// Every started or failed transfer has been accounted for
    pub fn all_accounted(&self) -> bool {
        self.finished == self.started + self.failed
    }
}

#[derive(Default)]
struct StatusInner {
    started: u64,
    finished: u64,
    failed: u64,
    state: ReplicationState,
    snapshot: Option<SnapshotHandle>,
}

impl StatusInner {
    fn counters(&self) -> StatusCounters {
        StatusCounters {
            started: self.started,
            finished: self.finished,
            failed: self.failed,
            state: self.state,
            has_snapshot: self.snapshot.is_some(),
        }
    }
}

/// Replication bookkeeping shared by the server and every transfer worker
///
/// One mutex guards the counters, the aggregate state and the snapshot
/// handle. It is only held for the O(1) updates below, never across I/O.
#[derive(Default)]
pub struct ReplicationStatus {
    inner: Mutex<StatusInner>,
}

impl ReplicationStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the snapshot later transfers will stream, returning the previous one
    pub fn install_snapshot(&self, snapshot: SnapshotHandle) -> Option<SnapshotHandle> {
        let keys = snapshot.len();
        let previous = self.inner.lock().snapshot.replace(snapshot);
        info!(
            "Installed replication snapshot ({} keys, replaced: {})",
            keys,
            previous.is_some()
        );
        previous
    }

    /// Drop the server's reference to the snapshot
    ///
    /// Transfers that already cloned the handle keep iterating it.
    pub fn release_snapshot(&self) -> Option<SnapshotHandle> {
        self.inner.lock().snapshot.take()
    }

    pub fn snapshot(&self) -> Option<SnapshotHandle> {
        self.inner.lock().snapshot.clone()
    }

    /// Clone the snapshot for a transfer and mark the transfer pending
    ///
    /// Both happen under one lock. Without a snapshot nothing changes. The
    /// returned guard records the transfer exactly once.
    pub fn acquire_snapshot(&self) -> Option<(SnapshotHandle, TransferGuard<'_>)> {
        let mut inner = self.inner.lock();
        let snapshot = inner.snapshot.clone()?;
        inner.state = ReplicationState::InProgress;
        drop(inner);

        Some((
            snapshot,
            TransferGuard {
                status: self,
                started: false,
                recorded: false,
            },
        ))
    }

    /// A worker reached its replica; the transfer is pending until recorded
    pub fn mark_started(&self) -> StatusCounters {
        let mut inner = self.inner.lock();
        inner.started += 1;
        inner.state = ReplicationState::InProgress;
        inner.counters()
    }

    /// Account for one ended transfer and re-evaluate the aggregate state
    ///
    /// A failed transfer counts in both `failed` and `finished`. The state
    /// becomes `End` exactly when `finished == started + failed`.
    pub fn record(&self, completion: Completion) -> StatusCounters {
        let mut inner = self.inner.lock();
        if completion == Completion::Failed {
            inner.failed += 1;
        }
        inner.finished += 1;

        if inner.finished == inner.started + inner.failed {
            inner.state = ReplicationState::End;
        }

        let counters = inner.counters();
        drop(inner);

        debug!(
            "Replication {:?}: started={} finished={} failed={} state={:?}",
            completion, counters.started, counters.finished, counters.failed, counters.state
        );
        counters
    }

    pub fn counters(&self) -> StatusCounters {
        self.inner.lock().counters()
    }

    pub fn state(&self) -> ReplicationState {
        self.inner.lock().state
    }
}

/// Pending accounting for one transfer that acquired the snapshot
///
/// Dropped without [`finish`](Self::finish) (a panicking worker), it records
/// `Finished` if the replica was reached and `Failed` otherwise.
pub struct TransferGuard<'a> {
    status: &'a ReplicationStatus,
    started: bool,
    recorded: bool,
}

impl TransferGuard<'_> {
    pub fn mark_started(&mut self) -> StatusCounters {
        self.started = true;
        self.status.mark_started()
    }

    pub fn finish(mut self, completion: Completion) -> StatusCounters {
        self.recorded = true;
        self.status.record(completion)
    }
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        if self.recorded {
            return;
        }
        let completion = if self.started {
            Completion::Finished
        } else {
            Completion::Failed
        };
        self.status.record(completion);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Engine, MemoryStore};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_initial_state() {
        let status = ReplicationStatus::new();
        let counters = status.counters();
        assert_eq!(counters, StatusCounters::default());
        assert_eq!(counters.state, ReplicationState::End);
        assert!(status.snapshot().is_none());
    }

    fn with_snapshot() -> ReplicationStatus {
        let store: MemoryStore = [("k", "v")].into_iter().collect();
        let status = ReplicationStatus::new();
        status.install_snapshot(store.snapshot());
        status
    }

    #[test]
    fn test_successful_transfer_reaches_end() {
        let status = with_snapshot();
        let (_snapshot, mut guard) = status.acquire_snapshot().unwrap();
        assert_eq!(status.state(), ReplicationState::InProgress);

        guard.mark_started();
        assert_eq!(status.state(), ReplicationState::InProgress);

        let counters = guard.finish(Completion::Finished);
        assert_eq!((counters.started, counters.finished, counters.failed), (1, 1, 0));
        assert_eq!(counters.state, ReplicationState::End);
        assert_eq!(status.counters().finished, 1);
    }

    #[test]
    fn test_failed_transfer_reaches_end() {
        let status = with_snapshot();
        let (_snapshot, guard) = status.acquire_snapshot().unwrap();

        let counters = guard.finish(Completion::Failed);
        assert_eq!((counters.started, counters.finished, counters.failed), (0, 1, 1));
        assert_eq!(counters.state, ReplicationState::End);
    }

    #[test]
    fn test_acquire_without_snapshot_changes_nothing() {
        let status = ReplicationStatus::new();
        assert!(status.acquire_snapshot().is_none());
        assert_eq!(status.counters(), StatusCounters::default());
        assert_eq!(status.state(), ReplicationState::End);
    }

    #[test]
    fn test_released_snapshot_is_not_acquired() {
        let status = with_snapshot();
        status.release_snapshot();
        assert!(status.acquire_snapshot().is_none());
        assert_eq!(status.state(), ReplicationState::End);
    }

    #[test]
    fn test_dropped_guard_still_records() {
        let status = with_snapshot();

        let (_snapshot, guard) = status.acquire_snapshot().unwrap();
        drop(guard);
        let counters = status.counters();
        assert_eq!((counters.started, counters.finished, counters.failed), (0, 1, 1));
        assert_eq!(counters.state, ReplicationState::End);

        let (_snapshot, mut guard) = status.acquire_snapshot().unwrap();
        guard.mark_started();
        drop(guard);
        let counters = status.counters();
        assert_eq!((counters.started, counters.finished, counters.failed), (1, 2, 1));
        assert_eq!(counters.state, ReplicationState::End);
    }

    #[test]
    fn test_guard_records_on_panic() {
        let status = with_snapshot();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let (_snapshot, mut guard) = status.acquire_snapshot().unwrap();
            guard.mark_started();
            panic!("worker failed mid transfer");
        }));

        assert!(result.is_err());
        let counters = status.counters();
        assert_eq!((counters.started, counters.finished, counters.failed), (1, 1, 0));
        assert_eq!(counters.state, ReplicationState::End);
    }

    #[test]
    fn test_pending_transfer_keeps_in_progress() {
        let status = ReplicationStatus::new();
        status.mark_started();
        status.mark_started();

        let counters = status.record(Completion::Finished);
        assert_eq!(counters.state, ReplicationState::InProgress);

        let counters = status.record(Completion::Finished);
        assert_eq!(counters.state, ReplicationState::End);
    }

    #[test]
    fn test_snapshot_install_and_release() {
        let store: MemoryStore = [("k", "v")].into_iter().collect();
        let status = ReplicationStatus::new();

        assert!(status.install_snapshot(store.snapshot()).is_none());
        assert!(status.counters().has_snapshot);
        assert!(status.install_snapshot(store.snapshot()).is_some());

        let held = status.snapshot().unwrap();
        assert!(status.release_snapshot().is_some());
        assert!(status.snapshot().is_none());
        assert_eq!(held.len(), 1);
    }

    #[test]
    fn test_concurrent_jobs_never_double_count() {
        let status = Arc::new(with_snapshot());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let status = Arc::clone(&status);
                thread::spawn(move || {
                    for round in 0..50 {
                        let (_snapshot, mut guard) = status.acquire_snapshot().unwrap();
                        let counters = if (i + round) % 5 == 0 {
                            guard.finish(Completion::Failed)
                        } else {
                            guard.mark_started();
                            guard.finish(Completion::Finished)
                        };
                        assert_eq!(
                            counters.state == ReplicationState::End,
                            counters.all_accounted(),
                        );
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let counters = status.counters();
        assert_eq!(counters.finished, 16 * 50);
        assert_eq!(counters.started + counters.failed, counters.finished);
        assert_eq!(counters.state, ReplicationState::End);
    }
}
