//! Backend Group State
//!
//! Per-kind pause gate, burst queue and in-flight accounting shared by the
//! router (which admits requests through the gate) and the burst coordinator
//! (which pauses a kind and waits for it to drain).
//!
//! ```text
//! route() ──> gate open? ──yes──> in_flight += 1 ──> ... ──> guard dropped, in_flight -= 1
//!                 │ no
//!                 v
//!          bounded FIFO queue ──> released in order when the gate reopens
//!
//! begin_burst() ──> close gate ──> wait until in_flight == 0
//! ```
//!
//! The in-flight counter is incremented under the gate lock, so once a kind is
//! paused no new request can slip past the drain.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::lane::{BackendKind, PerKind};

// ============================================================================
// Errors
// ============================================================================

/// Why a request could not pass a paused gate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateError {
    /// The queue already holds `depth` requests
    Full {
        /// Queue depth limit
        depth: usize,
    },
    /// The request waited its full timeout
    TimedOut {
        /// Time spent queued
        waited: Duration,
    },
}

// ============================================================================
// Kind Group
// ============================================================================

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct GateState {
    paused_by: Option<Uuid>,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

/// Gate and counters of one backend kind
pub struct KindGroup {
    kind: BackendKind,
    gate: Mutex<GateState>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl KindGroup {
    fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            gate: Mutex::new(GateState::default()),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Backend kind of this group
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Removes a queued request from the queue if it stops waiting
struct QueueSlot<'a> {
    group: &'a KindGroup,
    id: u64,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        let id = self.id;
        self.group.gate.lock().waiters.retain(|w| w.id != id);
    }
}

/// Counts a request as in flight until dropped
#[derive(Debug)]
pub struct InFlightGuard {
    group: Arc<KindGroup>,
}

impl InFlightGuard {
    /// Backend kind the request is running on
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        self.group.kind
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.group.release();
    }
}

impl std::fmt::Debug for KindGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindGroup")
            .field("kind", &self.kind)
            .field("in_flight", &self.in_flight.load(Ordering::Relaxed))
            .finish()
    }
}

/// Gate state at a point in time
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GateSnapshot {
    /// Backend kind
    pub kind: BackendKind,
    /// Session holding the pause, if any
    pub paused_by: Option<Uuid>,
    /// Requests waiting in the queue
    pub queued: usize,
    /// Requests currently running
    pub in_flight: usize,
}

// ============================================================================
// Backend Groups
// ============================================================================

/// Gates and in-flight counters for every backend kind
#[derive(Debug)]
pub struct BackendGroups {
    groups: PerKind<Arc<KindGroup>>,
}

impl Default for BackendGroups {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendGroups {
    /// Create open gates with nothing in flight
    #[must_use]
    pub fn new() -> Self {
        Self {
            groups: PerKind::from_fn(|kind| Arc::new(KindGroup::new(kind))),
        }
    }

    /// Pass the gate of `kind` and count the request as in flight
    ///
    /// Returns immediately when the gate is open. Otherwise the request joins
    /// the FIFO queue (at most `depth` entries) and waits until the gate
    /// reopens or `timeout` elapses. On success, returns the in-flight guard
    /// and the time spent queued.
    ///
    /// # Errors
    ///
    /// [`GateError::Full`] when the queue is at `depth`, [`GateError::TimedOut`]
    /// when the wait exceeds `timeout`. Either way the request is no longer
    /// queued.
    pub async fn admit(
        &self,
        kind: BackendKind,
        depth: usize,
        timeout: Duration,
    ) -> Result<(InFlightGuard, Duration), GateError> {
        let group = &self.groups[kind];
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let (id, rx) = {
                let mut gate = group.gate.lock();
                if gate.paused_by.is_none() {
                    group.in_flight.fetch_add(1, Ordering::AcqRel);
                    let guard = InFlightGuard {
                        group: Arc::clone(group),
                    };
                    return Ok((guard, started.elapsed()));
                }
                if gate.waiters.len() >= depth {
                    return Err(GateError::Full { depth });
                }
                let id = gate.next_waiter_id;
                gate.next_waiter_id += 1;
                let (tx, rx) = oneshot::channel();
                gate.waiters.push_back(Waiter { id, tx });
                (id, rx)
            };

            let _slot = QueueSlot { group, id };
            if tokio::time::timeout_at(deadline, rx).await.is_err() {
                return Err(GateError::TimedOut {
                    waited: started.elapsed(),
                });
            }
            // Released: loop to re-check the gate under the lock
        }
    }

    /// Close the gate of `kind` on behalf of `session_id`
    ///
    /// Returns the current holder if the gate is already paused.
    pub fn pause(&self, kind: BackendKind, session_id: Uuid) -> Result<(), Uuid> {
        let mut gate = self.groups[kind].gate.lock();
        match gate.paused_by {
            Some(holder) => Err(holder),
            None => {
                gate.paused_by = Some(session_id);
                Ok(())
            }
        }
    }

    /// Reopen the gate of `kind` if `session_id` holds it
    ///
    /// Queued requests are released in FIFO order. Returns how many were
    /// released, or `None` if the gate was not held by `session_id`.
    pub fn resume(&self, kind: BackendKind, session_id: Uuid) -> Option<usize> {
        let waiters = {
            let mut gate = self.groups[kind].gate.lock();
            if gate.paused_by != Some(session_id) {
                return None;
            }
            gate.paused_by = None;
            std::mem::take(&mut gate.waiters)
        };

        let mut released = 0;
        for waiter in waiters {
            if waiter.tx.send(()).is_ok() {
                released += 1;
            }
        }
        Some(released)
    }

    /// Whether the gate of `kind` is closed
    #[must_use]
    pub fn is_paused(&self, kind: BackendKind) -> bool {
        self.groups[kind].gate.lock().paused_by.is_some()
    }

    /// Requests waiting at the gate of `kind`
    #[must_use]
    pub fn queued(&self, kind: BackendKind) -> usize {
        self.groups[kind].gate.lock().waiters.len()
    }

    /// Requests of `kind` currently running
    #[must_use]
    pub fn in_flight(&self, kind: BackendKind) -> usize {
        self.groups[kind].in_flight.load(Ordering::Acquire)
    }

    /// Wait until nothing of `kind` is in flight
    pub async fn wait_drained(&self, kind: BackendKind) {
        let group = &self.groups[kind];
        loop {
            let notified = group.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if group.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Gate state of `kind`
    #[must_use]
    pub fn snapshot(&self, kind: BackendKind) -> GateSnapshot {
        let group = &self.groups[kind];
        let gate = group.gate.lock();
        GateSnapshot {
            kind,
            paused_by: gate.paused_by,
            queued: gate.waiters.len(),
            in_flight: group.in_flight.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIND: BackendKind = BackendKind::FastGpu;

    #[tokio::test]
    async fn test_open_gate_admits_immediately() {
        let groups = BackendGroups::new();

        let (guard, waited) = groups.admit(KIND, 1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(waited, Duration::ZERO);
        assert_eq!(guard.kind(), KIND);
        assert_eq!(groups.in_flight(KIND), 1);

        drop(guard);
        assert_eq!(groups.in_flight(KIND), 0);
    }

    #[test]
    fn test_pause_is_exclusive() {
        let groups = BackendGroups::new();
        let first = Uuid::new_v4();

        assert!(groups.pause(KIND, first).is_ok());
        assert_eq!(groups.pause(KIND, Uuid::new_v4()), Err(first));
        assert!(!groups.is_paused(BackendKind::LongContext));

        assert_eq!(groups.resume(KIND, Uuid::new_v4()), None);
        assert_eq!(groups.resume(KIND, first), Some(0));
        assert!(!groups.is_paused(KIND));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_rejects() {
        let groups = Arc::new(BackendGroups::new());
        let session = Uuid::new_v4();
        groups.pause(KIND, session).unwrap();

        let waiting = {
            let groups = Arc::clone(&groups);
            tokio::spawn(async move { groups.admit(KIND, 1, Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(groups.queued(KIND), 1);

        let rejected = groups.admit(KIND, 1, Duration::from_secs(30)).await;
        assert_eq!(rejected.unwrap_err(), GateError::Full { depth: 1 });

        assert_eq!(groups.resume(KIND, session), Some(1));
        let (guard, _) = waiting.await.unwrap().unwrap();
        assert_eq!(groups.in_flight(KIND), 1);
        drop(guard);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_dequeues() {
        let groups = BackendGroups::new();
        groups.pause(KIND, Uuid::new_v4()).unwrap();

        let result = groups.admit(KIND, 5, Duration::from_secs(2)).await;

        assert_eq!(
            result.unwrap_err(),
            GateError::TimedOut {
                waited: Duration::from_secs(2)
            }
        );
        assert_eq!(groups.queued(KIND), 0);
        assert_eq!(groups.in_flight(KIND), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_leaves_queue() {
        let groups = Arc::new(BackendGroups::new());
        groups.pause(KIND, Uuid::new_v4()).unwrap();

        let waiting = {
            let groups = Arc::clone(&groups);
            tokio::spawn(async move { groups.admit(KIND, 5, Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(groups.queued(KIND), 1);

        waiting.abort();
        let _ = waiting.await;
        assert_eq!(groups.queued(KIND), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_in_fifo_order() {
        let groups = Arc::new(BackendGroups::new());
        let session = Uuid::new_v4();
        groups.pause(KIND, session).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..3 {
            let groups = Arc::clone(&groups);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let (guard, _) = groups.admit(KIND, 10, Duration::from_secs(30)).await.unwrap();
                order.lock().push(i);
                drop(guard);
            }));
            // Enqueue in a known order
            tokio::task::yield_now().await;
        }
        assert_eq!(groups.queued(KIND), 3);

        assert_eq!(groups.resume(KIND, session), Some(3));
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_drained() {
        let groups = Arc::new(BackendGroups::new());
        let (guard, _) = groups.admit(KIND, 1, Duration::from_secs(1)).await.unwrap();

        let drained = {
            let groups = Arc::clone(&groups);
            tokio::spawn(async move { groups.wait_drained(KIND).await })
        };
        tokio::task::yield_now().await;
        assert!(!drained.is_finished());

        drop(guard);
        drained.await.unwrap();
        assert_eq!(groups.in_flight(KIND), 0);
    }

    #[test]
    fn test_snapshot() {
        let groups = BackendGroups::new();
        let session = Uuid::new_v4();
        groups.pause(BackendKind::LongContext, session).unwrap();

        let snapshot = groups.snapshot(BackendKind::LongContext);
        assert_eq!(snapshot.paused_by, Some(session));
        assert_eq!(snapshot.queued, 0);
        assert_eq!(snapshot.in_flight, 0);
    }
}
