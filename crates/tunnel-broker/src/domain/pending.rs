//! Pending request table - correlates worker replies with waiting callers.
//!
//! Flow:
//! 1. Gateway calls `create()` and gets a request ID plus a oneshot receiver
//! 2. Gateway sends `forward_request` with that ID to the worker
//! 3. Tunnel handler receives `forward_response` and calls `fulfill_from()`,
//!    which only accepts the reply from the worker the request was sent to
//! 4. Gateway awaits the receiver or its own deadline, then calls `expire()`
//!
//! Every entry leaves the table exactly once: by `fulfill`, `fulfill_from`, `expire`,
//! `fail_all_for_worker`, `remove_expired` or `cancel`. Whichever path
//! removes it owns the single send on the oneshot, so a result slot can
//! never be fulfilled twice.

use crate::domain::error::{PendingError, Termination};
use crate::domain::frame::WorkerReply;
use crate::domain::ids::{RequestId, WorkerId};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What a result slot resolves to
pub type SlotResult = Result<WorkerReply, Termination>;

/// A request waiting for its correlated response
struct PendingRequest {
    /// Single-assignment result slot
    sender: oneshot::Sender<SlotResult>,
    /// Worker the request was sent to
    target_worker_id: WorkerId,
    /// When request was created
    created_at: Instant,
    /// Absolute expiry
    deadline: Instant,
}

/// Statistics for the pending request table
#[derive(Debug, Default)]
pub struct PendingStats {
    /// Total entries created
    pub total_created: AtomicU64,
    /// Entries fulfilled by a worker response
    pub total_fulfilled: AtomicU64,
    /// Entries expired by deadline
    pub total_timeouts: AtomicU64,
    /// Entries failed because their worker vanished
    pub total_disconnected: AtomicU64,
    /// Entries dropped because the caller stopped waiting
    pub total_cancelled: AtomicU64,
    /// Responses for IDs that were not pending
    pub total_unknown: AtomicU64,
    /// Creations rejected by admission control
    pub total_rejected: AtomicU64,
}

/// Pending request table with admission control
pub struct PendingRequestTable {
    pending: DashMap<RequestId, PendingRequest>,
    /// Live entries, maintained alongside `pending` for the admission cap
    in_flight: AtomicUsize,
    max_pending: usize,
    stats: PendingStats,
}

impl PendingRequestTable {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: DashMap::new(),
            in_flight: AtomicUsize::new(0),
            max_pending,
            stats: PendingStats::default(),
        }
    }

    /// Allocate a request ID and an empty result slot.
    ///
    /// Fails with `Overloaded` once `max_pending` entries are live.
    pub fn create(
        &self,
        target_worker_id: WorkerId,
        deadline: Instant,
    ) -> Result<(RequestId, oneshot::Receiver<SlotResult>), PendingError> {
        let limit = self.max_pending;
        if self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_err()
        {
            self.stats.total_rejected.fetch_add(1, Ordering::Relaxed);
            warn!(limit = limit, "Rejecting request: pending table full");
            return Err(PendingError::Overloaded { limit });
        }

        let request_id = RequestId::new();
        let (tx, rx) = oneshot::channel();

        debug!(
            request_id = %request_id,
            worker_id = %target_worker_id,
            "Created pending request"
        );

        self.pending.insert(
            request_id,
            PendingRequest {
                sender: tx,
                target_worker_id,
                created_at: Instant::now(),
                deadline,
            },
        );
        self.stats.total_created.fetch_add(1, Ordering::Relaxed);

        Ok((request_id, rx))
    }

    /// Fulfill an entry with a worker reply.
    ///
    /// Unknown, duplicate and late responses are a no-op. Returns true if an
    /// entry was fulfilled.
    pub fn fulfill(&self, request_id: &RequestId, reply: WorkerReply) -> bool {
        match self.take(request_id) {
            Some(entry) => self.deliver(request_id, entry, reply),
            None => self.record_unknown(request_id),
        }
    }

    /// Fulfill an entry only if `worker_id` is the worker it was sent to.
    ///
    /// A response from any other worker leaves the entry pending and counts
    /// as unknown.
    pub fn fulfill_from(
        &self,
        worker_id: &WorkerId,
        request_id: &RequestId,
        reply: WorkerReply,
    ) -> bool {
        let removed = self
            .pending
            .remove_if(request_id, |_, entry| entry.target_worker_id == *worker_id);

        match removed {
            Some((_, entry)) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.deliver(request_id, entry, reply)
            }
            None if self.pending.contains_key(request_id) => {
                warn!(
                    worker_id = %worker_id,
                    request_id = %request_id,
                    "Response from a worker the request was not sent to"
                );
                self.stats.total_unknown.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => self.record_unknown(request_id),
        }
    }

    /// Count and log a response that matches no entry.
    ///
    /// Takes any displayable ID so responses carrying an ID this table
    /// never issued land here too. Always returns false.
    pub fn record_unknown(&self, request_id: impl fmt::Display) -> bool {
        self.stats.total_unknown.fetch_add(1, Ordering::Relaxed);
        warn!(
            request_id = %request_id,
            "Response for unknown, duplicate or expired request ID"
        );
        false
    }

    fn deliver(&self, request_id: &RequestId, entry: PendingRequest, reply: WorkerReply) -> bool {
        let elapsed = entry.created_at.elapsed();
        self.stats.total_fulfilled.fetch_add(1, Ordering::Relaxed);
        if entry.sender.send(Ok(reply)).is_err() {
            debug!(
                request_id = %request_id,
                "Caller stopped waiting before response arrived"
            );
        }
        debug!(
            request_id = %request_id,
            worker_id = %entry.target_worker_id,
            response_time_ms = elapsed.as_millis() as u64,
            "Fulfilled pending request"
        );
        true
    }

    /// Remove an entry and, if it was still pending, fail it with `Timeout`
    pub fn expire(&self, request_id: &RequestId) -> bool {
        self.terminate(request_id, Termination::Timeout)
    }

    /// Remove an entry and fail it with the given termination.
    ///
    /// Used by the gateway when a send is known to have failed.
    pub fn terminate(&self, request_id: &RequestId, termination: Termination) -> bool {
        match self.take(request_id) {
            Some(entry) => {
                self.record_termination(termination);
                let _ = entry.sender.send(Err(termination));
                debug!(
                    request_id = %request_id,
                    worker_id = %entry.target_worker_id,
                    reason = %termination,
                    "Terminated pending request"
                );
                true
            }
            None => false,
        }
    }

    /// Fail every entry targeting `worker_id` with `WorkerDisconnected`.
    ///
    /// Returns the number of entries failed.
    pub fn fail_all_for_worker(&self, worker_id: &WorkerId) -> usize {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().target_worker_id == *worker_id)
            .map(|entry| *entry.key())
            .collect();

        let failed = ids
            .iter()
            .filter(|id| self.terminate(id, Termination::WorkerDisconnected))
            .count();

        if failed > 0 {
            warn!(
                worker_id = %worker_id,
                failed = failed,
                "Failed pending requests of disconnected worker"
            );
        }
        failed
    }

    /// Expire every entry past its deadline.
    ///
    /// Returns the number of entries expired.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        ids.iter().filter(|id| self.expire(id)).count()
    }

    /// Drop an entry without fulfilling it (the caller is gone)
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        if self.take(request_id).is_some() {
            self.stats.total_cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(request_id = %request_id, "Cancelled pending request");
            true
        } else {
            false
        }
    }

    /// Number of currently pending requests
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if a request ID is pending
    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn stats(&self) -> &PendingStats {
        &self.stats
    }

    fn take(&self, request_id: &RequestId) -> Option<PendingRequest> {
        let (_, entry) = self.pending.remove(request_id)?;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        Some(entry)
    }

    fn record_termination(&self, termination: Termination) {
        let counter = match termination {
            Termination::Timeout => &self.stats.total_timeouts,
            Termination::WorkerDisconnected => &self.stats.total_disconnected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
