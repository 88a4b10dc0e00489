//! Inbound gateway - the synchronous-looking entry point for external callers.
//!
//! `dispatch` picks a worker, parks a result slot in the pending table, queues
//! a `forward_request` on the worker's channel and waits on the slot until
//! the per-request deadline. Nothing here holds a registry or table lock
//! across an await.

use crate::domain::{
    ConnectionRegistry, DispatchConfig, DispatchError, Frame, PendingRequestTable, RequestId,
    TargetSelector, Termination, WorkerId, WorkerReply,
};
use crate::stats::{BrokerStats, DispatchOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A request answered by a worker
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub request_id: RequestId,
    pub worker_id: WorkerId,
    pub reply: WorkerReply,
    pub elapsed: Duration,
}

/// Inbound gateway
#[derive(Clone)]
pub struct InboundGateway {
    registry: Arc<ConnectionRegistry>,
    pending: Arc<PendingRequestTable>,
    config: DispatchConfig,
    stats: Arc<BrokerStats>,
}

impl InboundGateway {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        pending: Arc<PendingRequestTable>,
        config: DispatchConfig,
        stats: Arc<BrokerStats>,
    ) -> Self {
        Self {
            registry,
            pending,
            config,
            stats,
        }
    }

    /// Forward `payload` to a worker and wait for its reply.
    ///
    /// `timeout` defaults to the configured default and is clamped to the
    /// configured maximum. Never retries.
    pub async fn dispatch(
        &self,
        selector: &TargetSelector,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<Dispatched, DispatchError> {
        let started = Instant::now();
        let result = self.dispatch_inner(selector, payload, timeout, started).await;

        let latency_ms = started.elapsed().as_millis() as u64;
        self.stats.record_dispatch(outcome_of(&result), latency_ms);

        result
    }

    async fn dispatch_inner(
        &self,
        selector: &TargetSelector,
        payload: serde_json::Value,
        timeout: Option<Duration>,
        started: Instant,
    ) -> Result<Dispatched, DispatchError> {
        let (worker_id, handle) = self.registry.pick_available(selector)?;

        let timeout = self.config.effective_timeout(timeout);
        let deadline = started + timeout;

        let (request_id, mut rx) = self.pending.create(worker_id.clone(), deadline)?;
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id,
        };

        let frame = Frame::ForwardRequest {
            request_id,
            payload,
        };

        // A full outbound queue must not outlive the request's own deadline
        match tokio::time::timeout_at(deadline, handle.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(
                    request_id = %request_id,
                    worker_id = %worker_id,
                    error = %e,
                    "Send failed, worker channel already closed"
                );
                self.pending
                    .terminate(&request_id, Termination::WorkerDisconnected);
                return Err(DispatchError::WorkerDisconnected { request_id });
            }
            Err(_) => {
                self.pending.expire(&request_id);
                return Err(DispatchError::Timeout { request_id });
            }
        }

        debug!(
            request_id = %request_id,
            worker_id = %worker_id,
            timeout_ms = timeout.as_millis() as u64,
            "Forwarded request"
        );

        let slot = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(slot)) => slot,
            Ok(Err(_)) => {
                // Slot dropped without a result; only a cancel does that
                warn!(request_id = %request_id, "Result slot dropped");
                return Err(DispatchError::WorkerDisconnected { request_id });
            }
            Err(_) => {
                if self.pending.expire(&request_id) {
                    return Err(DispatchError::Timeout { request_id });
                }
                // Lost the race to another removal path; its result is in the slot
                match rx.try_recv() {
                    Ok(slot) => slot,
                    Err(_) => return Err(DispatchError::Timeout { request_id }),
                }
            }
        };

        match slot {
            Ok(reply) => Ok(Dispatched {
                request_id,
                worker_id,
                reply,
                elapsed: started.elapsed(),
            }),
            Err(termination) => Err(DispatchError::terminated(request_id, termination)),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn pending(&self) -> &Arc<PendingRequestTable> {
        &self.pending
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}

/// Releases the pending entry if the dispatch future is dropped mid-wait
struct PendingGuard<'a> {
    pending: &'a PendingRequestTable,
    request_id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        // No-op once the entry left the table by any other path
        self.pending.cancel(&self.request_id);
    }
}

fn outcome_of(result: &Result<Dispatched, DispatchError>) -> DispatchOutcome {
    match result {
        Ok(dispatched) if dispatched.reply.is_failure() => DispatchOutcome::WorkerFailed,
        Ok(_) => DispatchOutcome::Success,
        Err(DispatchError::NoWorkerAvailable) => DispatchOutcome::NoWorker,
        Err(DispatchError::Overloaded) => DispatchOutcome::Overloaded,
        Err(DispatchError::Timeout { .. }) => DispatchOutcome::Timeout,
        Err(DispatchError::WorkerDisconnected { .. }) => DispatchOutcome::Disconnected,
    }
}
