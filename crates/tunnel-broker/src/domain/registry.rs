//! Connection registry - single source of truth for reachable workers.
//!
//! Mutated concurrently from every tunnel handler, the gateway and the
//! sweeper. All operations take one short lock and never perform I/O: the
//! registry hands out [`WorkerHandle`] clones and callers send outside it.

use crate::domain::error::RegistryError;
use crate::domain::frame::WorkerMetadata;
use crate::domain::ids::{ChannelId, WorkerId};
use crate::domain::worker::{WorkerHandle, WorkerInfo};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// How the gateway chooses a worker for a request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TargetSelector {
    /// Any live worker (the longest-registered one)
    #[default]
    Any,
    /// The most recently registered worker
    MostRecent,
    /// A specific worker
    Worker(WorkerId),
}

struct WorkerRecord {
    channel_id: ChannelId,
    handle: WorkerHandle,
    metadata: WorkerMetadata,
    registered_at: chrono::DateTime<chrono::Utc>,
    last_heartbeat_at: Instant,
    sequence: u64,
}

struct RegistryState {
    workers: HashMap<WorkerId, WorkerRecord>,
    channels: HashMap<ChannelId, WorkerId>,
    next_sequence: u64,
}

/// Registry of live workers
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState {
                workers: HashMap::new(),
                channels: HashMap::new(),
                next_sequence: 1,
            }),
        }
    }

    /// Register a worker on a channel and allocate its ID.
    ///
    /// A channel can own at most one worker record.
    pub fn register(
        &self,
        channel_id: ChannelId,
        handle: WorkerHandle,
        metadata: WorkerMetadata,
    ) -> Result<WorkerId, RegistryError> {
        let mut state = self.state.write();

        if state.channels.contains_key(&channel_id) {
            return Err(RegistryError::DuplicateChannel(channel_id));
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let worker_id = WorkerId::from_sequence(sequence);

        state.channels.insert(channel_id, worker_id.clone());
        state.workers.insert(
            worker_id.clone(),
            WorkerRecord {
                channel_id,
                handle,
                metadata,
                registered_at: chrono::Utc::now(),
                last_heartbeat_at: Instant::now(),
                sequence,
            },
        );

        info!(
            worker_id = %worker_id,
            channel_id = %channel_id,
            workers = state.workers.len(),
            "Registered worker"
        );

        Ok(worker_id)
    }

    /// Record liveness for a worker
    pub fn touch(&self, worker_id: &WorkerId) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        match state.workers.get_mut(worker_id) {
            Some(record) => {
                record.last_heartbeat_at = Instant::now();
                Ok(())
            }
            None => Err(RegistryError::UnknownWorker(worker_id.clone())),
        }
    }

    /// Pick a worker for a request.
    ///
    /// Workers whose channel is already closing are never returned.
    pub fn pick_available(
        &self,
        selector: &TargetSelector,
    ) -> Result<(WorkerId, WorkerHandle), RegistryError> {
        let state = self.state.read();
        let mut live = state
            .workers
            .iter()
            .filter(|(_, record)| !record.handle.is_closed());

        let picked = match selector {
            TargetSelector::Any => live.min_by_key(|(_, record)| record.sequence),
            TargetSelector::MostRecent => live.max_by_key(|(_, record)| record.sequence),
            TargetSelector::Worker(wanted) => live.find(|(id, _)| *id == wanted),
        };

        picked
            .map(|(id, record)| (id.clone(), record.handle.clone()))
            .ok_or(RegistryError::NoWorkerAvailable)
    }

    /// Remove a worker. Removing an unknown ID is not an error.
    ///
    /// Returns true if a record was removed.
    pub fn remove(&self, worker_id: &WorkerId) -> bool {
        let mut state = self.state.write();
        match state.workers.remove(worker_id) {
            Some(record) => {
                state.channels.remove(&record.channel_id);
                info!(
                    worker_id = %worker_id,
                    channel_id = %record.channel_id,
                    workers = state.workers.len(),
                    "Removed worker"
                );
                true
            }
            None => {
                debug!(worker_id = %worker_id, "Remove for unknown worker ignored");
                false
            }
        }
    }

    /// Workers whose last heartbeat is older than `threshold`
    pub fn stale_workers(&self, threshold: Duration) -> Vec<(WorkerId, WorkerHandle)> {
        let now = Instant::now();
        let state = self.state.read();
        state
            .workers
            .iter()
            .filter(|(_, record)| now.duration_since(record.last_heartbeat_at) > threshold)
            .map(|(id, record)| (id.clone(), record.handle.clone()))
            .collect()
    }

    /// Handle for a specific worker
    pub fn get(&self, worker_id: &WorkerId) -> Option<WorkerHandle> {
        self.state
            .read()
            .workers
            .get(worker_id)
            .map(|record| record.handle.clone())
    }

    pub fn contains(&self, worker_id: &WorkerId) -> bool {
        self.state.read().workers.contains_key(worker_id)
    }

    /// Number of registered workers
    pub fn len(&self) -> usize {
        self.state.read().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every registered worker, oldest first
    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        let now = Instant::now();
        let state = self.state.read();
        let mut records: Vec<_> = state.workers.iter().collect();
        records.sort_by_key(|(_, record)| record.sequence);
        records
            .into_iter()
            .map(|(id, record)| WorkerInfo {
                worker_id: id.clone(),
                channel_id: record.channel_id,
                metadata: record.metadata.clone(),
                registered_at: record.registered_at,
                last_heartbeat_secs_ago: now
                    .duration_since(record.last_heartbeat_at)
                    .as_secs_f64(),
            })
            .collect()
    }
}
