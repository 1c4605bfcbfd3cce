use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{DataflowError, Result};
use crate::slots::SlotId;
use crate::worker::TaskHost;

pub type WorkerId = u64;

/// Public view of a registered worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub location: String,
    pub total_slots: u32,
}

struct WorkerEntry {
    info: WorkerInfo,
    host: Arc<dyn TaskHost>,
    free: BTreeSet<u32>,
}

/// Tracks the worker fleet and the free capacity each worker offers.
///
/// Slot pools lease capacity from here and hand it back, either when a job
/// terminates or when a leased slot sits idle past its timeout.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, WorkerEntry>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker and its execution handle. Re-registering an id
    /// replaces the previous entry and resets its free capacity.
    pub async fn register_worker(&self, info: WorkerInfo, host: Arc<dyn TaskHost>) {
        let mut workers = self.workers.write().await;
        tracing::info!(
            worker = info.id,
            location = %info.location,
            slots = info.total_slots,
            "Worker registered"
        );
        let free = (0..info.total_slots).collect();
        workers.insert(info.id, WorkerEntry { info, host, free });
    }

    /// Remove a worker. Its slots become unavailable immediately; attempts
    /// already running on it surface their own terminal events.
    pub async fn deregister_worker(&self, id: WorkerId) -> Result<()> {
        let mut workers = self.workers.write().await;
        if workers.remove(&id).is_none() {
            return Err(DataflowError::WorkerNotFound(id));
        }
        tracing::info!(worker = id, "Worker deregistered");
        Ok(())
    }

    /// All registered workers, ordered by id.
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let workers = self.workers.read().await;
        let mut infos: Vec<WorkerInfo> = workers.values().map(|e| e.info.clone()).collect();
        infos.sort_by_key(|w| w.id);
        infos
    }

    pub async fn host(&self, id: WorkerId) -> Option<Arc<dyn TaskHost>> {
        self.workers.read().await.get(&id).map(|e| e.host.clone())
    }

    pub async fn available_slots(&self, id: WorkerId) -> Option<u32> {
        self.workers.read().await.get(&id).map(|e| e.free.len() as u32)
    }

    /// Lease one slot. With a preferred worker, only that worker is
    /// considered; otherwise the least-loaded worker wins, lowest id on ties.
    pub(crate) async fn lease(&self, preferred: Option<WorkerId>) -> Option<SlotId> {
        let mut workers = self.workers.write().await;
        let entry = match preferred {
            Some(id) => {
                let entry = workers.get_mut(&id)?;
                if entry.free.is_empty() {
                    return None;
                }
                entry
            }
            None => {
                let id = workers
                    .values()
                    .filter(|e| !e.free.is_empty())
                    .max_by(|a, b| {
                        a.free
                            .len()
                            .cmp(&b.free.len())
                            .then(b.info.id.cmp(&a.info.id))
                    })
                    .map(|e| e.info.id)?;
                workers.get_mut(&id)?
            }
        };
        let index = entry.free.pop_first()?;
        Some(SlotId {
            worker: entry.info.id,
            index,
        })
    }

    /// Return a leased slot to its worker. A no-op if the worker is gone.
    pub(crate) async fn release(&self, slot: SlotId) {
        let mut workers = self.workers.write().await;
        if let Some(entry) = workers.get_mut(&slot.worker) {
            entry.free.insert(slot.index);
        }
    }
}
