//! Per-job slot pool. Leases capacity from the worker registry, reuses
//! leased slots across attempts, bundles slot-sharing tasks into a single
//! allocation unit, and proactively returns idle slots to the registry.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::{DataflowError, Result};
use crate::graph::{GroupId, TaskId};
use crate::slots::SlotId;
use crate::worker::{WorkerId, WorkerRegistry};

/// Allocation unit: tasks sharing a group land in one slot per subtask
/// index; everything else gets a slot of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleKey {
    Shared { group: GroupId, index: u32 },
    Exclusive { task: TaskId },
}

impl BundleKey {
    pub fn for_task(group: Option<GroupId>, task: TaskId) -> Self {
        match group {
            Some(group) => BundleKey::Shared {
                group,
                index: task.index,
            },
            None => BundleKey::Exclusive { task },
        }
    }
}

struct Bundle {
    slot: SlotId,
    occupants: HashSet<TaskId>,
}

struct IdleSlot {
    slot: SlotId,
    since: Instant,
}

struct Waiter {
    id: u64,
    key: BundleKey,
    task: TaskId,
    preferred: Option<WorkerId>,
    tx: oneshot::Sender<SlotId>,
}

#[derive(Default)]
struct PoolInner {
    idle: Vec<IdleSlot>,
    bundles: HashMap<BundleKey, Bundle>,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

impl PoolInner {
    fn take_idle(&mut self, preferred: Option<WorkerId>) -> Option<SlotId> {
        let position = self
            .idle
            .iter()
            .position(|s| preferred.map_or(true, |w| s.slot.worker == w))?;
        Some(self.idle.remove(position).slot)
    }

    fn occupy(&mut self, key: BundleKey, task: TaskId, slot: SlotId) {
        let mut occupants = HashSet::new();
        occupants.insert(task);
        self.bundles.insert(key, Bundle { slot, occupants });
    }

    /// Hand a freed slot to the first waiter still listening; `None` when
    /// the slot was consumed, `Some` when no waiter took it.
    fn offer_to_waiters(&mut self, slot: SlotId) -> Option<SlotId> {
        while let Some(waiter) = self.waiters.pop_front() {
            let key = waiter.key;
            let task = waiter.task;
            if waiter.tx.send(slot).is_ok() {
                self.occupy(key, task, slot);
                return None;
            }
            // Receiver gave up (timeout); try the next one.
        }
        Some(slot)
    }
}

/// Slot pool for one job.
///
/// The free-slot set is mutated from allocation requests, release
/// notifications, and the idle sweep; a single mutex keeps each mutation
/// atomic. Queued requests are served in FIFO arrival order.
pub struct SlotPool {
    registry: Arc<WorkerRegistry>,
    allocation_timeout: Duration,
    inner: Arc<Mutex<PoolInner>>,
    sweeper: JoinHandle<()>,
}

impl SlotPool {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        slot_idle_timeout: Duration,
        allocation_timeout: Duration,
    ) -> Self {
        let inner = Arc::new(Mutex::new(PoolInner::default()));
        let sweeper = tokio::spawn(Self::sweep_loop(
            registry.clone(),
            inner.clone(),
            slot_idle_timeout,
        ));
        Self {
            registry,
            allocation_timeout,
            inner,
            sweeper,
        }
    }

    /// Acquire a slot for `task` under the bundle `key`.
    ///
    /// Joins the bundle's existing slot when other members already hold one.
    /// Otherwise allocation prefers, in order: an idle leased slot on the
    /// preferred worker, a fresh lease from the preferred worker, any idle
    /// leased slot, a fresh lease from any worker. With no capacity the
    /// request queues until a release or until the allocation timeout.
    ///
    /// Members of one bundle must acquire sequentially (the scheduler's
    /// control flow is serialized per job, so this holds by construction).
    pub async fn acquire(
        &self,
        key: BundleKey,
        task: TaskId,
        preferred: Option<WorkerId>,
    ) -> Result<SlotId> {
        let (waiter_id, rx) = {
            let mut inner = self.inner.lock().await;

            if let Some(bundle) = inner.bundles.get_mut(&key) {
                bundle.occupants.insert(task);
                return Ok(bundle.slot);
            }

            if let Some(worker) = preferred {
                if let Some(slot) = inner.take_idle(Some(worker)) {
                    inner.occupy(key, task, slot);
                    return Ok(slot);
                }
                if let Some(slot) = self.registry.lease(Some(worker)).await {
                    inner.occupy(key, task, slot);
                    return Ok(slot);
                }
            }
            if let Some(slot) = inner.take_idle(None) {
                inner.occupy(key, task, slot);
                return Ok(slot);
            }
            if let Some(slot) = self.registry.lease(None).await {
                inner.occupy(key, task, slot);
                return Ok(slot);
            }

            let (tx, rx) = oneshot::channel();
            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            inner.waiters.push_back(Waiter {
                id,
                key,
                task,
                preferred,
                tx,
            });
            tracing::debug!(task = %task, "No slot available, request queued");
            (id, rx)
        };

        match tokio::time::timeout(self.allocation_timeout, rx).await {
            Ok(Ok(slot)) => Ok(slot),
            Ok(Err(_)) => Err(DataflowError::Internal(
                "slot pool dropped while request was queued".to_string(),
            )),
            Err(_) => {
                let mut inner = self.inner.lock().await;
                inner.waiters.retain(|w| w.id != waiter_id);
                // The grant may have raced the timeout; accept it if so.
                if let Some(bundle) = inner.bundles.get(&key) {
                    if bundle.occupants.contains(&task) {
                        return Ok(bundle.slot);
                    }
                }
                Err(DataflowError::SlotAllocationTimeout(self.allocation_timeout))
            }
        }
    }

    /// Release `task`'s membership of its bundle. When the last member
    /// leaves, the slot goes to the first queued request, or into the idle
    /// set where the sweep can reclaim it.
    pub async fn release(&self, key: &BundleKey, task: &TaskId) {
        let mut inner = self.inner.lock().await;
        let Some(bundle) = inner.bundles.get_mut(key) else {
            return;
        };
        bundle.occupants.remove(task);
        if !bundle.occupants.is_empty() {
            return;
        }
        let slot = bundle.slot;
        inner.bundles.remove(key);
        if let Some(slot) = inner.offer_to_waiters(slot) {
            inner.idle.push(IdleSlot {
                slot,
                since: Instant::now(),
            });
        }
    }

    /// Return every held slot to the registry and drop queued requests.
    /// Called once when the job reaches a terminal state.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        let mut slots: Vec<SlotId> = inner.idle.drain(..).map(|s| s.slot).collect();
        slots.extend(inner.bundles.drain().map(|(_, b)| b.slot));
        inner.waiters.clear();
        for slot in slots {
            self.registry.release(slot).await;
        }
    }

    /// Leased slots currently idle in this pool.
    pub async fn idle_slot_count(&self) -> usize {
        self.inner.lock().await.idle.len()
    }

    async fn sweep_loop(
        registry: Arc<WorkerRegistry>,
        inner: Arc<Mutex<PoolInner>>,
        idle_timeout: Duration,
    ) {
        let period = (idle_timeout / 4).max(Duration::from_millis(5));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let mut inner = inner.lock().await;

            // Return slots idle past the timeout to the shared worker pool.
            let now = Instant::now();
            let mut reclaimed = Vec::new();
            inner.idle.retain(|s| {
                if now.duration_since(s.since) >= idle_timeout {
                    reclaimed.push(s.slot);
                    false
                } else {
                    true
                }
            });
            for slot in reclaimed {
                tracing::debug!(slot = %slot, "Idle slot returned to worker pool");
                registry.release(slot).await;
            }

            // Capacity may have appeared since requests queued (a worker
            // registered, or another job released); serve waiters in order.
            while let Some(preferred) = inner.waiters.front().map(|w| w.preferred) {
                let slot = match registry.lease(preferred).await {
                    Some(slot) => Some(slot),
                    None => registry.lease(None).await,
                };
                let Some(slot) = slot else { break };
                let Some(waiter) = inner.waiters.pop_front() else {
                    registry.release(slot).await;
                    break;
                };
                let key = waiter.key;
                let task = waiter.task;
                if waiter.tx.send(slot).is_ok() {
                    inner.occupy(key, task, slot);
                } else {
                    registry.release(slot).await;
                }
            }
        }
    }
}

impl Drop for SlotPool {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}
