use std::collections::HashMap;
use std::sync::RwLock;

use crate::graph::TaskId;
use crate::worker::WorkerId;

/// Remembers, per task, the worker of its most recent deployment so that a
/// recovered task can be offered its previous location. Hints survive
/// restarts and are discarded with the job.
pub struct LocationTracker {
    enabled: bool,
    last: RwLock<HashMap<TaskId, WorkerId>>,
}

impl LocationTracker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last: RwLock::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Record the worker a task was just deployed to.
    pub fn record(&self, task: TaskId, worker: WorkerId) {
        let mut last = self.last.write().expect("location tracker lock poisoned");
        last.insert(task, worker);
    }

    /// The preferred worker for a task, or `None` when local recovery is
    /// disabled or the task was never deployed.
    pub fn hint(&self, task: &TaskId) -> Option<WorkerId> {
        if !self.enabled {
            return None;
        }
        let last = self.last.read().expect("location tracker lock poisoned");
        last.get(task).copied()
    }
}
