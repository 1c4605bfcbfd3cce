use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::TaskId;
use crate::slots::{BundleKey, SlotId};

/// One attempt of one task. Attempt numbers strictly increase per task;
/// at most one attempt per task is live at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionAttemptId {
    pub task: TaskId,
    pub number: u32,
}

impl fmt::Display for ExecutionAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.task, self.number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Created,
    Scheduled,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Created => write!(f, "created"),
            TaskStatus::Scheduled => write!(f, "scheduled"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Finished => write!(f, "finished"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Canceled => write!(f, "canceled"),
        }
    }
}

/// Scheduler-side state of one parallel task instance.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub task: TaskId,
    pub vertex_name: String,
    pub status: TaskStatus,
    /// Number of the current attempt; 0 before the first deployment.
    pub attempt: u32,
    pub slot: Option<SlotId>,
    pub bundle: BundleKey,
}

impl TaskExecution {
    pub fn new(task: TaskId, vertex_name: impl Into<String>, bundle: BundleKey) -> Self {
        Self {
            task,
            vertex_name: vertex_name.into(),
            status: TaskStatus::Created,
            attempt: 0,
            slot: None,
            bundle,
        }
    }

    pub fn current_attempt(&self) -> ExecutionAttemptId {
        ExecutionAttemptId {
            task: self.task,
            number: self.attempt,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.status, TaskStatus::Scheduled | TaskStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn new_execution_is_created_with_no_attempt() {
        let task = TaskId::new(Uuid::new_v4(), 0);
        let exec = TaskExecution::new(task, "source", BundleKey::Exclusive { task });

        assert_eq!(exec.status, TaskStatus::Created);
        assert_eq!(exec.attempt, 0);
        assert!(exec.slot.is_none());
        assert!(!exec.is_live());
    }

    #[test]
    fn attempt_id_display() {
        let task = TaskId::new(Uuid::new_v4(), 2);
        let mut exec = TaskExecution::new(task, "sink", BundleKey::Exclusive { task });
        exec.attempt = 3;
        let id = exec.current_attempt();
        assert_eq!(id.to_string(), format!("{task}#3"));
    }
}
