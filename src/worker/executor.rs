use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{DataflowError, Result};
use crate::scheduler::ExecutionAttemptId;
use crate::slots::SlotId;
use crate::worker::{Invokable, TaskContext, WorkerId};

/// Terminal outcome of one task attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Finished,
    Failed(String),
    Canceled,
}

/// Exactly one of these is reported per deployed attempt.
#[derive(Debug, Clone)]
pub struct TaskTermination {
    pub attempt: ExecutionAttemptId,
    pub outcome: TaskOutcome,
}

/// Everything a worker needs to run one attempt.
pub struct TaskDeployment {
    pub attempt: ExecutionAttemptId,
    pub slot: SlotId,
    pub invokable: Arc<dyn Invokable>,
    pub terminations: mpsc::Sender<TaskTermination>,
}

/// Execution handle offered by a worker: accept deployments, cancel attempts,
/// and report exactly one terminal event per attempt on the deployment's
/// termination channel.
pub trait TaskHost: Send + Sync {
    fn worker_id(&self) -> WorkerId;

    fn deploy(&self, deployment: TaskDeployment) -> Result<()>;

    fn cancel(&self, attempt: &ExecutionAttemptId);
}

/// In-process worker: runs each attempt's invokable on a spawned tokio task
/// with a per-attempt cancellation token.
pub struct LocalWorker {
    id: WorkerId,
    running: Arc<Mutex<HashMap<ExecutionAttemptId, CancellationToken>>>,
}

impl LocalWorker {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of attempts currently hosted by this worker.
    pub fn running_attempts(&self) -> usize {
        self.running.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl TaskHost for LocalWorker {
    fn worker_id(&self) -> WorkerId {
        self.id
    }

    fn deploy(&self, deployment: TaskDeployment) -> Result<()> {
        let token = CancellationToken::new();
        {
            let mut running = self
                .running
                .lock()
                .map_err(|_| DataflowError::Internal("worker state lock poisoned".to_string()))?;
            running.insert(deployment.attempt, token.clone());
        }

        let ctx = TaskContext {
            task: deployment.attempt.task,
            attempt: deployment.attempt.number,
            worker: self.id,
        };
        let running = self.running.clone();
        let worker = self.id;
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => TaskOutcome::Canceled,
                result = deployment.invokable.invoke(ctx) => match result {
                    Ok(()) => TaskOutcome::Finished,
                    Err(reason) => TaskOutcome::Failed(reason),
                },
            };
            if let Ok(mut running) = running.lock() {
                running.remove(&deployment.attempt);
            }
            tracing::debug!(
                worker,
                attempt = %deployment.attempt,
                outcome = ?outcome,
                "Attempt terminated"
            );
            let _ = deployment
                .terminations
                .send(TaskTermination {
                    attempt: deployment.attempt,
                    outcome,
                })
                .await;
        });
        Ok(())
    }

    fn cancel(&self, attempt: &ExecutionAttemptId) {
        if let Ok(running) = self.running.lock() {
            if let Some(token) = running.get(attempt) {
                token.cancel();
            }
        }
    }
}
