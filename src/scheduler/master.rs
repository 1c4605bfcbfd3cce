//! Per-job control loop.
//!
//! All state transitions for one job run on a single flow: task terminal
//! events, restart timers, and cancellation are consumed from channels and
//! processed strictly in order. Task execution itself runs in parallel on
//! the workers; only the control plane is serialized. The one blocking
//! point is slot acquisition, which is bounded by the allocation timeout
//! and converted into the normal failure path when it expires.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch, RwLock};

use crate::config::JobConfig;
use crate::error::{DataflowError, Result};
use crate::failover::RestartDecision;
use crate::graph::{JobGraph, TaskId};
use crate::scheduler::execution::{TaskExecution, TaskStatus};
use crate::scheduler::job::{JobId, JobOutcome, JobRecord, JobStatus};
use crate::slots::{BundleKey, LocationTracker, SlotPool};
use crate::worker::{TaskDeployment, TaskOutcome, TaskTermination, WorkerRegistry};

/// External control messages for a running job.
#[derive(Debug)]
pub enum JobControl {
    Cancel,
}

/// Owns all scheduler-side state of one job and drives it from submission
/// to a terminal status.
pub struct JobMaster {
    job_id: JobId,
    graph: Arc<JobGraph>,
    config: JobConfig,
    registry: Arc<WorkerRegistry>,
    pool: SlotPool,
    tracker: LocationTracker,
    record: Arc<RwLock<JobRecord>>,
    result_tx: watch::Sender<Option<JobOutcome>>,

    tasks: HashMap<TaskId, TaskExecution>,
    /// Restart cycles used, keyed by the smallest task id of the restart
    /// set. Regions are static per graph, so the key is stable; for full
    /// failover it degenerates to a single shared counter.
    restart_counts: HashMap<TaskId, u32>,
    /// Tasks to redeploy once the current restart cycle may proceed.
    pending_restart: BTreeSet<TaskId>,
    /// Canceled attempts whose terminal confirmation is still outstanding.
    canceling: BTreeSet<TaskId>,
    cycle_active: bool,
    delay_elapsed: bool,
    /// Invalidates restart timers from superseded cycles.
    epoch: u64,
    last_cause: Option<String>,
    outcome: Option<JobOutcome>,

    terminations_tx: mpsc::Sender<TaskTermination>,
    terminations_rx: mpsc::Receiver<TaskTermination>,
    control_rx: mpsc::Receiver<JobControl>,
    timer_tx: mpsc::Sender<u64>,
    timer_rx: mpsc::Receiver<u64>,
}

impl JobMaster {
    pub fn new(
        job_id: JobId,
        graph: Arc<JobGraph>,
        config: JobConfig,
        registry: Arc<WorkerRegistry>,
        record: Arc<RwLock<JobRecord>>,
        result_tx: watch::Sender<Option<JobOutcome>>,
        control_rx: mpsc::Receiver<JobControl>,
    ) -> Self {
        let pool = SlotPool::new(
            registry.clone(),
            config.slot_idle_timeout,
            config.allocation_timeout,
        );
        let tracker = LocationTracker::new(config.local_recovery);
        let (terminations_tx, terminations_rx) = mpsc::channel(1024);
        let (timer_tx, timer_rx) = mpsc::channel(16);

        let mut tasks = HashMap::new();
        for vertex in graph.vertices() {
            let group = graph.sharing_group_of(vertex.id());
            for index in 0..vertex.parallelism() {
                let task = TaskId::new(vertex.id(), index);
                let bundle = BundleKey::for_task(group, task);
                tasks.insert(task, TaskExecution::new(task, vertex.name(), bundle));
            }
        }

        Self {
            job_id,
            graph,
            config,
            registry,
            pool,
            tracker,
            record,
            result_tx,
            tasks,
            restart_counts: HashMap::new(),
            pending_restart: BTreeSet::new(),
            canceling: BTreeSet::new(),
            cycle_active: false,
            delay_elapsed: false,
            epoch: 0,
            last_cause: None,
            outcome: None,
            terminations_tx,
            terminations_rx,
            control_rx,
            timer_tx,
            timer_rx,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(
            job_id = %self.job_id,
            job = %self.graph.name(),
            tasks = self.tasks.len(),
            "Starting job"
        );

        if self.tasks.is_empty() {
            self.complete_success().await;
        } else {
            let initial = self.graph.tasks();
            let failures = self.deploy_set(initial).await;
            for (task, cause) in failures {
                self.handle_task_failure(task, cause).await;
                if self.outcome.is_some() {
                    break;
                }
            }
        }

        while self.outcome.is_none() {
            tokio::select! {
                Some(termination) = self.terminations_rx.recv() => {
                    self.handle_termination(termination).await;
                }
                Some(epoch) = self.timer_rx.recv() => {
                    self.handle_timer(epoch).await;
                }
                Some(control) = self.control_rx.recv() => match control {
                    JobControl::Cancel => self.handle_cancel().await,
                },
                else => break,
            }
        }

        self.pool.shutdown().await;
        let status = self.record.read().await.status;
        tracing::info!(job_id = %self.job_id, status = %status, "Job loop exited");
    }

    /// Deploy tasks in the given (topological) order, one at a time.
    /// Returns the tasks whose deployment failed, with causes.
    async fn deploy_set(&mut self, tasks: Vec<TaskId>) -> Vec<(TaskId, String)> {
        let mut failures = Vec::new();
        for task in tasks {
            if let Err(err) = self.deploy_task(task).await {
                tracing::warn!(
                    job_id = %self.job_id,
                    task = %task,
                    error = %err,
                    "Deployment failed"
                );
                if let Some(exec) = self.tasks.get_mut(&task) {
                    exec.status = TaskStatus::Failed;
                    exec.slot = None;
                }
                failures.push((task, err.to_string()));
            }
        }
        failures
    }

    async fn deploy_task(&mut self, task: TaskId) -> Result<()> {
        let key = self
            .tasks
            .get(&task)
            .ok_or_else(|| DataflowError::Internal(format!("unknown task {task}")))?
            .bundle;
        let preferred = self.tracker.hint(&task);

        let slot = self.pool.acquire(key, task, preferred).await?;
        let Some(host) = self.registry.host(slot.worker).await else {
            self.pool.release(&key, &task).await;
            return Err(DataflowError::WorkerNotFound(slot.worker));
        };
        let invokable = self
            .graph
            .vertex(task.vertex)
            .ok_or_else(|| DataflowError::Internal(format!("unknown vertex {}", task.vertex)))?
            .invokable();

        let exec = self
            .tasks
            .get_mut(&task)
            .ok_or_else(|| DataflowError::Internal(format!("unknown task {task}")))?;
        exec.attempt += 1;
        exec.slot = Some(slot);
        exec.status = TaskStatus::Scheduled;
        let attempt = exec.current_attempt();
        let vertex = exec.vertex_name.clone();

        let deployment = TaskDeployment {
            attempt,
            slot,
            invokable,
            terminations: self.terminations_tx.clone(),
        };
        match host.deploy(deployment) {
            Ok(()) => {
                if let Some(exec) = self.tasks.get_mut(&task) {
                    exec.status = TaskStatus::Running;
                }
                self.tracker.record(task, slot.worker);
                tracing::debug!(
                    job_id = %self.job_id,
                    vertex = %vertex,
                    attempt = %attempt,
                    slot = %slot,
                    "Task deployed"
                );
                Ok(())
            }
            Err(err) => {
                if let Some(exec) = self.tasks.get_mut(&task) {
                    exec.status = TaskStatus::Failed;
                    exec.slot = None;
                }
                self.pool.release(&key, &task).await;
                Err(err)
            }
        }
    }

    async fn handle_termination(&mut self, termination: TaskTermination) {
        if self.outcome.is_some() {
            return;
        }
        let task = termination.attempt.task;
        let Some(exec) = self.tasks.get(&task) else {
            tracing::debug!(
                job_id = %self.job_id,
                attempt = %termination.attempt,
                "Termination for unknown task ignored"
            );
            return;
        };
        if termination.attempt.number != exec.attempt {
            tracing::debug!(
                job_id = %self.job_id,
                attempt = %termination.attempt,
                current = exec.attempt,
                "Stale attempt termination ignored"
            );
            return;
        }
        let bundle = exec.bundle;
        let vertex = exec.vertex_name.clone();

        match termination.outcome {
            TaskOutcome::Finished => {
                self.mark_terminal(task, TaskStatus::Finished, bundle).await;
                tracing::debug!(job_id = %self.job_id, vertex = %vertex, task = %task, "Task finished");
                let was_canceling = self.note_cancel_progress(task).await;
                if !was_canceling && self.all_finished() {
                    self.complete_success().await;
                }
            }
            TaskOutcome::Canceled => {
                self.mark_terminal(task, TaskStatus::Canceled, bundle).await;
                self.note_cancel_progress(task).await;
            }
            TaskOutcome::Failed(reason) => {
                self.mark_terminal(task, TaskStatus::Failed, bundle).await;
                tracing::warn!(
                    job_id = %self.job_id,
                    vertex = %vertex,
                    task = %task,
                    cause = %reason,
                    "Task failed"
                );
                let was_canceling = self.note_cancel_progress(task).await;
                if !was_canceling {
                    let cause = DataflowError::TaskFailed {
                        task: task.to_string(),
                        reason,
                    }
                    .to_string();
                    self.handle_task_failure(task, cause).await;
                }
            }
        }
    }

    /// A failure enters the failover cycle: compute the restart set, merge
    /// it into an in-flight cycle if one exists, otherwise consult the
    /// restart strategy and either schedule the delay timer or abort.
    async fn handle_task_failure(&mut self, task: TaskId, cause: String) {
        if self.outcome.is_some() {
            return;
        }
        self.last_cause = Some(cause.clone());
        let set = self.config.failover.restart_set(&self.graph, task);

        if self.cycle_active {
            let merged = set
                .iter()
                .filter(|t| !self.pending_restart.contains(t))
                .count();
            if merged > 0 {
                tracing::info!(
                    job_id = %self.job_id,
                    task = %task,
                    merged,
                    "Failure merged into in-flight restart"
                );
            }
            for t in set {
                if self.pending_restart.insert(t) {
                    self.cancel_attempt(t).await;
                }
            }
            return;
        }

        let scope_key = *set
            .iter()
            .next()
            .expect("restart set always contains the failed task");
        let restarts_used = self.restart_counts.get(&scope_key).copied().unwrap_or(0);
        match self.config.restart.decide(restarts_used) {
            RestartDecision::Abort => {
                let cause = self.last_cause.clone().unwrap_or(cause);
                self.fail_job(DataflowError::RestartsExhausted {
                    attempts: restarts_used,
                    cause,
                })
                .await;
            }
            RestartDecision::RetryAfter(delay) => {
                self.restart_counts.insert(scope_key, restarts_used + 1);
                self.epoch += 1;
                self.cycle_active = true;
                self.delay_elapsed = false;
                self.pending_restart = set.clone();
                for t in &set {
                    self.cancel_attempt(*t).await;
                }
                self.set_status(JobStatus::Restarting).await;
                tracing::info!(
                    job_id = %self.job_id,
                    task = %task,
                    scope = set.len(),
                    restart = restarts_used + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Task failure triggers restart"
                );
                let timer_tx = self.timer_tx.clone();
                let epoch = self.epoch;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = timer_tx.send(epoch).await;
                });
            }
        }
    }

    async fn handle_timer(&mut self, epoch: u64) {
        if self.outcome.is_some() || !self.cycle_active || epoch != self.epoch {
            return;
        }
        self.delay_elapsed = true;
        if self.canceling.is_empty() {
            self.redeploy_pending().await;
        }
    }

    /// Redeploy the pending restart set with fresh attempt numbers. Only
    /// entered once the restart delay elapsed and every canceled attempt of
    /// the set reported terminal, which is what keeps at most one attempt
    /// per task live.
    async fn redeploy_pending(&mut self) {
        let set = std::mem::take(&mut self.pending_restart);
        self.cycle_active = false;
        self.delay_elapsed = false;

        let ordered: Vec<TaskId> = self
            .graph
            .tasks()
            .into_iter()
            .filter(|t| set.contains(t))
            .collect();
        tracing::info!(
            job_id = %self.job_id,
            tasks = ordered.len(),
            "Restart delay elapsed, redeploying"
        );
        let failures = self.deploy_set(ordered).await;
        if failures.is_empty() {
            self.set_status(JobStatus::Running).await;
        } else {
            for (task, cause) in failures {
                self.handle_task_failure(task, cause).await;
            }
        }
    }

    async fn handle_cancel(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        tracing::info!(job_id = %self.job_id, "Canceling job");
        self.epoch += 1;
        self.cycle_active = false;
        self.pending_restart.clear();
        self.canceling.clear();
        self.cancel_all_live().await;
        self.finish(
            JobStatus::Canceled,
            JobOutcome::Failure(DataflowError::JobCanceled),
        )
        .await;
    }

    /// Request cancellation of a task's live attempt and track the pending
    /// confirmation. A task whose worker is gone is marked canceled
    /// directly, since no terminal event can arrive for it.
    async fn cancel_attempt(&mut self, task: TaskId) {
        let Some(exec) = self.tasks.get(&task) else {
            return;
        };
        if !exec.is_live() {
            return;
        }
        let attempt = exec.current_attempt();
        let bundle = exec.bundle;
        let Some(slot) = exec.slot else {
            return;
        };
        match self.registry.host(slot.worker).await {
            Some(host) => {
                host.cancel(&attempt);
                self.canceling.insert(task);
            }
            None => {
                self.mark_terminal(task, TaskStatus::Canceled, bundle).await;
            }
        }
    }

    async fn cancel_all_live(&mut self) {
        let live: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.is_live())
            .map(|t| t.task)
            .collect();
        for task in live {
            let Some(exec) = self.tasks.get(&task) else {
                continue;
            };
            let attempt = exec.current_attempt();
            let bundle = exec.bundle;
            if let Some(slot) = exec.slot {
                if let Some(host) = self.registry.host(slot.worker).await {
                    host.cancel(&attempt);
                }
            }
            self.mark_terminal(task, TaskStatus::Canceled, bundle).await;
        }
    }

    async fn mark_terminal(&mut self, task: TaskId, status: TaskStatus, bundle: BundleKey) {
        if let Some(exec) = self.tasks.get_mut(&task) {
            exec.status = status;
            exec.slot = None;
        }
        self.pool.release(&bundle, &task).await;
    }

    /// Progress the in-flight restart cycle when a canceled attempt reports
    /// terminal. Returns whether the task was part of the cycle's cancel set.
    async fn note_cancel_progress(&mut self, task: TaskId) -> bool {
        if !self.canceling.remove(&task) {
            return false;
        }
        if self.cycle_active && self.delay_elapsed && self.canceling.is_empty() {
            self.redeploy_pending().await;
        }
        true
    }

    fn all_finished(&self) -> bool {
        self.tasks
            .values()
            .all(|t| t.status == TaskStatus::Finished)
    }

    async fn complete_success(&mut self) {
        tracing::info!(job_id = %self.job_id, "All tasks finished, job complete");
        self.finish(JobStatus::Finished, JobOutcome::Success).await;
    }

    async fn fail_job(&mut self, err: DataflowError) {
        tracing::error!(job_id = %self.job_id, error = %err, "Job failed");
        self.epoch += 1;
        self.cycle_active = false;
        self.pending_restart.clear();
        self.canceling.clear();
        self.cancel_all_live().await;
        self.finish(JobStatus::Failed, JobOutcome::Failure(err)).await;
    }

    async fn finish(&mut self, status: JobStatus, outcome: JobOutcome) {
        {
            let mut record = self.record.write().await;
            record.status = status;
            record.completed_at = Some(Utc::now());
            if let JobOutcome::Failure(err) = &outcome {
                record.error = Some(err.to_string());
            }
        }
        let _ = self.result_tx.send(Some(outcome.clone()));
        self.outcome = Some(outcome);
    }

    async fn set_status(&self, status: JobStatus) {
        let mut record = self.record.write().await;
        record.status = status;
    }
}
