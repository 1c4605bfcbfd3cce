//! In-process entry point: owns the worker registry and the running jobs,
//! exposes submit / await_result / cancel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::JobConfig;
use crate::error::{DataflowError, Result};
use crate::graph::JobGraph;
use crate::scheduler::{JobControl, JobId, JobMaster, JobOutcome, JobRecord};
use crate::worker::{LocalWorker, TaskHost, WorkerInfo, WorkerRegistry};

struct JobHandle {
    record: Arc<RwLock<JobRecord>>,
    control: mpsc::Sender<JobControl>,
    result: watch::Receiver<Option<JobOutcome>>,
    join: JoinHandle<()>,
}

/// A scheduler instance plus the worker fleet it schedules onto.
#[derive(Clone, Default)]
pub struct Cluster {
    registry: Arc<WorkerRegistry>,
    jobs: Arc<RwLock<HashMap<JobId, JobHandle>>>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        self.registry.clone()
    }

    /// Register a worker with a custom execution handle.
    pub async fn register_worker(&self, info: WorkerInfo, host: Arc<dyn TaskHost>) {
        self.registry.register_worker(info, host).await;
    }

    /// Spin up an in-process worker with the given capacity.
    pub async fn add_local_worker(&self, id: u64, slots: u32) -> Arc<LocalWorker> {
        let worker = Arc::new(LocalWorker::new(id));
        self.registry
            .register_worker(
                WorkerInfo {
                    id,
                    location: format!("local-{id}"),
                    total_slots: slots,
                },
                worker.clone(),
            )
            .await;
        worker
    }

    pub async fn deregister_worker(&self, id: u64) -> Result<()> {
        self.registry.deregister_worker(id).await
    }

    /// Submit a job for execution. The graph has already been validated by
    /// its builder; scheduling starts immediately.
    pub async fn submit(&self, graph: JobGraph, config: JobConfig) -> Result<JobId> {
        let job_id = Uuid::new_v4();
        let record = Arc::new(RwLock::new(JobRecord::new(job_id, graph.name())));
        let (result_tx, result_rx) = watch::channel(None);
        let (control_tx, control_rx) = mpsc::channel(8);

        let master = JobMaster::new(
            job_id,
            Arc::new(graph),
            config,
            self.registry.clone(),
            record.clone(),
            result_tx,
            control_rx,
        );
        let join = tokio::spawn(master.run());

        let mut jobs = self.jobs.write().await;
        jobs.insert(
            job_id,
            JobHandle {
                record,
                control: control_tx,
                result: result_rx,
                join,
            },
        );
        tracing::info!(job_id = %job_id, "Job submitted");
        Ok(job_id)
    }

    /// Wait for the job's terminal result. A failed job surfaces its last
    /// triggering cause.
    pub async fn await_result(&self, job_id: JobId) -> Result<JobOutcome> {
        let mut result = {
            let jobs = self.jobs.read().await;
            let handle = jobs
                .get(&job_id)
                .ok_or(DataflowError::JobNotFound(job_id))?;
            handle.result.clone()
        };
        let outcome = result
            .wait_for(|outcome| outcome.is_some())
            .await
            .map_err(|_| {
                DataflowError::Internal("job loop terminated without a result".to_string())
            })?
            .clone();
        outcome.ok_or_else(|| DataflowError::Internal("empty job result".to_string()))
    }

    /// Cancel a running job. Idempotent; canceling a finished job is a no-op.
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        let control = {
            let jobs = self.jobs.read().await;
            let handle = jobs
                .get(&job_id)
                .ok_or(DataflowError::JobNotFound(job_id))?;
            handle.control.clone()
        };
        // A closed channel means the job loop already exited.
        let _ = control.send(JobControl::Cancel).await;
        Ok(())
    }

    /// Current bookkeeping snapshot of a job.
    pub async fn job_status(&self, job_id: JobId) -> Result<JobRecord> {
        let jobs = self.jobs.read().await;
        let handle = jobs
            .get(&job_id)
            .ok_or(DataflowError::JobNotFound(job_id))?;
        let record = handle.record.read().await.clone();
        Ok(record)
    }

    /// All submitted jobs, newest last.
    pub async fn jobs(&self) -> Vec<JobRecord> {
        let jobs = self.jobs.read().await;
        let mut records = Vec::with_capacity(jobs.len());
        for handle in jobs.values() {
            records.push(handle.record.read().await.clone());
        }
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Abort every job loop. Used on teardown.
    pub async fn shutdown(&self) {
        let jobs = self.jobs.read().await;
        for handle in jobs.values() {
            handle.join.abort();
        }
    }
}
