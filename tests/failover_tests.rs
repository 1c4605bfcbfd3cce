//! Failover scope, failure merging, deploy rejection, cancellation, and the
//! at-most-one-live-attempt guarantee.


use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dataflow_lite::config::JobConfig;
use dataflow_lite::error::DataflowError;
use dataflow_lite::failover::{FailoverStrategy, RestartStrategy};
use dataflow_lite::graph::{DistributionPattern, ExchangeMode, JobGraph, JobVertex};
use dataflow_lite::scheduler::{JobOutcome, JobStatus};
use dataflow_lite::worker::{
    Invokable, InvokeFuture, LocalWorker, TaskContext, TaskDeployment, TaskHost, WorkerId,
    WorkerInfo,
};
use test_harness::{
    await_outcome, one_time_latch, source_sink_graph, DeploymentLog, GuardedInvokable,
    LiveAttemptGuard, PendingInvokable, TestFleet, TestInvokable,
};

fn fast_config(failover: FailoverStrategy, max_attempts: u32) -> JobConfig {
    JobConfig::new()
        .with_failover(failover)
        .with_restart(RestartStrategy::fixed_delay(
            max_attempts,
            Duration::from_millis(20),
        ))
        .with_slot_idle_timeout(Duration::from_millis(50))
        .with_allocation_timeout(Duration::from_secs(5))
}

/// Test 1: regional failover restarts only the failed pipelined pair.
#[tokio::test]
async fn test_region_scope_confines_restart() {
    let fleet = TestFleet::new(2, 2).await;
    let log = DeploymentLog::new();
    let (graph, _, _) = source_sink_graph(
        4,
        TestInvokable::failing_once(log.clone(), one_time_latch()),
        TestInvokable::succeeding(log.clone()),
    );

    let job_id = fleet
        .cluster
        .submit(graph, fast_config(FailoverStrategy::Region, 1))
        .await
        .unwrap();
    assert!(await_outcome(&fleet.cluster, job_id).await.is_success());

    assert_eq!(log.restarted_tasks().len(), 2);
}

/// Test 2: full failover restarts every task of the job.
#[tokio::test]
async fn test_full_scope_restarts_all_tasks() {
    let fleet = TestFleet::new(2, 2).await;
    let log = DeploymentLog::new();
    let (graph, _, _) = source_sink_graph(
        4,
        TestInvokable::failing_once(log.clone(), one_time_latch()),
        TestInvokable::succeeding(log.clone()),
    );

    let job_id = fleet
        .cluster
        .submit(graph, fast_config(FailoverStrategy::Full, 1))
        .await
        .unwrap();
    assert!(await_outcome(&fleet.cluster, job_id).await.is_success());

    assert_eq!(log.restarted_tasks().len(), 8);
}

/// Test 3: a blocking edge cuts the failover region; the downstream side
/// re-consumes persisted output and never restarts.
#[tokio::test]
async fn test_blocking_edge_keeps_downstream_alive() {
    let fleet = TestFleet::new(2, 2).await;
    let log = DeploymentLog::new();

    let mut builder = JobGraph::builder("blocking");
    let source = builder.add_vertex(JobVertex::new(
        "source",
        2,
        TestInvokable::failing_once(log.clone(), one_time_latch()),
    ));
    let sink = builder.add_vertex(JobVertex::new(
        "sink",
        2,
        TestInvokable::succeeding(log.clone()),
    ));
    builder.connect(
        source,
        sink,
        DistributionPattern::Pointwise,
        ExchangeMode::Blocking,
    );
    let graph = builder.build().unwrap();

    let job_id = fleet
        .cluster
        .submit(graph, fast_config(FailoverStrategy::Region, 1))
        .await
        .unwrap();
    assert!(await_outcome(&fleet.cluster, job_id).await.is_success());

    let restarted = log.restarted_tasks();
    assert_eq!(restarted.len(), 1, "only the failed source task restarts");
    assert_eq!(restarted[0].vertex, source);
    for (task, runs) in log.all() {
        if task.vertex == sink {
            assert_eq!(runs.len(), 1, "sink task {task} must not restart");
        }
    }
}

/// Test 4: two subtasks failing at once are merged into a single restart
/// cycle instead of racing two cycles.
#[tokio::test]
async fn test_concurrent_failures_merge() {
    let fleet = TestFleet::new(4, 1).await;
    let log = DeploymentLog::new();

    // The first two invocations fail, whichever subtasks they are.
    struct FailTwice {
        log: DeploymentLog,
        failures: Arc<AtomicU32>,
    }
    impl Invokable for FailTwice {
        fn invoke(&self, ctx: TaskContext) -> InvokeFuture {
            let log = self.log.clone();
            let failures = self.failures.clone();
            Box::pin(async move {
                log.record(&ctx);
                if ctx.attempt == 1 && failures.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(format!("concurrent failure in {}", ctx.task));
                }
                Ok(())
            })
        }
    }

    let (graph, _, _) = source_sink_graph(
        4,
        Arc::new(FailTwice {
            log: log.clone(),
            failures: Arc::new(AtomicU32::new(0)),
        }),
        TestInvokable::succeeding(log.clone()),
    );

    // One allowed restart per scope: if the two failures were handled as two
    // separate cycles against one region's counter the job could not finish.
    let job_id = fleet
        .cluster
        .submit(graph, fast_config(FailoverStrategy::Region, 1))
        .await
        .unwrap();
    let outcome = await_outcome(&fleet.cluster, job_id).await;
    assert!(outcome.is_success(), "merged recovery failed: {outcome:?}");

    // Both failed pairs were redeployed.
    assert_eq!(log.restarted_tasks().len(), 4);
}

/// Host that rejects the first deployment it sees, then behaves normally.
struct RejectingHost {
    inner: LocalWorker,
    rejections_left: AtomicU32,
}

impl RejectingHost {
    fn new(id: WorkerId, rejections: u32) -> Self {
        Self {
            inner: LocalWorker::new(id),
            rejections_left: AtomicU32::new(rejections),
        }
    }
}

impl TaskHost for RejectingHost {
    fn worker_id(&self) -> WorkerId {
        self.inner.worker_id()
    }

    fn deploy(&self, deployment: TaskDeployment) -> dataflow_lite::Result<()> {
        if self
            .rejections_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DataflowError::DeployRejected {
                worker: self.worker_id(),
                reason: "worker rejected the deployment".to_string(),
            });
        }
        self.inner.deploy(deployment)
    }

    fn cancel(&self, attempt: &dataflow_lite::scheduler::ExecutionAttemptId) {
        self.inner.cancel(attempt);
    }
}

/// Test 5: a rejected deployment is treated as an immediate attempt failure
/// and recovered through the normal failover cycle.
#[tokio::test]
async fn test_deploy_rejection_enters_failover() {
    let cluster = dataflow_lite::Cluster::new();
    cluster
        .register_worker(
            WorkerInfo {
                id: 1,
                location: "local-1".to_string(),
                total_slots: 1,
            },
            Arc::new(RejectingHost::new(1, 1)),
        )
        .await;

    let log = DeploymentLog::new();
    let mut builder = JobGraph::builder("rejected");
    builder.add_vertex(JobVertex::new(
        "only",
        1,
        TestInvokable::succeeding(log.clone()),
    ));
    let graph = builder.build().unwrap();

    let job_id = cluster
        .submit(graph, fast_config(FailoverStrategy::Region, 2))
        .await
        .unwrap();
    let outcome = await_outcome(&cluster, job_id).await;

    assert!(outcome.is_success(), "job should survive the rejection");
    let deployments = log.all();
    assert_eq!(deployments.len(), 1);
    for (_, runs) in deployments {
        // The rejected attempt never ran; exactly one invocation happened.
        assert_eq!(runs.len(), 1);
    }
}

/// Test 6: no two attempts of one task are ever live at the same time, even
/// when the restart delay is far shorter than the running attempts.
#[tokio::test]
async fn test_at_most_one_live_attempt() {
    let fleet = TestFleet::new(2, 2).await;
    let guard = LiveAttemptGuard::new();

    // Sinks hold their slot well past the restart delay; the failed source's
    // pipelined partner must be confirmed canceled before its second attempt
    // may deploy.
    let source = GuardedInvokable::new(
        guard.clone(),
        Duration::from_millis(10),
        Some(one_time_latch()),
    );
    let sink = GuardedInvokable::new(guard.clone(), Duration::from_millis(150), None);
    let (graph, _, _) = source_sink_graph(2, source, sink);

    let config = JobConfig::new()
        .with_failover(FailoverStrategy::Region)
        .with_restart(RestartStrategy::fixed_delay(1, Duration::from_millis(10)))
        .with_allocation_timeout(Duration::from_secs(5));
    let job_id = fleet.cluster.submit(graph, config).await.unwrap();
    let outcome = await_outcome(&fleet.cluster, job_id).await;

    assert!(outcome.is_success(), "job should recover: {outcome:?}");
    assert!(
        !guard.violated(),
        "two attempts of one task were live at the same time"
    );
}

/// Test 7: canceling a job cancels its attempts and is idempotent.
#[tokio::test]
async fn test_cancel_job_is_idempotent() {
    let fleet = TestFleet::new(1, 2).await;
    let mut builder = JobGraph::builder("endless");
    builder.add_vertex(JobVertex::new("spin", 2, Arc::new(PendingInvokable)));
    let graph = builder.build().unwrap();

    let job_id = fleet
        .cluster
        .submit(graph, fast_config(FailoverStrategy::Region, 3))
        .await
        .unwrap();

    // Let the attempts start before canceling.
    tokio::time::sleep(Duration::from_millis(50)).await;
    fleet.cluster.cancel(job_id).await.unwrap();

    let outcome = await_outcome(&fleet.cluster, job_id).await;
    assert_eq!(outcome, JobOutcome::Failure(DataflowError::JobCanceled));

    let record = fleet.cluster.job_status(job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Canceled);

    // A second cancel is a no-op.
    fleet.cluster.cancel(job_id).await.unwrap();
    assert_eq!(
        fleet.cluster.job_status(job_id).await.unwrap().status,
        JobStatus::Canceled
    );
}

/// Test 8: a task restarting alone (blocking edge) rejoins its sharing
/// bundle's still-held slot, landing next to its partner again even with
/// local recovery disabled.
#[tokio::test]
async fn test_restarted_task_rejoins_live_bundle() {
    let fleet = TestFleet::new(2, 1).await;
    let log = DeploymentLog::new();

    // Sinks outlive the whole recovery cycle and keep their bundle slots.
    struct SlowSink {
        log: DeploymentLog,
    }
    impl Invokable for SlowSink {
        fn invoke(&self, ctx: TaskContext) -> InvokeFuture {
            let log = self.log.clone();
            Box::pin(async move {
                log.record(&ctx);
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(())
            })
        }
    }

    let mut builder = JobGraph::builder("rejoin");
    let source = builder.add_vertex(JobVertex::new(
        "source",
        2,
        TestInvokable::failing_once(log.clone(), one_time_latch()),
    ));
    let sink = builder.add_vertex(JobVertex::new(
        "sink",
        2,
        Arc::new(SlowSink { log: log.clone() }),
    ));
    builder.connect(
        source,
        sink,
        DistributionPattern::Pointwise,
        ExchangeMode::Blocking,
    );
    builder.slot_sharing_group([source, sink]);
    let graph = builder.build().unwrap();

    let job_id = fleet
        .cluster
        .submit(graph, fast_config(FailoverStrategy::Region, 1))
        .await
        .unwrap();
    assert!(await_outcome(&fleet.cluster, job_id).await.is_success());

    let restarted = log.restarted_tasks();
    assert_eq!(restarted.len(), 1, "only the failed source restarts");
    assert_eq!(restarted[0].vertex, source);
    let runs = log.deployments(&restarted[0]);
    assert_eq!(
        runs[0], runs[1],
        "the restarted source should rejoin its bundle's slot"
    );
    for (task, runs) in log.all() {
        if task.vertex == sink {
            assert_eq!(runs.len(), 1, "sink task {task} must not restart");
        }
    }
}

/// Test 9: canceling an unknown job id reports JobNotFound.
#[tokio::test]
async fn test_cancel_unknown_job() {
    let fleet = TestFleet::new(1, 1).await;
    let err = fleet.cluster.cancel(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, DataflowError::JobNotFound(_)));
}
