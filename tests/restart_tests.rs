//! Restart strategy bounds: per-scope attempt counters, exhaustion, and the
//! cause surfaced by a failed job.


use std::sync::atomic::Ordering;
use std::time::Duration;

use dataflow_lite::config::JobConfig;
use dataflow_lite::error::DataflowError;
use dataflow_lite::failover::{FailoverStrategy, RestartStrategy};
use dataflow_lite::graph::{JobGraph, JobVertex};
use dataflow_lite::scheduler::{JobOutcome, JobStatus};
use test_harness::{
    await_outcome, AlwaysFailingInvokable, DeploymentLog, IndexFailingInvokable, TestFleet,
};

fn config(failover: FailoverStrategy, max_attempts: u32) -> JobConfig {
    JobConfig::new()
        .with_failover(failover)
        .with_restart(RestartStrategy::fixed_delay(
            max_attempts,
            Duration::from_millis(10),
        ))
        .with_allocation_timeout(Duration::from_secs(5))
}

/// Test 1: FixedDelay(k) gives a persistently failing task exactly k restart
/// cycles; the (k+1)-th failure fails the job without another deployment.
#[tokio::test]
async fn test_restart_bound_is_exact() {
    let fleet = TestFleet::new(1, 1).await;
    let (invokable, invocations) = AlwaysFailingInvokable::new();

    let mut builder = JobGraph::builder("always-failing");
    builder.add_vertex(JobVertex::new("cursed", 1, invokable));
    let graph = builder.build().unwrap();

    let job_id = fleet
        .cluster
        .submit(graph, config(FailoverStrategy::Region, 2))
        .await
        .unwrap();
    let outcome = await_outcome(&fleet.cluster, job_id).await;

    // Initial attempt plus two restarts.
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    match outcome {
        JobOutcome::Failure(DataflowError::RestartsExhausted { attempts, cause }) => {
            assert_eq!(attempts, 2);
            assert!(cause.contains("always fails"), "cause was: {cause}");
        }
        other => panic!("expected RestartsExhausted, got {other:?}"),
    }

    // No further deployment happens after the job failed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    let record = fleet.cluster.job_status(job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.as_deref().unwrap_or("").contains("always fails"));
}

/// Test 2: with regional failover each region owns its attempt counter, so
/// one flaky subtask cannot exhaust another region's budget.
#[tokio::test]
async fn test_region_counters_are_independent() {
    let fleet = TestFleet::new(2, 2).await;
    let log = DeploymentLog::new();

    // Subtask 0 fails twice; subtask 1 is healthy. No edges, so each
    // subtask is its own region.
    let mut builder = JobGraph::builder("flaky-region");
    builder.add_vertex(JobVertex::new(
        "flaky",
        2,
        IndexFailingInvokable::new(log.clone(), 0, 2),
    ));
    let graph = builder.build().unwrap();

    let job_id = fleet
        .cluster
        .submit(graph, config(FailoverStrategy::Region, 2))
        .await
        .unwrap();
    let outcome = await_outcome(&fleet.cluster, job_id).await;

    assert!(outcome.is_success(), "region budget exhausted: {outcome:?}");
    let restarted = log.restarted_tasks();
    assert_eq!(restarted.len(), 1);
    assert_eq!(restarted[0].index, 0);
}

/// Test 3: with full failover there is a single shared counter, so failures
/// of different subtasks drain the same budget.
#[tokio::test]
async fn test_full_scope_shares_one_counter() {
    let fleet = TestFleet::new(2, 2).await;
    let log = DeploymentLog::new();

    // One failure on subtask 0's first run, then one on subtask 1's second
    // run (its first run after the full restart).
    let mut builder = JobGraph::builder("shared-budget");
    builder.add_vertex(JobVertex::new(
        "a",
        1,
        IndexFailingInvokable::new(log.clone(), 0, 1),
    ));
    builder.add_vertex(JobVertex::new(
        "b",
        1,
        IndexFailingInvokable::new(log.clone(), 0, 2),
    ));
    let graph = builder.build().unwrap();

    let job_id = fleet
        .cluster
        .submit(graph, config(FailoverStrategy::Full, 1))
        .await
        .unwrap();
    let outcome = await_outcome(&fleet.cluster, job_id).await;

    match outcome {
        JobOutcome::Failure(DataflowError::RestartsExhausted { attempts, .. }) => {
            assert_eq!(attempts, 1, "the single shared budget was already spent");
        }
        other => panic!("expected RestartsExhausted, got {other:?}"),
    }
}

/// Test 4: the same two-failure pattern recovers under regional failover
/// because the two vertices fail in different regions.
#[tokio::test]
async fn test_region_scope_survives_shared_budget_pattern() {
    let fleet = TestFleet::new(2, 2).await;
    let log = DeploymentLog::new();

    let mut builder = JobGraph::builder("independent-budget");
    builder.add_vertex(JobVertex::new(
        "a",
        1,
        IndexFailingInvokable::new(log.clone(), 0, 1),
    ));
    builder.add_vertex(JobVertex::new(
        "b",
        1,
        IndexFailingInvokable::new(log.clone(), 0, 1),
    ));
    let graph = builder.build().unwrap();

    let job_id = fleet
        .cluster
        .submit(graph, config(FailoverStrategy::Region, 1))
        .await
        .unwrap();
    let outcome = await_outcome(&fleet.cluster, job_id).await;

    assert!(outcome.is_success(), "independent regions: {outcome:?}");
}
