use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use dataflow_lite::config::JobConfig;
use dataflow_lite::failover::{FailoverStrategy, RestartStrategy};
use dataflow_lite::graph::{DistributionPattern, ExchangeMode, JobGraph, JobVertex};
use dataflow_lite::scheduler::JobOutcome;
use dataflow_lite::worker::{Invokable, InvokeFuture, NoOpInvokable, TaskContext};
use dataflow_lite::Cluster;

#[derive(Parser, Debug)]
#[command(name = "dataflow-lite")]
#[command(version)]
#[command(about = "A job scheduling and fault-recovery engine demo")]
struct Args {
    /// Number of in-process workers
    #[arg(long, default_value = "4")]
    workers: u64,

    /// Execution slots per worker
    #[arg(long, default_value = "1")]
    slots_per_worker: u32,

    /// Parallelism of the source and sink vertices
    #[arg(long, default_value = "4")]
    parallelism: u32,

    /// Restart scope after a failure
    #[arg(long, value_enum, default_value = "region")]
    failover: FailoverArg,

    /// Prefer redeploying recovered tasks to their previous worker
    #[arg(long)]
    local_recovery: bool,

    /// Make one source subtask fail exactly once
    #[arg(long)]
    inject_failure: bool,

    /// Maximum restarts per failover scope
    #[arg(long, default_value = "1")]
    restart_attempts: u32,

    /// Restart delay in milliseconds
    #[arg(long, default_value = "100")]
    restart_delay_ms: u64,

    /// Idle slot timeout in milliseconds
    #[arg(long, default_value = "50")]
    slot_idle_timeout_ms: u64,

    /// Output format
    #[arg(long, short = 'o', value_enum, default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum FailoverArg {
    Full,
    Region,
}

impl From<FailoverArg> for FailoverStrategy {
    fn from(arg: FailoverArg) -> Self {
        match arg {
            FailoverArg::Full => FailoverStrategy::Full,
            FailoverArg::Region => FailoverStrategy::Region,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct RunOutput {
    job_id: String,
    status: String,
    success: bool,
    error: Option<String>,
}

/// Fails exactly once across all subtasks, on the first invocation that
/// wins the latch. The latch lives for one run only.
struct OneTimeFailingInvokable {
    failed: Arc<AtomicBool>,
}

impl Invokable for OneTimeFailingInvokable {
    fn invoke(&self, ctx: TaskContext) -> InvokeFuture {
        let failed = self.failed.clone();
        Box::pin(async move {
            if failed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                Err(format!("injected one-time failure in {}", ctx.task))
            } else {
                Ok(())
            }
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let cluster = Cluster::new();
    for id in 1..=args.workers {
        cluster.add_local_worker(id, args.slots_per_worker).await;
    }

    let source_invokable: Arc<dyn Invokable> = if args.inject_failure {
        Arc::new(OneTimeFailingInvokable {
            failed: Arc::new(AtomicBool::new(false)),
        })
    } else {
        Arc::new(NoOpInvokable)
    };

    let mut builder = JobGraph::builder("source-sink");
    let source = builder.add_vertex(JobVertex::new("source", args.parallelism, source_invokable));
    let sink = builder.add_vertex(JobVertex::new(
        "sink",
        args.parallelism,
        Arc::new(NoOpInvokable),
    ));
    builder.connect(
        source,
        sink,
        DistributionPattern::Pointwise,
        ExchangeMode::Pipelined,
    );
    builder.slot_sharing_group([source, sink]);
    let graph = builder.build()?;

    let config = JobConfig::new()
        .with_local_recovery(args.local_recovery)
        .with_failover(args.failover.clone().into())
        .with_restart(RestartStrategy::fixed_delay(
            args.restart_attempts,
            Duration::from_millis(args.restart_delay_ms),
        ))
        .with_slot_idle_timeout(Duration::from_millis(args.slot_idle_timeout_ms));

    let job_id = cluster.submit(graph, config).await?;
    let outcome = cluster.await_result(job_id).await?;
    let record = cluster.job_status(job_id).await?;

    match args.output {
        OutputFormat::Json => {
            let output = RunOutput {
                job_id: job_id.to_string(),
                status: record.status.to_string(),
                success: outcome.is_success(),
                error: record.error,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID:  {job_id}");
            println!("Status:  {}", record.status);
            match &outcome {
                JobOutcome::Success => println!("Result:  success"),
                JobOutcome::Failure(cause) => println!("Result:  failure ({cause})"),
            }
        }
    }

    if outcome.is_success() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
