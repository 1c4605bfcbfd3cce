//! Failure handling policies: which tasks restart after a failure, and
//! whether another restart is allowed at all.

pub mod restart;

pub use restart::{RestartDecision, RestartStrategy};

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::graph::{ExchangeMode, JobGraph, TaskId};

/// Scope of restart after a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverStrategy {
    /// Restart every task of the job.
    Full,
    /// Restart only the tasks connected to the failed one through pipelined
    /// edges. In-flight pipelined data cannot be replayed, so producer and
    /// consumer must restart together; blocking edges persist their output
    /// and cut the traversal.
    Region,
}

impl FailoverStrategy {
    /// The set of tasks to restart for a failure of `failed`. Always
    /// contains `failed` and is closed under pipelined reachability.
    pub fn restart_set(&self, graph: &JobGraph, failed: TaskId) -> BTreeSet<TaskId> {
        match self {
            FailoverStrategy::Full => graph.tasks().into_iter().collect(),
            FailoverStrategy::Region => pipelined_region(graph, failed),
        }
    }
}

/// Tasks reachable from `failed` by traversing pipelined connections in both
/// directions, following each edge's distribution-pattern pairing.
fn pipelined_region(graph: &JobGraph, failed: TaskId) -> BTreeSet<TaskId> {
    let mut region = BTreeSet::new();
    let mut frontier = VecDeque::new();
    region.insert(failed);
    frontier.push_back(failed);

    while let Some(task) = frontier.pop_front() {
        for edge in graph.edges() {
            if edge.exchange != ExchangeMode::Pipelined {
                continue;
            }
            if edge.source == task.vertex {
                for index in graph.downstream_subtasks(edge, task.index) {
                    let next = TaskId::new(edge.target, index);
                    if region.insert(next) {
                        frontier.push_back(next);
                    }
                }
            }
            if edge.target == task.vertex {
                for index in graph.upstream_subtasks(edge, task.index) {
                    let next = TaskId::new(edge.source, index);
                    if region.insert(next) {
                        frontier.push_back(next);
                    }
                }
            }
        }
    }
    region
}
