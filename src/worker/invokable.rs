use std::future::Future;
use std::pin::Pin;

use crate::graph::TaskId;
use crate::worker::WorkerId;

/// Future returned by [`Invokable::invoke`]. An `Err` carries the failure
/// cause reported back to the scheduler.
pub type InvokeFuture = Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send>>;

/// Execution-time information handed to an invokable.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext {
    pub task: TaskId,
    pub attempt: u32,
    pub worker: WorkerId,
}

/// The behavior a task executes. Opaque to the scheduler; it only observes
/// the terminal outcome.
pub trait Invokable: Send + Sync {
    fn invoke(&self, ctx: TaskContext) -> InvokeFuture;
}

/// Invokable that completes immediately without doing anything.
pub struct NoOpInvokable;

impl Invokable for NoOpInvokable {
    fn invoke(&self, _ctx: TaskContext) -> InvokeFuture {
        Box::pin(async { Ok(()) })
    }
}
