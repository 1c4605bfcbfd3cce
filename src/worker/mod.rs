pub mod executor;
pub mod invokable;
pub mod registry;

pub use executor::{LocalWorker, TaskDeployment, TaskHost, TaskOutcome, TaskTermination};
pub use invokable::{Invokable, InvokeFuture, NoOpInvokable, TaskContext};
pub use registry::{WorkerId, WorkerInfo, WorkerRegistry};
