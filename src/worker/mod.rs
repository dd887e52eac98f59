mod group;

use std::future::Future;

pub use group::WorkerGroup;

use crate::error::Result;

/// Where a worker sits inside its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerContext {
    /// Position of the worker in start order, `0` is the canonical worker.
    pub rank: usize,
    /// Total amount of workers in the group.
    pub world_size: usize,
    /// Host the worker was placed on.
    pub host: usize,
    /// Slot of the worker within its host.
    pub local_rank: usize,
    /// Whether the worker owns a GPU slot.
    pub use_gpu: bool,
}

/// The user supplied role every worker of a `WorkerGroup` executes.
///
/// One instance lives on each worker for the whole lifetime of the group, closures
/// dispatched to the group run against it.
pub trait Executable: Send + Sized + 'static {
    /// The configuration every worker is initialized with.
    type Config: Clone + Send + Sync + 'static;

    /// Initializes the worker, the group regards the worker as ready once it resolves.
    ///
    /// # Args
    /// * `ctx` - The worker's placement.
    /// * `config` - The shared executable configuration.
    fn start(ctx: WorkerContext, config: Self::Config) -> impl Future<Output = Result<Self>> + Send;

    /// Releases whatever the worker holds, called on graceful shutdown.
    fn stop(&mut self) {}
}
