mod actors;
mod resources;
mod store;

use std::{sync::Arc, thread};

use log::{info, warn};
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};

pub use actors::ActorHost;
pub use resources::{NodeResourceReport, ResourceBucket, ResourceBucketer, ResourceKind};
pub use store::{InMemoryStore, ObjectRef, ObjectStore};

use crate::error::{BackendError, Result};

/// The capabilities the backend consumes from the cluster it runs on.
pub trait ClusterRuntime: Send + Sync {
    /// Snapshot of the resources every node currently advertises.
    fn node_reports(&self) -> Result<Vec<NodeResourceReport>>;

    /// The cluster's shared object storage.
    fn object_store(&self) -> Arc<dyn ObjectStore>;
}

/// A cluster that lives inside the current process.
#[derive(Clone)]
pub struct LocalCluster {
    nodes: Vec<NodeResourceReport>,
    store: Arc<InMemoryStore>,
}

impl Default for LocalCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCluster {
    /// Creates a new `LocalCluster` without nodes and with unbounded storage.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            store: Arc::new(InMemoryStore::new()),
        }
    }

    /// Creates a single node cluster sized after the machine's available parallelism.
    pub fn detect() -> Self {
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        Self::new().with_node(NodeResourceReport::new("local", [("CPU", cpus as f64)]))
    }

    /// Adds a node to the cluster.
    pub fn with_node(mut self, report: NodeResourceReport) -> Self {
        self.nodes.push(report);
        self
    }

    /// Replaces the cluster's shared storage.
    pub fn with_store(mut self, store: Arc<InMemoryStore>) -> Self {
        self.store = store;
        self
    }

    /// The concrete storage, handy to inspect its counters.
    pub fn store(&self) -> Arc<InMemoryStore> {
        Arc::clone(&self.store)
    }
}

impl ClusterRuntime for LocalCluster {
    fn node_reports(&self) -> Result<Vec<NodeResourceReport>> {
        Ok(self.nodes.clone())
    }

    fn object_store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }
}

/// The connection to the cluster shared by every coordinator of a backend.
///
/// It's created once by `Backend::initialize` and torn down by `Backend::shutdown`, it owns
/// the task runtime where workers and partition tasks are scheduled and the actor host
/// where stateful actors live.
pub struct ClusterContext {
    nodes: Vec<NodeResourceReport>,
    store: Arc<dyn ObjectStore>,
    actors: ActorHost,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
}

impl ClusterContext {
    /// Connects to the cluster.
    ///
    /// # Args
    /// * `cluster` - The cluster runtime to take resources and storage from.
    ///
    /// # Returns
    /// A new `ClusterContext` or an error if the cluster couldn't be reached.
    pub fn connect(cluster: &dyn ClusterRuntime) -> Result<Self> {
        let nodes = cluster.node_reports()?;
        let store = cluster.object_store();

        let runtime = Builder::new_multi_thread()
            .thread_name("cluster-task")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let actors = ActorHost::start()?;

        info!("connected to cluster with {} node(s)", nodes.len());
        Ok(Self {
            nodes,
            store,
            actors,
            runtime: Mutex::new(Some(runtime)),
            handle,
        })
    }

    /// The node reports taken when the context was created.
    pub fn nodes(&self) -> &[NodeResourceReport] {
        &self.nodes
    }

    /// A bucketer over this cluster's node reports.
    pub fn bucketer(&self) -> ResourceBucketer {
        ResourceBucketer::new(self.nodes.clone())
    }

    /// The cluster's shared object storage.
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    /// The actor host of this context.
    pub fn actors(&self) -> &ActorHost {
        &self.actors
    }

    /// The handle of the runtime where remote work gets scheduled.
    ///
    /// # Returns
    /// The handle, or `ResourceDiscovery` if the context was already shut down.
    pub fn tasks(&self) -> Result<&Handle> {
        if !self.is_active() {
            return Err(BackendError::ResourceDiscovery(
                "the cluster context was shut down".into(),
            ));
        }

        Ok(&self.handle)
    }

    /// How many partition tasks can run at the same time, the cluster's total CPU count.
    pub fn partition_parallelism(&self) -> usize {
        self.bucketer().cluster_total(ResourceKind::Cpu).max(1)
    }

    /// Whether `shutdown` wasn't called yet.
    pub fn is_active(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Stops every actor and every task scheduled on this context.
    /// Calling it more than once is a no-op.
    pub fn shutdown(&self) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        self.actors.stop();
        runtime.shutdown_background();
        info!("cluster context shut down");
    }
}

impl Drop for ClusterContext {
    fn drop(&mut self) {
        if self.is_active() {
            warn!("cluster context dropped without shutdown");
            self.shutdown();
        }
    }
}
