pub mod aggregator;
pub mod backend;
pub mod cluster;
pub mod config;
pub mod dataset;
pub mod error;
pub mod inference;
pub mod metrics;
pub mod remote;
pub mod training;
pub mod worker;

pub use backend::Backend;
pub use cluster::{ClusterContext, ClusterRuntime, LocalCluster, NodeResourceReport};
pub use config::{BackendConfig, WorkerGroupConfig};
pub use dataset::PartitionedDataset;
pub use error::{BackendError, Result};
pub use inference::{InferenceCoordinator, PredictionStream, RemotePredictor};
pub use metrics::{MetricValue, MetricsMapping};
pub use remote::{Model, RemoteModelHandle};
pub use training::{RemoteTrainer, TrainingCoordinator};
pub use worker::{Executable, WorkerContext, WorkerGroup};
