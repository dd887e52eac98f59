use std::sync::Arc;

use log::{debug, info};

use crate::{
    cluster::{ClusterContext, ClusterRuntime},
    config::{BackendConfig, WorkerGroupConfig},
    error::{BackendError, Result},
    inference::{InferenceCoordinator, RemotePredictor},
    remote::Model,
    training::{RemoteTrainer, TrainingCoordinator},
};

/// The entry point callers distribute training and inference through.
///
/// ```ignore
/// let mut backend = Backend::new(LocalCluster::detect(), BackendConfig::default())?;
/// backend.initialize()?;
///
/// let trainer = backend.create_trainer::<Linear, LinearTrainer>(trainer_config).await?;
/// let stats = trainer.train(&mut model, &input).await?;
///
/// backend.shutdown();
/// ```
pub struct Backend<C: ClusterRuntime> {
    cluster: C,
    config: BackendConfig,
    context: Option<Arc<ClusterContext>>,
}

impl<C: ClusterRuntime> Backend<C> {
    /// Creates a new `Backend`, it doesn't connect until `initialize` is called.
    ///
    /// # Errors
    /// `InvalidConfig` if `config` doesn't validate.
    pub fn new(cluster: C, config: BackendConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            cluster,
            config,
            context: None,
        })
    }

    /// Connects to the cluster, calling it again once connected is a no-op.
    pub fn initialize(&mut self) -> Result<()> {
        if self.context.is_some() {
            debug!("backend already initialized");
            return Ok(());
        }

        let context = ClusterContext::connect(&self.cluster)?;
        self.context = Some(Arc::new(context));
        info!("backend initialized");
        Ok(())
    }

    /// Starts a worker group sized after the cluster's largest homogeneous resource bucket
    /// and returns a coordinator driving it.
    ///
    /// # Args
    /// * `trainer_config` - The configuration every worker's trainer starts with.
    ///
    /// # Errors
    /// `ResourceDiscovery` if the backend isn't initialized or the cluster is empty, plus
    /// any `WorkerGroup::start` failure.
    pub async fn create_trainer<M, T>(
        &self,
        trainer_config: T::Config,
    ) -> Result<TrainingCoordinator<M, T>>
    where
        M: Model + Send + Sync,
        T: RemoteTrainer<M>,
    {
        let context = Arc::clone(self.context()?);
        let bucket = context.bucketer().select()?;
        let config = WorkerGroupConfig::resolve(&bucket, &self.config)?;

        info!(
            kind = bucket.kind.as_str(), slots = config.num_slots, hosts = config.num_hosts;
            "creating trainer"
        );

        TrainingCoordinator::start(
            context,
            config,
            trainer_config,
            self.config.check_replica_consistency,
        )
        .await
    }

    /// Returns a coordinator running inference over the cluster.
    ///
    /// # Args
    /// * `predictor_config` - The configuration every partition's predictor is built from.
    pub fn create_predictor<M, P>(
        &self,
        predictor_config: P::Config,
    ) -> Result<InferenceCoordinator<M, P>>
    where
        M: Model + Send + Sync,
        P: RemotePredictor<M>,
    {
        let context = Arc::clone(self.context()?);
        Ok(InferenceCoordinator::new(context, predictor_config))
    }

    /// Releases every worker, task and actor scheduled through this backend.
    /// Safe to call after a failure and more than once.
    pub fn shutdown(&mut self) {
        if let Some(context) = self.context.take() {
            context.shutdown();
            info!("backend shut down");
        }
    }

    /// The cluster connection.
    ///
    /// # Errors
    /// `ResourceDiscovery` before `initialize` or after `shutdown`.
    pub fn context(&self) -> Result<&Arc<ClusterContext>> {
        self.context
            .as_ref()
            .ok_or_else(|| BackendError::ResourceDiscovery("backend is not initialized".into()))
    }

    pub fn is_initialized(&self) -> bool {
        self.context.is_some()
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Datasets are processed by partition tasks that share nothing with the caller's
    /// process pool.
    pub fn supports_multiprocessing(&self) -> bool {
        false
    }

    /// Every feature must be loaded in memory before it's distributed.
    ///
    /// # Errors
    /// Always `UnsupportedOperation` naming `feature`.
    pub fn check_lazy_load_supported(&self, feature: &str) -> Result<()> {
        Err(BackendError::UnsupportedOperation(format!(
            "{feature} is set to lazy load, but this backend requires data to be loaded in memory"
        )))
    }
}

impl<C: ClusterRuntime> Drop for Backend<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
