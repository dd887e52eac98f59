use std::{
    fmt,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{
    Stream, StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use log::{debug, error, info};
use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    task::{self, AbortHandle, JoinError},
};

use crate::{
    aggregator::AggregatorHandle,
    cluster::ClusterContext,
    dataset::{Partition, PartitionedDataset},
    error::{BackendError, Result},
    metrics::MetricsMapping,
    remote::{Model, RemoteModelHandle},
};

/// The partition-local side of inference, a fresh instance is built for every partition.
pub trait RemotePredictor<M: Model>: Sized + 'static {
    type Config: Clone + Send + Sync + 'static;
    type Row: Send + Sync + 'static;
    type Prediction: Send + 'static;

    fn new(config: &Self::Config) -> Result<Self>;

    /// Predicts every row of a partition.
    fn batch_predict(&mut self, model: &M, rows: &[Self::Row]) -> Result<Vec<Self::Prediction>>;

    /// Predicts every row of a partition and computes the partition's metrics.
    fn batch_evaluation(
        &mut self,
        model: &M,
        rows: &[Self::Row],
    ) -> Result<(MetricsMapping, Vec<Self::Prediction>)>;
}

/// The predictions of a dataset, one item per partition in partition order.
///
/// Nothing is computed until the stream is polled.
pub struct PredictionStream<P> {
    inner: BoxStream<'static, Result<Vec<P>>>,
    partitions: usize,
}

impl<P: Send + 'static> PredictionStream<P> {
    /// A stream over predictions that were already computed.
    pub fn ready(partitions: Vec<Vec<P>>) -> Self {
        Self {
            partitions: partitions.len(),
            inner: stream::iter(partitions.into_iter().map(Ok)).boxed(),
        }
    }

    /// Forces evaluation of every partition.
    ///
    /// # Returns
    /// Every prediction in row order, or the first partition failure.
    pub async fn try_collect_rows(self) -> Result<Vec<P>> {
        let partitions: Vec<Vec<P>> = self.try_collect().await?;
        Ok(partitions.into_iter().flatten().collect())
    }
}

impl<P> PredictionStream<P> {
    pub fn num_partitions(&self) -> usize {
        self.partitions
    }
}

impl<P> Stream for PredictionStream<P> {
    type Item = Result<Vec<P>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<P> fmt::Debug for PredictionStream<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredictionStream")
            .field("partitions", &self.partitions)
            .finish()
    }
}

/// Runs prediction and evaluation over a partitioned dataset, one task per partition.
pub struct InferenceCoordinator<M: Model, P: RemotePredictor<M>> {
    context: Arc<ClusterContext>,
    config: P::Config,
    parallelism: usize,
    aggregators: Mutex<Vec<AggregatorHandle>>,
    _model: PhantomData<fn() -> M>,
}

impl<M, P> InferenceCoordinator<M, P>
where
    M: Model + Send + Sync,
    P: RemotePredictor<M>,
{
    /// Creates a new `InferenceCoordinator`, running as many partitions at once as the
    /// cluster has CPUs.
    ///
    /// # Args
    /// * `context` - The cluster connection.
    /// * `config` - The configuration every partition's predictor is built from.
    pub fn new(context: Arc<ClusterContext>, config: P::Config) -> Self {
        let parallelism = context.partition_parallelism();

        Self {
            context,
            config,
            parallelism,
            aggregators: Mutex::new(Vec::new()),
            _model: PhantomData,
        }
    }

    /// Overrides how many partitions may run at once, at least one.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Predicts every row of `dataset`.
    ///
    /// The model is captured once here, partition tasks are only scheduled as the returned
    /// stream is polled.
    ///
    /// # Errors
    /// `Serialization` if the model can't be captured. Partition failures surface through
    /// the stream.
    pub fn batch_predict(
        &self,
        model: &M,
        dataset: &PartitionedDataset<P::Row>,
    ) -> Result<PredictionStream<P::Prediction>> {
        let tasks = self.context.tasks()?.clone();
        let handle = Arc::new(RemoteModelHandle::capture(model, self.context.store())?);
        let config = self.config.clone();

        info!(
            partitions = dataset.num_partitions();
            "scheduling batch_predict of {}", handle.type_name()
        );

        let inner = stream::iter(dataset.partitions().to_vec())
            .map(move |partition| {
                let handle = Arc::clone(&handle);
                let config = config.clone();
                let index = partition.index();

                let task = tasks.spawn_blocking(move || {
                    let model = handle.load()?;
                    P::new(&config)?.batch_predict(&model, partition.rows())
                });

                async move { joined(index, task.await) }
            })
            .buffered(self.parallelism)
            .boxed();

        Ok(PredictionStream {
            inner,
            partitions: dataset.num_partitions(),
        })
    }

    /// Predicts every row of `dataset` and merges every partition's metrics.
    ///
    /// Every partition runs to completion before the metrics are collected, so the merged
    /// metrics always account for the whole dataset.
    ///
    /// # Returns
    /// The merged metrics and a stream over the already computed predictions.
    ///
    /// # Errors
    /// The failure of the first failing partition in partition order.
    pub async fn batch_evaluation(
        &self,
        model: &M,
        dataset: &PartitionedDataset<P::Row>,
    ) -> Result<(MetricsMapping, PredictionStream<P::Prediction>)> {
        let tasks = self.context.tasks()?.clone();
        let handle = Arc::new(RemoteModelHandle::capture(model, self.context.store())?);
        let aggregator = self.track(AggregatorHandle::spawn(self.context.actors()));

        info!(
            partitions = dataset.num_partitions();
            "scheduling batch_evaluation of {}", handle.type_name()
        );

        let jobs = dataset.partitions().iter().map(|partition| {
            let job = evaluate_partition::<M, P>(
                Arc::clone(&handle),
                self.config.clone(),
                aggregator.clone(),
                partition.clone(),
            );
            (partition.index(), job)
        });
        let partitions = run_partitions(&tasks, jobs, self.parallelism).await;

        let outcome = match partitions {
            Ok(predictions) => aggregator
                .collect()
                .await
                .map(|metrics| (metrics, PredictionStream::ready(predictions))),
            Err(e) => Err(e),
        };

        aggregator.stop();
        outcome.inspect_err(|e| error!("batch_evaluation failed: {e}"))
    }

    /// Intermediate layer activations can't be collected by this backend.
    ///
    /// # Errors
    /// Always `UnsupportedOperation`.
    pub fn batch_collect_activations(
        &self,
        _model: &M,
        _dataset: &PartitionedDataset<P::Row>,
        _layer_names: &[&str],
    ) -> Result<PredictionStream<Vec<f32>>> {
        Err(BackendError::UnsupportedOperation(
            "batch_collect_activations".into(),
        ))
    }

    /// Stops every aggregator this coordinator created, calling it more than once is a no-op.
    pub fn shutdown(&self) {
        let aggregators = std::mem::take(&mut *self.aggregators.lock());
        debug!("stopping {} aggregator(s)", aggregators.len());

        for aggregator in aggregators {
            aggregator.stop();
        }
    }

    /// Aggregators this coordinator created that are still running.
    pub fn live_aggregators(&self) -> usize {
        self.aggregators
            .lock()
            .iter()
            .filter(|aggregator| aggregator.is_alive())
            .count()
    }

    fn track(&self, aggregator: AggregatorHandle) -> AggregatorHandle {
        let mut aggregators = self.aggregators.lock();
        aggregators.retain(AggregatorHandle::is_alive);
        aggregators.push(aggregator.clone());
        aggregator
    }
}

/// Spawns every job on `tasks`, at most `parallelism` at once, and collects their outputs
/// in job order.
///
/// # Errors
/// The first failure in job order. Every job still running at that point is aborted.
async fn run_partitions<T, F>(
    tasks: &Handle,
    jobs: impl IntoIterator<Item = (usize, F)>,
    parallelism: usize,
) -> Result<Vec<T>>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut spawned: Vec<AbortHandle> = Vec::new();

    let outcome = stream::iter(jobs)
        .map(|(index, job)| {
            let task = tasks.spawn(job);
            spawned.push(task.abort_handle());
            async move { joined(index, task.await) }
        })
        .buffered(parallelism)
        .try_collect::<Vec<_>>()
        .await;

    if outcome.is_err() {
        let running = spawned.iter().filter(|task| !task.is_finished()).count();
        debug!("aborting {running} outstanding partition(s)");
        spawned.iter().for_each(AbortHandle::abort);
    }

    outcome
}

/// The task evaluating one partition: compute, then hand the metrics to the aggregator.
async fn evaluate_partition<M, P>(
    handle: Arc<RemoteModelHandle<M>>,
    config: P::Config,
    aggregator: AggregatorHandle,
    partition: Partition<P::Row>,
) -> Result<Vec<P::Prediction>>
where
    M: Model,
    P: RemotePredictor<M>,
{
    let index = partition.index();

    let (metrics, predictions) = joined(
        index,
        task::spawn_blocking(move || {
            let model = handle.load()?;
            P::new(&config)?.batch_evaluation(&model, partition.rows())
        })
        .await,
    )?;

    aggregator.add(metrics).await?;
    debug!(partition = index; "partition evaluated");
    Ok(predictions)
}

/// Flattens a partition task's outcome, attributing failures to the partition.
fn joined<T>(index: usize, outcome: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    match outcome {
        Ok(result) => result.map_err(|e| BackendError::on_worker(index, e)),
        Err(e) => Err(BackendError::WorkerExecution {
            rank: index,
            msg: e.to_string(),
        }),
    }
}
