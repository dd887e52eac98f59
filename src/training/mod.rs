use std::{
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    cluster::ClusterContext,
    config::WorkerGroupConfig,
    error::{BackendError, Result},
    remote::{Model, RemoteModelHandle},
    worker::{Executable, WorkerGroup},
};

/// The worker-local side of training, one instance lives on every worker of the group.
pub trait RemoteTrainer<M: Model>: Executable {
    /// Everything a train step needs besides the model, shipped to every worker.
    type Input: Clone + Send + Sync + 'static;

    /// Auxiliary per-epoch statistics returned by `train`.
    type Stats: Send + 'static;

    /// Trains `model` to completion.
    ///
    /// # Returns
    /// The trained model and the statistics collected along the way.
    fn train(&mut self, model: M, input: &Self::Input) -> Result<(M, Vec<Self::Stats>)>;

    /// Runs a single incremental training step.
    fn train_online(&mut self, model: M, input: &Self::Input) -> Result<M>;

    /// The output field validation is computed on, known after training.
    fn validation_field(&self) -> Option<String>;

    /// The metric validation is computed with, known after training.
    fn validation_metric(&self) -> Option<String>;
}

/// What a single worker hands back after a train dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainResult<S> {
    pub weights: Vec<f32>,
    pub stats: S,
}

/// Where a `TrainingCoordinator` is within a train call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Dispatching,
    Reconciling,
}

/// Moves the coordinator state forward and brings it back to `Idle` however the call ends.
///
/// Only one guard may exist at a time, the coordinator hands them out under its dispatch
/// lock.
struct StateGuard<'a> {
    state: &'a Mutex<CoordinatorState>,
    finished: bool,
}

impl<'a> StateGuard<'a> {
    fn enter(state: &'a Mutex<CoordinatorState>) -> Self {
        *state.lock() = CoordinatorState::Dispatching;

        Self {
            state,
            finished: false,
        }
    }

    fn advance(&self, next: CoordinatorState) {
        *self.state.lock() = next;
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if !self.finished && *state == CoordinatorState::Dispatching {
            warn!("train dispatch abandoned");
        }
        *state = CoordinatorState::Idle;
    }
}

/// Ships a model to every worker of a group, trains it there and brings the canonical
/// weights back into the caller's model.
///
/// The first worker's weights are canonical, every other worker is assumed to hold the same
/// weights once training finished. With `check_replica_consistency` enabled that
/// assumption is verified instead.
///
/// Train calls made concurrently run one after the other, in the order they got hold of
/// the coordinator.
pub struct TrainingCoordinator<M: Model, T: RemoteTrainer<M>> {
    context: Arc<ClusterContext>,
    group: WorkerGroup<T>,
    dispatching: AsyncMutex<()>,
    state: Mutex<CoordinatorState>,
    trained: AtomicBool,
    check_replica_consistency: bool,
    _model: PhantomData<fn() -> M>,
}

impl<M, T> TrainingCoordinator<M, T>
where
    M: Model + Send + Sync,
    T: RemoteTrainer<M>,
{
    /// Starts the worker group every train call is dispatched to.
    ///
    /// # Args
    /// * `context` - The cluster connection.
    /// * `config` - The group's shape.
    /// * `trainer_config` - The configuration every trainer is started with.
    /// * `check_replica_consistency` - Whether to compare every worker's weights.
    ///
    /// # Errors
    /// Any `WorkerGroup::start` failure.
    pub async fn start(
        context: Arc<ClusterContext>,
        config: WorkerGroupConfig,
        trainer_config: T::Config,
        check_replica_consistency: bool,
    ) -> Result<Self> {
        let group = WorkerGroup::start(context.tasks()?, config, trainer_config).await?;

        Ok(Self {
            context,
            group,
            dispatching: AsyncMutex::new(()),
            state: Mutex::new(CoordinatorState::Idle),
            trained: AtomicBool::new(false),
            check_replica_consistency,
            _model: PhantomData,
        })
    }

    /// Trains `model` on every worker.
    ///
    /// # Args
    /// * `model` - The model to train, its weights are only replaced once every worker
    ///   succeeded.
    /// * `input` - The training input shipped to every worker.
    ///
    /// # Returns
    /// The first worker's statistics.
    ///
    /// # Errors
    /// The first worker failure, in which case `model` is left untouched.
    pub async fn train(&self, model: &mut M, input: &T::Input) -> Result<Vec<T::Stats>> {
        self.dispatch(model, input, "train", |trainer, model, input| {
            trainer.train(model, input)
        })
        .await
    }

    /// Runs a single incremental training step on every worker, updating `model` in place.
    pub async fn train_online(&self, model: &mut M, input: &T::Input) -> Result<()> {
        self.dispatch(model, input, "train_online", |trainer, model, input| {
            trainer.train_online(model, input).map(|model| (model, ()))
        })
        .await
    }

    /// The output field validation is computed on.
    ///
    /// # Errors
    /// `NotYetTrained` before the first successful train call or if the trainer has none.
    pub async fn validation_field(&self) -> Result<String> {
        self.query("validation field", |trainer| Ok(trainer.validation_field()))
            .await
    }

    /// The metric validation is computed with.
    ///
    /// # Errors
    /// `NotYetTrained` before the first successful train call or if the trainer has none.
    pub async fn validation_metric(&self) -> Result<String> {
        self.query("validation metric", |trainer| Ok(trainer.validation_metric()))
            .await
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock()
    }

    /// Whether a train call already completed.
    pub fn is_trained(&self) -> bool {
        self.trained.load(Ordering::Acquire)
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    /// Stops every worker, calling it more than once is a no-op.
    pub async fn shutdown(&mut self) {
        self.group.shutdown().await;
    }

    async fn dispatch<S, F>(
        &self,
        model: &mut M,
        input: &T::Input,
        op: &'static str,
        step: F,
    ) -> Result<S>
    where
        F: Fn(&mut T, M, &T::Input) -> Result<(M, S)> + Send + Sync + 'static,
        S: Send + 'static,
    {
        let _dispatching = self.dispatching.lock().await;
        let guard = StateGuard::enter(&self.state);

        let handle = Arc::new(RemoteModelHandle::capture(model, self.context.store())?);
        let input = input.clone();

        info!(
            workers = self.group.world_size();
            "dispatching {op} of {}", handle.type_name()
        );

        let results = self
            .group
            .execute(move |trainer| {
                let model = handle.load()?;
                let (model, stats) = step(trainer, model, &input)?;
                Ok(TrainResult {
                    weights: model.weights(),
                    stats,
                })
            })
            .await
            .inspect_err(|e| error!("{op} failed: {e}"))?;

        guard.advance(CoordinatorState::Reconciling);
        let canonical = canonical_result(results, self.check_replica_consistency)?;
        model.set_weights(&canonical.weights)?;

        self.trained.store(true, Ordering::Release);
        guard.finish();

        debug!("{op} reconciled");
        Ok(canonical.stats)
    }

    async fn query<F>(&self, what: &'static str, f: F) -> Result<String>
    where
        F: Fn(&mut T) -> Result<Option<String>> + Send + Sync + 'static,
    {
        if !self.is_trained() {
            return Err(BackendError::NotYetTrained(what));
        }

        self.group
            .execute_single(f)
            .await?
            .ok_or(BackendError::NotYetTrained(what))
    }
}

/// Picks the first worker's result, optionally checking every other worker agrees with it.
///
/// # Errors
/// `ReplicaDivergence` naming the first worker whose weights differ bit for bit.
fn canonical_result<S>(results: Vec<TrainResult<S>>, check: bool) -> Result<TrainResult<S>> {
    let mut results = results.into_iter().enumerate();
    let (_, canonical) = results.next().ok_or(BackendError::WorkerGroupStopped)?;

    if check {
        for (rank, replica) in results {
            if !same_weights(&canonical.weights, &replica.weights) {
                return Err(BackendError::ReplicaDivergence { rank });
            }
        }
    }

    Ok(canonical)
}

fn same_weights(a: &[f32], b: &[f32]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.to_bits() == b.to_bits())
}
