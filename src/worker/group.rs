use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::{join_all, try_join_all};
use log::{debug, error, info, warn};
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
    task::{self, JoinHandle},
    time,
};
use tokio_util::sync::CancellationToken;

use super::{Executable, WorkerContext};
use crate::{
    config::WorkerGroupConfig,
    error::{BackendError, Result},
};

/// How long a worker gets to finish its current job once shutdown was requested.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

type Job<E> = Box<dyn FnOnce(&mut E) + Send>;

struct WorkerSlot<E> {
    ctx: WorkerContext,
    inbox: mpsc::UnboundedSender<Job<E>>,
    task: JoinHandle<()>,
}

/// A managed set of long-lived workers, all executing the same `Executable`.
///
/// Workers are numbered by rank in start order, every per-worker result sequence
/// follows that order.
pub struct WorkerGroup<E: Executable> {
    config: WorkerGroupConfig,
    workers: Vec<WorkerSlot<E>>,
    cancel: CancellationToken,
}

impl<E: Executable> WorkerGroup<E> {
    /// Launches `num_slots * num_hosts` workers and waits for all of them to be ready.
    ///
    /// # Args
    /// * `tasks` - The runtime where the workers get scheduled.
    /// * `config` - The group's shape and coordination timeout.
    /// * `exe_config` - The configuration every executable is initialized with.
    ///
    /// # Returns
    /// The started group.
    ///
    /// # Errors
    /// `WorkerGroupStartTimeout` if the workers weren't ready in time, or the first worker
    /// start failure. In both cases every already started worker is torn down first.
    pub async fn start(
        tasks: &Handle,
        config: WorkerGroupConfig,
        exe_config: E::Config,
    ) -> Result<Self> {
        config.validate()?;

        let world_size = config.world_size();
        let cancel = CancellationToken::new();
        let ready_count = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(world_size);
        let mut ready = Vec::with_capacity(world_size);

        for rank in 0..world_size {
            let ctx = WorkerContext {
                rank,
                world_size,
                host: rank / config.num_slots,
                local_rank: rank % config.num_slots,
                use_gpu: config.use_gpu,
            };

            let (inbox, jobs) = mpsc::unbounded_channel();
            let (ready_tx, ready_rx) = oneshot::channel();

            let task = tasks.spawn(run_worker::<E>(
                ctx,
                exe_config.clone(),
                ready_tx,
                Arc::clone(&ready_count),
                jobs,
                cancel.child_token(),
            ));

            workers.push(WorkerSlot { ctx, inbox, task });
            ready.push(async move {
                match ready_rx.await {
                    Ok(report) => report.map_err(|e| BackendError::on_worker(rank, e)),
                    Err(_) => Err(BackendError::WorkerExecution {
                        rank,
                        msg: "worker exited before reporting ready".into(),
                    }),
                }
            });
        }

        let mut group = Self {
            config,
            workers,
            cancel,
        };

        let timeout = group.config.coordination_timeout;
        info!(
            "starting {world_size} worker(s) on {} host(s), timeout {}s",
            group.config.num_hosts,
            timeout.as_secs_f64()
        );

        let failure = match time::timeout(timeout, try_join_all(ready)).await {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(BackendError::WorkerGroupStartTimeout {
                timeout,
                ready: ready_count.load(Ordering::Acquire),
                expected: world_size,
            }),
        };

        if let Some(e) = failure {
            error!("worker group failed to start: {e}");
            group.shutdown().await;
            return Err(e);
        }

        info!("all {world_size} worker(s) ready");
        Ok(group)
    }

    /// Runs `f` once on every worker in parallel.
    ///
    /// # Args
    /// * `f` - The closure to run against each worker's executable.
    ///
    /// # Returns
    /// The per-worker results ordered by rank.
    ///
    /// # Errors
    /// The failure of the lowest ranked failing worker, reported only once every other
    /// worker finished its run. `WorkerGroupStopped` after `shutdown`.
    pub async fn execute<T, F>(&self, f: F) -> Result<Vec<T>>
    where
        F: Fn(&mut E) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        if self.workers.is_empty() {
            return Err(BackendError::WorkerGroupStopped);
        }

        let f = Arc::new(f);
        let replies: Vec<_> = self
            .workers
            .iter()
            .map(|worker| reply(worker.ctx.rank, Self::dispatch(worker, Arc::clone(&f))))
            .collect();

        let mut results = Vec::with_capacity(replies.len());
        let mut failure = None;

        for (rank, reply) in join_all(replies).await.into_iter().enumerate() {
            match reply {
                Ok(value) => results.push(value),
                Err(e) => {
                    warn!(rank = rank; "worker failed: {e}");
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Runs `f` on the first worker only, meant for queries whose answer is the same on
    /// every worker.
    ///
    /// # Args
    /// * `f` - The closure to run against the first worker's executable.
    ///
    /// # Returns
    /// The first worker's result.
    pub async fn execute_single<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&mut E) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let worker = self.workers.first().ok_or(BackendError::WorkerGroupStopped)?;
        reply(worker.ctx.rank, Self::dispatch(worker, Arc::new(f))).await
    }

    /// Stops every worker, waiting a grace period for in-flight jobs before aborting them.
    /// Calling it more than once is a no-op.
    pub async fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        info!("shutting down {} worker(s)", self.workers.len());
        self.cancel.cancel();

        let workers = std::mem::take(&mut self.workers);
        join_all(workers.into_iter().map(stop_worker)).await;
    }

    /// Whether the group still has running workers.
    pub fn is_active(&self) -> bool {
        !self.workers.is_empty()
    }

    /// The amount of running workers.
    pub fn world_size(&self) -> usize {
        self.workers.len()
    }

    /// The shape this group was started with.
    pub fn config(&self) -> &WorkerGroupConfig {
        &self.config
    }

    /// Sends `f` to a worker's queue.
    ///
    /// # Returns
    /// The receiving end of the worker's reply.
    fn dispatch<T, F>(worker: &WorkerSlot<E>, f: Arc<F>) -> oneshot::Receiver<Result<T>>
    where
        F: Fn(&mut E) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let rank = worker.ctx.rank;
        let (tx, rx) = oneshot::channel();

        let job: Job<E> = Box::new(move |executable| {
            let result = panic::catch_unwind(AssertUnwindSafe(|| f(executable)))
                .unwrap_or_else(|payload| {
                    Err(BackendError::WorkerExecution {
                        rank,
                        msg: panic_message(payload),
                    })
                });

            let _ = tx.send(result);
        });

        // A closed inbox drops the job along with its reply sender, surfaced by `reply`.
        let _ = worker.inbox.send(job);
        rx
    }
}

/// Waits for a worker's reply to a dispatched job.
async fn reply<T>(rank: usize, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    match rx.await {
        Ok(result) => result.map_err(|e| BackendError::on_worker(rank, e)),
        Err(_) => Err(BackendError::WorkerExecution {
            rank,
            msg: "worker exited before replying".into(),
        }),
    }
}

impl<E: Executable> Drop for WorkerGroup<E> {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        warn!("worker group dropped without shutdown, aborting workers");
        self.cancel.cancel();
        for worker in &self.workers {
            worker.task.abort();
        }
    }
}

/// The lifetime of a single worker: start the executable, report readiness, then serve
/// jobs until cancelled or until the group drops its queue.
async fn run_worker<E: Executable>(
    ctx: WorkerContext,
    config: E::Config,
    ready: oneshot::Sender<Result<()>>,
    ready_count: Arc<AtomicUsize>,
    mut jobs: mpsc::UnboundedReceiver<Job<E>>,
    cancel: CancellationToken,
) {
    let started = tokio::select! {
        _ = cancel.cancelled() => return,
        started = E::start(ctx, config) => started,
    };

    let mut executable = match started {
        Ok(executable) => executable,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    ready_count.fetch_add(1, Ordering::AcqRel);
    if ready.send(Ok(())).is_err() {
        executable.stop();
        return;
    }

    debug!(rank = ctx.rank, host = ctx.host; "worker ready");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => task::block_in_place(|| job(&mut executable)),
                None => break,
            },
        }
    }

    executable.stop();
    debug!(rank = ctx.rank; "worker stopped");
}

async fn stop_worker<E>(worker: WorkerSlot<E>) {
    let WorkerSlot { ctx, inbox, mut task } = worker;
    drop(inbox);

    if time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
        warn!(rank = ctx.rank; "worker didn't stop in time, aborting");
        task.abort();
        let _ = task.await;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".into()
    }
}
