#![allow(dead_code)]

use std::{
    future, io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use orchestra_backend::{
    ClusterContext, Executable, LocalCluster, MetricsMapping, Model, NodeResourceReport,
    RemotePredictor, RemoteTrainer, WorkerContext, WorkerGroupConfig,
    error::{BackendError, Result},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A cluster of `nodes` CPU only nodes.
pub fn cpu_cluster(nodes: usize, cpus: usize) -> LocalCluster {
    (0..nodes).fold(LocalCluster::new(), |cluster, i| {
        cluster.with_node(NodeResourceReport::new(
            format!("node-{i}"),
            [("CPU", cpus as f64)],
        ))
    })
}

pub fn connect(cluster: &LocalCluster) -> Arc<ClusterContext> {
    Arc::new(ClusterContext::connect(cluster).unwrap())
}

pub fn group_config(num_slots: usize, num_hosts: usize) -> WorkerGroupConfig {
    WorkerGroupConfig {
        num_slots,
        num_hosts,
        use_gpu: false,
        coordination_timeout: Duration::from_secs(5),
    }
}

/// Polls `cond` until it holds or a second went by.
pub async fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

/* -------------------------------------------------------------------------- */
/*                                    Model                                   */
/* -------------------------------------------------------------------------- */

#[derive(Debug, Clone, PartialEq)]
pub struct Line {
    pub weights: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
pub struct LineState {
    weights: Vec<f32>,
}

impl Line {
    pub fn zeros(len: usize) -> Self {
        Self::from_args(len)
    }
}

impl Model for Line {
    type Args = usize;
    type State = LineState;

    fn reconstruction_args(&self) -> usize {
        self.weights.len()
    }

    fn from_args(len: usize) -> Self {
        Self {
            weights: vec![0.0; len],
        }
    }

    fn extract_state(&self) -> LineState {
        LineState {
            weights: self.weights.clone(),
        }
    }

    fn restore_state(&mut self, state: LineState) -> Result<()> {
        self.set_weights(&state.weights)
    }

    fn weights(&self) -> Vec<f32> {
        self.weights.clone()
    }

    fn set_weights(&mut self, weights: &[f32]) -> Result<()> {
        if weights.len() != self.weights.len() {
            return Err(BackendError::WeightsLengthMismatch {
                got: weights.len(),
                expected: self.weights.len(),
            });
        }

        self.weights.copy_from_slice(weights);
        Ok(())
    }
}

/* -------------------------------------------------------------------------- */
/*                                   Trainer                                  */
/* -------------------------------------------------------------------------- */

/// What each worker of a `ScriptedTrainer` group does, keyed by rank.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// This rank never finishes starting.
    pub hang_on_start: Option<usize>,
    /// This rank fails to start.
    pub fail_start_on: Option<usize>,
    /// This rank fails every train call.
    pub fail_on: Option<usize>,
    /// This rank panics on every train call.
    pub panic_on: Option<usize>,
    /// Every rank adds its own rank to the weights on top of the step.
    pub divergent: bool,
    /// How long every train call takes on top of its work.
    pub step_delay: Option<Duration>,
    /// Every step taken, as `(rank, step)` in the order workers ran them.
    pub journal: Arc<Mutex<Vec<(usize, f32)>>>,
    /// Amount of started executables not yet dropped.
    pub live: Arc<AtomicUsize>,
    /// Amount of started executables placed on a GPU slot.
    pub on_gpu: Arc<AtomicUsize>,
}

/// Adds `step` to every weight, reports its rank as the only stat.
pub struct ScriptedTrainer {
    pub ctx: WorkerContext,
    script: Script,
    trained: bool,
}

impl ScriptedTrainer {
    fn step(&mut self, mut model: Line, step: f32) -> Result<Line> {
        let rank = self.ctx.rank;

        if self.script.fail_on == Some(rank) {
            return Err(BackendError::Io(io::Error::other("device lost")));
        }
        if self.script.panic_on == Some(rank) {
            panic!("rank {rank} exploded");
        }

        if let Some(delay) = self.script.step_delay {
            std::thread::sleep(delay);
        }
        self.script.journal.lock().push((rank, step));

        let offset = if self.script.divergent { rank as f32 } else { 0.0 };
        model.weights.iter_mut().for_each(|w| *w += step + offset);

        self.trained = true;
        Ok(model)
    }
}

impl Executable for ScriptedTrainer {
    type Config = Script;

    async fn start(ctx: WorkerContext, script: Script) -> Result<Self> {
        if script.hang_on_start == Some(ctx.rank) {
            future::pending::<()>().await;
        }
        if script.fail_start_on == Some(ctx.rank) {
            return Err(BackendError::InvalidConfig("no such device".into()));
        }

        script.live.fetch_add(1, Ordering::SeqCst);
        if ctx.use_gpu {
            script.on_gpu.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Self {
            ctx,
            script,
            trained: false,
        })
    }
}

impl Drop for ScriptedTrainer {
    fn drop(&mut self) {
        self.script.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RemoteTrainer<Line> for ScriptedTrainer {
    type Input = f32;
    type Stats = f32;

    fn train(&mut self, model: Line, step: &f32) -> Result<(Line, Vec<f32>)> {
        let model = self.step(model, *step)?;
        Ok((model, vec![self.ctx.rank as f32]))
    }

    fn train_online(&mut self, model: Line, step: &f32) -> Result<Line> {
        self.step(model, *step)
    }

    fn validation_field(&self) -> Option<String> {
        self.trained.then(|| "label".to_string())
    }

    fn validation_metric(&self) -> Option<String> {
        self.trained.then(|| "loss".to_string())
    }
}

/* -------------------------------------------------------------------------- */
/*                                  Predictor                                 */
/* -------------------------------------------------------------------------- */

#[derive(Debug, Clone, Default)]
pub struct PredictorConfig {
    /// Amount of partitions processed so far.
    pub calls: Arc<AtomicUsize>,
}

/// Each row is a partition's loss contribution, predictions are `row + weights[0]`.
pub struct LossPredictor {
    config: PredictorConfig,
}

impl RemotePredictor<Line> for LossPredictor {
    type Config = PredictorConfig;
    type Row = f64;
    type Prediction = f64;

    fn new(config: &PredictorConfig) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
        })
    }

    fn batch_predict(&mut self, model: &Line, rows: &[f64]) -> Result<Vec<f64>> {
        self.config.calls.fetch_add(1, Ordering::SeqCst);

        if rows.iter().any(|row| row.is_sign_negative()) {
            return Err(BackendError::Io(io::Error::other("negative loss")));
        }

        Ok(rows.iter().map(|row| row + model.weights[0] as f64).collect())
    }

    fn batch_evaluation(
        &mut self,
        model: &Line,
        rows: &[f64],
    ) -> Result<(MetricsMapping, Vec<f64>)> {
        let predictions = self.batch_predict(model, rows)?;
        let metrics = MetricsMapping::from_iter([("loss", rows.iter().sum::<f64>())]);
        Ok((metrics, predictions))
    }
}
