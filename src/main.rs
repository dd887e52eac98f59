use std::{env, sync::Arc};

use anyhow::Context;
use log::info;
use orchestra_backend::{
    Backend, BackendConfig, Executable, LocalCluster, MetricsMapping, Model, PartitionedDataset,
    RemotePredictor, RemoteTrainer, WorkerContext,
    error::{BackendError, Result},
};
use serde::{Deserialize, Serialize};

/// Fits `y = 2x - 1` with a single feature linear model.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match env::var("BACKEND_CONFIG") {
        Ok(path) => BackendConfig::from_path(&path).with_context(|| format!("loading {path}"))?,
        Err(_) => BackendConfig::default(),
    };

    let samples: Vec<Sample> = (0..64)
        .map(|i| {
            let x = i as f32 / 16.0;
            (vec![x], 2.0 * x - 1.0)
        })
        .collect();

    let mut backend = Backend::new(LocalCluster::detect(), config)?;
    backend.initialize()?;

    let mut model = Linear::from_args(1);
    let mut trainer = backend
        .create_trainer::<Linear, Sgd>(SgdConfig {
            learning_rate: 0.1,
            epochs: 200,
        })
        .await?;

    let losses = trainer.train(&mut model, &Arc::new(samples.clone())).await?;
    info!(
        "trained on {} worker(s), final loss {:?}, weights {:?}",
        trainer.world_size(),
        losses.last(),
        model.weights
    );
    info!(
        "validating {} with {}",
        trainer.validation_field().await?,
        trainer.validation_metric().await?
    );
    trainer.shutdown().await;

    let predictor = backend.create_predictor::<Linear, LinearPredictor>(())?;
    let dataset = PartitionedDataset::from_rows(samples, 4);
    let (metrics, predictions) = predictor.batch_evaluation(&model, &dataset).await?;
    let predictions = predictions.try_collect_rows().await?;

    info!(
        "evaluated {} rows: {}",
        predictions.len(),
        serde_json::to_string(&metrics)?
    );

    predictor.shutdown();
    backend.shutdown();
    Ok(())
}

type Sample = (Vec<f32>, f32);

/// `weights[..dim]` are the feature weights, the last one is the bias.
struct Linear {
    dim: usize,
    weights: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct LinearState {
    weights: Vec<f32>,
}

impl Linear {
    fn predict(&self, x: &[f32]) -> f32 {
        let (bias, weights) = (self.weights[self.dim], &self.weights[..self.dim]);
        weights.iter().zip(x).map(|(w, x)| w * x).sum::<f32>() + bias
    }
}

impl Model for Linear {
    type Args = usize;
    type State = LinearState;

    fn reconstruction_args(&self) -> usize {
        self.dim
    }

    fn from_args(dim: usize) -> Self {
        Self {
            dim,
            weights: vec![0.0; dim + 1],
        }
    }

    fn extract_state(&self) -> LinearState {
        LinearState {
            weights: self.weights.clone(),
        }
    }

    fn restore_state(&mut self, state: LinearState) -> Result<()> {
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

#[derive(Clone)]
struct SgdConfig {
    learning_rate: f32,
    epochs: usize,
}

/// Full batch gradient descent on the mean squared error.
struct Sgd {
    config: SgdConfig,
    trained: bool,
}

impl Sgd {
    fn epoch(&self, model: &mut Linear, samples: &[Sample]) -> f32 {
        let n = samples.len().max(1) as f32;
        let mut grad = vec![0.0; model.weights.len()];
        let mut loss = 0.0;

        for (x, y) in samples {
            let err = model.predict(x) - y;
            loss += err * err;

            grad.iter_mut().zip(x).for_each(|(g, x)| *g += err * x);
            grad[model.dim] += err;
        }

        model
            .weights
            .iter_mut()
            .zip(grad)
            .for_each(|(w, g)| *w -= self.config.learning_rate * 2.0 * g / n);

        loss / n
    }
}

impl Executable for Sgd {
    type Config = SgdConfig;

    async fn start(ctx: WorkerContext, config: SgdConfig) -> Result<Self> {
        info!(rank = ctx.rank; "sgd worker starting");
        Ok(Self {
            config,
            trained: false,
        })
    }
}

impl RemoteTrainer<Linear> for Sgd {
    type Input = Arc<Vec<Sample>>;
    type Stats = f32;

    fn train(&mut self, mut model: Linear, samples: &Self::Input) -> Result<(Linear, Vec<f32>)> {
        let losses = (0..self.config.epochs)
            .map(|_| self.epoch(&mut model, samples))
            .collect();

        self.trained = true;
        Ok((model, losses))
    }

    fn train_online(&mut self, mut model: Linear, samples: &Self::Input) -> Result<Linear> {
        self.epoch(&mut model, samples);
        self.trained = true;
        Ok(model)
    }

    fn validation_field(&self) -> Option<String> {
        self.trained.then(|| "y".to_string())
    }

    fn validation_metric(&self) -> Option<String> {
        self.trained.then(|| "loss".to_string())
    }
}

struct LinearPredictor;

impl RemotePredictor<Linear> for LinearPredictor {
    type Config = ();
    type Row = Sample;
    type Prediction = f32;

    fn new(_: &()) -> Result<Self> {
        Ok(Self)
    }

    fn batch_predict(&mut self, model: &Linear, rows: &[Sample]) -> Result<Vec<f32>> {
        Ok(rows.iter().map(|(x, _)| model.predict(x)).collect())
    }

    fn batch_evaluation(
        &mut self,
        model: &Linear,
        rows: &[Sample],
    ) -> Result<(MetricsMapping, Vec<f32>)> {
        let predictions = self.batch_predict(model, rows)?;
        let loss: f32 = predictions
            .iter()
            .zip(rows)
            .map(|(p, (_, y))| (p - y) * (p - y))
            .sum();

        let metrics =
            MetricsMapping::from_iter([("loss", loss as f64), ("rows", rows.len() as f64)]);
        Ok((metrics, predictions))
    }
}
