//! Training runner: the blocking fit over bounded steps of infinite streams.

use crate::data::{BatchIter, DatasetPair, ImageBatch, make_datasets};
use crate::error::MlError;
use crate::model::{CatDogClassifier, CompiledModel, Normalization, compile_model};
use crate::training::experiment::RunConfig;
use crate::training::metrics::{EpochMetrics, History};
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor, TensorData};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

/// Probabilities are clamped to `[EPS, 1 - EPS]` before taking logs.
const EPS: f32 = 1e-7;

/// Decision threshold for binary accuracy.
pub const ACCURACY_THRESHOLD: f32 = 0.5;

/// Executes one complete training run for a configuration.
///
/// This is the expensive collaborator the orchestrators cache around.
pub trait Trainer {
    fn fit(&self, data_dir: &Path, config: &RunConfig) -> Result<History, MlError>;
}

/// Trainer backed by a `burn` autodiff backend.
#[derive(Debug, Clone)]
pub struct BurnTrainer<B: AutodiffBackend> {
    device: B::Device,
}

impl<B: AutodiffBackend> BurnTrainer<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: AutodiffBackend> Trainer for BurnTrainer<B> {
    fn fit(&self, data_dir: &Path, config: &RunConfig) -> Result<History, MlError> {
        let datasets = make_datasets(data_dir, &config.dataset_options()?)?;
        let model = compile_model::<B>(&datasets.training, &config.model_options()?, &self.device)?;
        fit(model, &datasets, &FitOptions::from(config))
    }
}

/// How much of the infinite streams one fit consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitOptions {
    pub epochs: usize,
    pub steps_per_epoch: usize,
    pub validation_steps: usize,
}

impl From<&RunConfig> for FitOptions {
    fn from(config: &RunConfig) -> Self {
        Self {
            epochs: config.epochs,
            steps_per_epoch: config.steps_per_epoch,
            validation_steps: config.validation_steps,
        }
    }
}

/// Train `model` for `options.epochs` epochs of `steps_per_epoch` batches,
/// evaluating `validation_steps` validation batches after each epoch.
///
/// Both streams continue across epochs rather than restarting.
pub fn fit<B: AutodiffBackend>(
    model: CompiledModel<B>,
    datasets: &DatasetPair,
    options: &FitOptions,
) -> Result<History, MlError> {
    if options.steps_per_epoch == 0 || options.validation_steps == 0 {
        return Err(MlError::invalid_input(
            "steps per epoch and validation steps must be positive",
        ));
    }

    let CompiledModel {
        mut network,
        mut optimizer,
        normalization,
        learning_rate,
        l1,
        l2,
        device,
    } = model;

    let mut train_stream = datasets.training.iter();
    let mut val_stream = datasets.validation.iter();
    let mut history = History::new();
    let started = Instant::now();

    for epoch in 1..=options.epochs {
        let mut train = RunningMean::default();
        for _ in 0..options.steps_per_epoch {
            let batch = next_batch(&mut train_stream, "training")?;
            let (images, labels) = batch_tensors::<B>(&batch, &normalization, &device);

            let probs = network.forward(images);
            let accuracy = binary_accuracy(probs.clone(), &batch.labels)?;
            let loss = total_loss(&network, probs, labels, l1, l2);
            let loss_value = loss.clone().into_scalar().elem::<f64>();

            let grads = GradientsParams::from_grads(loss.backward(), &network);
            network = optimizer.step(learning_rate, network, grads);

            train.add(loss_value, accuracy, batch.len());
        }

        let valid = network.valid();
        let mut val = RunningMean::default();
        for _ in 0..options.validation_steps {
            let batch = next_batch(&mut val_stream, "validation")?;
            let (images, labels) = batch_tensors::<B::InnerBackend>(&batch, &normalization, &device);

            let probs = valid.forward(images);
            let accuracy = binary_accuracy(probs.clone(), &batch.labels)?;
            let loss = total_loss(&valid, probs, labels, l1, l2);
            val.add(loss.into_scalar().elem::<f64>(), accuracy, batch.len());
        }

        let metrics = EpochMetrics {
            loss: train.loss(),
            binary_accuracy: train.accuracy(),
            val_loss: val.loss(),
            val_binary_accuracy: val.accuracy(),
        };
        debug!(
            epoch,
            loss = metrics.loss,
            binary_accuracy = metrics.binary_accuracy,
            val_loss = metrics.val_loss,
            val_binary_accuracy = metrics.val_binary_accuracy,
            "Epoch complete"
        );
        history.record_epoch(metrics);
    }

    info!(
        epochs = options.epochs,
        elapsed_secs = started.elapsed().as_secs_f64(),
        "Training run finished"
    );
    Ok(history)
}

fn next_batch(stream: &mut BatchIter, which: &str) -> Result<ImageBatch, MlError> {
    stream
        .next()
        .ok_or_else(|| MlError::training(format!("{which} stream is empty")))?
}

fn batch_tensors<B: Backend>(
    batch: &ImageBatch,
    normalization: &Normalization,
    device: &B::Device,
) -> (Tensor<B, 4>, Tensor<B, 2>) {
    let n = batch.len();
    let images = Tensor::<B, 4>::from_data(
        TensorData::new(batch.images.clone(), [n, 1, batch.height, batch.width]),
        device,
    );
    let labels = Tensor::<B, 2>::from_data(TensorData::new(batch.labels.clone(), [n, 1]), device);
    (normalization.apply(images), labels)
}

/// Mean binary cross-entropy of `probs` against 0/1 `targets`.
pub fn binary_cross_entropy<B: Backend>(probs: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
    let probs = probs.clamp(EPS, 1.0 - EPS);
    let positive = targets.clone() * probs.clone().log();
    let negative = targets.neg().add_scalar(1.0) * probs.neg().add_scalar(1.0).log();
    (positive + negative).neg().mean()
}

fn total_loss<B: Backend>(
    network: &CatDogClassifier<B>,
    probs: Tensor<B, 2>,
    targets: Tensor<B, 2>,
    l1: f64,
    l2: f64,
) -> Tensor<B, 1> {
    let loss = binary_cross_entropy(probs, targets);
    match network.weight_penalty(l1, l2) {
        Some(penalty) => loss + penalty,
        None => loss,
    }
}

/// Fraction of predictions on the same side of the threshold as the label.
pub fn binary_accuracy<B: Backend>(probs: Tensor<B, 2>, labels: &[f32]) -> Result<f64, MlError> {
    let probs = probs
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| MlError::training(format!("reading predictions: {e:?}")))?;
    if probs.is_empty() {
        return Ok(0.0);
    }
    let correct = probs
        .iter()
        .zip(labels)
        .filter(|(p, y)| (**p > ACCURACY_THRESHOLD) == (**y > ACCURACY_THRESHOLD))
        .count();
    Ok(correct as f64 / probs.len() as f64)
}

/// Sample-weighted running mean of batch loss and accuracy.
#[derive(Debug, Default)]
struct RunningMean {
    loss_sum: f64,
    accuracy_sum: f64,
    samples: usize,
}

impl RunningMean {
    fn add(&mut self, loss: f64, accuracy: f64, samples: usize) {
        self.loss_sum += loss * samples as f64;
        self.accuracy_sum += accuracy * samples as f64;
        self.samples += samples;
    }

    fn loss(&self) -> f64 {
        self.loss_sum / self.samples.max(1) as f64
    }

    fn accuracy(&self) -> f64 {
        self.accuracy_sum / self.samples.max(1) as f64
    }
}
