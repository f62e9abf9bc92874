//! Model factory: network, adapted normalization and optimizer for one run.

pub mod network;
pub mod normalization;

pub use network::{CatDogClassifier, ClassifierConfig};
pub use normalization::Normalization;

use crate::data::ImageDataset;
use crate::error::MlError;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig};
use burn::tensor::backend::AutodiffBackend;
use tracing::debug;

/// Hyperparameters the model factory consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOptions {
    pub image_width: usize,
    pub image_height: usize,
    pub learning_rate: f64,
    pub l1: f64,
    pub l2: f64,
    pub seed: u64,
}

/// A freshly initialized network bound to its optimizer and loss terms.
pub struct CompiledModel<B: AutodiffBackend> {
    pub network: CatDogClassifier<B>,
    pub optimizer: OptimizerAdaptor<Adam, CatDogClassifier<B>, B>,
    pub normalization: Normalization,
    pub learning_rate: f64,
    pub l1: f64,
    pub l2: f64,
    pub device: B::Device,
}

/// Adapt normalization on `training`, allocate seeded weights and bind Adam.
pub fn compile_model<B: AutodiffBackend>(
    training: &ImageDataset,
    options: &ModelOptions,
    device: &B::Device,
) -> Result<CompiledModel<B>, MlError> {
    let normalization = Normalization::adapt(training)?;
    debug!(
        mean = normalization.mean,
        variance = normalization.variance,
        pixels = normalization.count,
        "Adapted input normalization"
    );

    let network = ClassifierConfig::new(options.image_width, options.image_height)
        .with_seed(options.seed)
        .init::<B>(device)?;
    let optimizer = AdamConfig::new().init::<B, CatDogClassifier<B>>();

    Ok(CompiledModel {
        network,
        optimizer,
        normalization,
        learning_rate: options.learning_rate,
        l1: options.l1,
        l2: options.l2,
        device: device.clone(),
    })
}
