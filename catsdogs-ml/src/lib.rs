//! # catsdogs-ml - cats vs. dogs CNN training, run caching and sweeps
//!
//! Builds training/validation streams from a directory of labeled images,
//! trains a small convolutional network with `burn`, and caches every
//! completed experiment on disk so it is never re-run.
//!
//! ## Layers
//!
//! 1. **Data**: directory indexing, seeded split, lazily decoded batch streams
//! 2. **Model**: fixed CNN topology with an adapted normalization stage
//! 3. **Training**: the fit loop, the run cache and the single-run/sweep orchestrators
//! 4. **Plot**: accuracy and cross-entropy figures

// Foundation
pub mod config;
pub mod error;
pub mod persistence;

pub mod data;
pub mod model;
pub mod plot;
pub mod training;

// Re-exports
pub use config::{CatsDogsConfig, load_config};
pub use error::MlError;
pub use plot::{AxisLimits, Figure, single_run_figure, sweep_figure};
pub use training::{
    BurnTrainer, Experiments, History, Hyperparameter, RunCache, RunConfig, SweepConfig,
    SweepGrid, SweepResult, Trainer,
};
