//! Training: the fit loop, metric history, run cache and orchestrators.

pub mod cache;
pub mod experiment;
pub mod metrics;
pub mod runner;
pub mod sweep;

pub use cache::{CacheKey, RunCache};
pub use experiment::{Experiments, RunConfig, SingleRunKey};
pub use metrics::{EpochMetrics, History};
pub use runner::{BurnTrainer, FitOptions, Trainer, fit};
pub use sweep::{Hyperparameter, SweepConfig, SweepGrid, SweepKey, SweepResult, SweepRun};
