//! Hyperparameter grid sweeps.
//!
//! The grid is enumerated as a cartesian product with batch size varying
//! slowest, then learning rate, L1 penalty, L2 penalty, and image width
//! varying fastest. Runs execute sequentially and the whole sweep is cached
//! as a single entry.

use crate::config::{
    DEFAULT_ASPECT_RATIO, DEFAULT_BATCH_SIZE, DEFAULT_IMAGE_WIDTH, DEFAULT_L1_PENALTY,
    DEFAULT_L2_PENALTY, DEFAULT_LEARNING_RATE, DEFAULT_SEED, SWEEP_EPOCHS, SWEEP_STEPS_PER_EPOCH,
    SWEEP_VALIDATION_STEPS,
};
use crate::error::MlError;
use crate::training::cache::CacheKey;
use crate::training::experiment::{Experiments, RunConfig};
use crate::training::metrics::History;
use crate::training::runner::Trainer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::info;

/// A sweepable hyperparameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hyperparameter {
    BatchSize,
    LearningRate,
    L1Penalty,
    L2Penalty,
    ImageWidth,
}

impl Hyperparameter {
    /// Enumeration order of the grid, slowest first.
    pub const ALL: [Hyperparameter; 5] = [
        Hyperparameter::BatchSize,
        Hyperparameter::LearningRate,
        Hyperparameter::L1Penalty,
        Hyperparameter::L2Penalty,
        Hyperparameter::ImageWidth,
    ];

    /// Name used in figure labels.
    pub fn display_name(&self) -> &'static str {
        match self {
            Hyperparameter::BatchSize => "batch size",
            Hyperparameter::LearningRate => "learning rate",
            Hyperparameter::L1Penalty => "L1 penalty",
            Hyperparameter::L2Penalty => "L2 penalty",
            Hyperparameter::ImageWidth => "Image width",
        }
    }

    /// Value of this hyperparameter in `config`, formatted for display.
    pub fn value_of(&self, config: &RunConfig) -> String {
        match self {
            Hyperparameter::BatchSize => config.batch_size.to_string(),
            Hyperparameter::LearningRate => config.learning_rate.to_string(),
            Hyperparameter::L1Penalty => config.l1_penalty.to_string(),
            Hyperparameter::L2Penalty => config.l2_penalty.to_string(),
            Hyperparameter::ImageWidth => config.image_width.to_string(),
        }
    }
}

impl fmt::Display for Hyperparameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl std::str::FromStr for Hyperparameter {
    type Err = MlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "batch_size" | "batch_sizes" => Ok(Hyperparameter::BatchSize),
            "learning_rate" | "learning_rates" => Ok(Hyperparameter::LearningRate),
            "l1" | "l1_penalty" | "l1_penalties" => Ok(Hyperparameter::L1Penalty),
            "l2" | "l2_penalty" | "l2_penalties" => Ok(Hyperparameter::L2Penalty),
            "image_width" | "image_widths" | "width" => Ok(Hyperparameter::ImageWidth),
            other => Err(MlError::invalid_input(format!(
                "unknown hyperparameter: {other}"
            ))),
        }
    }
}

/// Candidate values for each swept hyperparameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepGrid {
    pub image_widths: Vec<usize>,
    pub batch_sizes: Vec<usize>,
    pub learning_rates: Vec<f64>,
    pub l1_penalties: Vec<f64>,
    pub l2_penalties: Vec<f64>,
}

impl Default for SweepGrid {
    fn default() -> Self {
        Self {
            image_widths: vec![DEFAULT_IMAGE_WIDTH],
            batch_sizes: vec![DEFAULT_BATCH_SIZE],
            learning_rates: vec![DEFAULT_LEARNING_RATE],
            l1_penalties: vec![DEFAULT_L1_PENALTY],
            l2_penalties: vec![DEFAULT_L2_PENALTY],
        }
    }
}

impl SweepGrid {
    /// Number of combinations: the product of the five list lengths.
    pub fn len(&self) -> usize {
        self.batch_sizes.len()
            * self.learning_rates.len()
            * self.l1_penalties.len()
            * self.l2_penalties.len()
            * self.image_widths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A sweep: the grid plus the settings shared by every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub grid: SweepGrid,
    pub aspect_ratio: f64,
    pub epochs: usize,
    pub steps_per_epoch: usize,
    pub validation_steps: usize,
    pub prefetch: bool,
    pub seed: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            grid: SweepGrid::default(),
            aspect_ratio: DEFAULT_ASPECT_RATIO,
            epochs: SWEEP_EPOCHS,
            steps_per_epoch: SWEEP_STEPS_PER_EPOCH,
            validation_steps: SWEEP_VALIDATION_STEPS,
            prefetch: true,
            seed: DEFAULT_SEED,
        }
    }
}

impl SweepConfig {
    /// Every grid point must be a valid [`RunConfig`]. An empty grid is valid.
    pub fn validate(&self) -> Result<(), MlError> {
        if !self.aspect_ratio.is_finite() || self.aspect_ratio <= 0.0 {
            return Err(MlError::invalid_input(format!(
                "aspect_ratio must be finite and positive, got {}",
                self.aspect_ratio
            )));
        }
        self.combinations().iter().try_for_each(RunConfig::validate)
    }

    /// One run configuration per grid point, in enumeration order.
    pub fn combinations(&self) -> Vec<RunConfig> {
        let grid = &self.grid;
        let mut runs = Vec::with_capacity(grid.len());
        for &batch_size in &grid.batch_sizes {
            for &learning_rate in &grid.learning_rates {
                for &l1_penalty in &grid.l1_penalties {
                    for &l2_penalty in &grid.l2_penalties {
                        for &image_width in &grid.image_widths {
                            runs.push(RunConfig {
                                image_width,
                                aspect_ratio: self.aspect_ratio,
                                batch_size,
                                learning_rate,
                                l1_penalty,
                                l2_penalty,
                                epochs: self.epochs,
                                steps_per_epoch: self.steps_per_epoch,
                                validation_steps: self.validation_steps,
                                prefetch: self.prefetch,
                                seed: self.seed,
                            });
                        }
                    }
                }
            }
        }
        runs
    }
}

/// Cache key of a whole sweep; every candidate list is included in full.
#[derive(Debug, Serialize)]
pub struct SweepKey<'a> {
    pub image_widths: &'a [usize],
    pub batch_sizes: &'a [usize],
    pub learning_rates: &'a [f64],
    pub l1_penalties: &'a [f64],
    pub l2_penalties: &'a [f64],
    pub aspect_ratio: f64,
    pub epochs: usize,
    pub steps_per_epoch: usize,
    pub validation_steps: usize,
    pub prefetch: bool,
    pub seed: u64,
}

impl<'a> From<&'a SweepConfig> for SweepKey<'a> {
    fn from(c: &'a SweepConfig) -> Self {
        Self {
            image_widths: &c.grid.image_widths,
            batch_sizes: &c.grid.batch_sizes,
            learning_rates: &c.grid.learning_rates,
            l1_penalties: &c.grid.l1_penalties,
            l2_penalties: &c.grid.l2_penalties,
            aspect_ratio: c.aspect_ratio,
            epochs: c.epochs,
            steps_per_epoch: c.steps_per_epoch,
            validation_steps: c.validation_steps,
            prefetch: c.prefetch,
            seed: c.seed,
        }
    }
}

impl CacheKey for SweepKey<'_> {
    const PREFIX: &'static str = "optimization_run";
    const VERSION: u32 = 2;
    const LABEL: &'static str = "Optimization run";
}

/// One grid point and its training result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRun {
    pub config: RunConfig,
    pub history: History,
}

/// Results of every grid point, in enumeration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub runs: Vec<SweepRun>,
}

impl SweepResult {
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn histories(&self) -> impl Iterator<Item = &History> {
        self.runs.iter().map(|r| &r.history)
    }

    /// Run with the highest final-epoch validation accuracy.
    pub fn best_by_val_accuracy(&self) -> Option<&SweepRun> {
        self.runs
            .iter()
            .filter_map(|run| {
                run.history
                    .metric(crate::training::metrics::VAL_BINARY_ACCURACY)
                    .last()
                    .map(|acc| (run, *acc))
            })
            .filter(|(_, acc)| !acc.is_nan())
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(run, _)| run)
    }
}

impl<T: Trainer> Experiments<T> {
    /// Train every grid point sequentially, or load the whole sweep if it was
    /// run before. A failing run aborts the sweep and nothing is cached.
    pub fn sweep(&self, data_dir: &Path, config: &SweepConfig) -> Result<SweepResult, MlError> {
        config.validate()?;
        let key = SweepKey::from(config);
        self.cache.get_or_compute(&key, || {
            let combinations = config.combinations();
            let total = combinations.len();
            let mut runs = Vec::with_capacity(total);

            for (i, run_config) in combinations.into_iter().enumerate() {
                info!(
                    batch_size = run_config.batch_size,
                    learning_rate = run_config.learning_rate,
                    l1_penalty = run_config.l1_penalty,
                    l2_penalty = run_config.l2_penalty,
                    image_width = run_config.image_width,
                    "Starting training run {} of {}",
                    i + 1,
                    total
                );
                let history = self.trainer.fit(data_dir, &run_config)?;
                runs.push(SweepRun {
                    config: run_config,
                    history,
                });
            }
            Ok(SweepResult { runs })
        })
    }
}
