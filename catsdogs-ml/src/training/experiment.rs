//! Single training runs: hyperparameter configuration and the cached orchestrator.

use crate::config::{
    DEFAULT_ASPECT_RATIO, DEFAULT_BATCH_SIZE, DEFAULT_IMAGE_WIDTH, DEFAULT_L1_PENALTY,
    DEFAULT_L2_PENALTY, DEFAULT_LEARNING_RATE, DEFAULT_SEED, SINGLE_RUN_EPOCHS,
    SINGLE_RUN_STEPS_PER_EPOCH, SINGLE_RUN_VALIDATION_STEPS,
};
use crate::data::DatasetOptions;
use crate::error::MlError;
use crate::model::ModelOptions;
use crate::training::cache::{CacheKey, RunCache};
use crate::training::metrics::History;
use crate::training::runner::Trainer;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Fraction of images held out for validation.
pub const VALIDATION_SPLIT: f64 = 0.2;

/// Hyperparameters of one training run. Fully determines its cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub image_width: usize,
    /// Width / height; the height is derived from it.
    pub aspect_ratio: f64,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub l1_penalty: f64,
    pub l2_penalty: f64,
    pub epochs: usize,
    pub steps_per_epoch: usize,
    pub validation_steps: usize,
    /// Cache, shuffle and read ahead in the dataset streams.
    pub prefetch: bool,
    /// Seed for the dataset split, stream shuffling and weight init.
    pub seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            image_width: DEFAULT_IMAGE_WIDTH,
            aspect_ratio: DEFAULT_ASPECT_RATIO,
            batch_size: DEFAULT_BATCH_SIZE,
            learning_rate: DEFAULT_LEARNING_RATE,
            l1_penalty: DEFAULT_L1_PENALTY,
            l2_penalty: DEFAULT_L2_PENALTY,
            epochs: SINGLE_RUN_EPOCHS,
            steps_per_epoch: SINGLE_RUN_STEPS_PER_EPOCH,
            validation_steps: SINGLE_RUN_VALIDATION_STEPS,
            prefetch: true,
            seed: DEFAULT_SEED,
        }
    }
}

impl RunConfig {
    /// Reject settings that cannot produce a run or a stable cache key.
    pub fn validate(&self) -> Result<(), MlError> {
        if self.image_width == 0 {
            return Err(MlError::invalid_input("image_width must be positive"));
        }
        if self.batch_size == 0 {
            return Err(MlError::invalid_input("batch_size must be positive"));
        }
        for (name, value) in [
            ("learning_rate", self.learning_rate),
            ("l1_penalty", self.l1_penalty),
            ("l2_penalty", self.l2_penalty),
        ] {
            if !value.is_finite() {
                return Err(MlError::invalid_input(format!(
                    "{name} must be finite, got {value}"
                )));
            }
        }
        self.image_height().map(|_| ())
    }

    /// `floor(image_width / aspect_ratio)`. Fails unless the aspect ratio is
    /// finite and positive and the height is at least one pixel.
    pub fn image_height(&self) -> Result<usize, MlError> {
        image_height(self.image_width, self.aspect_ratio)
    }

    pub fn dataset_options(&self) -> Result<DatasetOptions, MlError> {
        Ok(DatasetOptions {
            image_width: self.image_width,
            image_height: self.image_height()?,
            batch_size: self.batch_size,
            steps_per_epoch: self.steps_per_epoch,
            epochs: self.epochs,
            prefetch: self.prefetch,
            seed: self.seed,
            validation_split: VALIDATION_SPLIT,
        })
    }

    pub fn model_options(&self) -> Result<ModelOptions, MlError> {
        Ok(ModelOptions {
            image_width: self.image_width,
            image_height: self.image_height()?,
            learning_rate: self.learning_rate,
            l1: self.l1_penalty,
            l2: self.l2_penalty,
            seed: self.seed,
        })
    }
}

fn image_height(image_width: usize, aspect_ratio: f64) -> Result<usize, MlError> {
    if !aspect_ratio.is_finite() || aspect_ratio <= 0.0 {
        return Err(MlError::invalid_input(format!(
            "aspect_ratio must be finite and positive, got {aspect_ratio}"
        )));
    }
    let height = (image_width as f64 / aspect_ratio).floor();
    if height < 1.0 || height > u32::MAX as f64 {
        return Err(MlError::invalid_input(format!(
            "image_width {image_width} at aspect_ratio {aspect_ratio} gives no usable height"
        )));
    }
    Ok(height as usize)
}

/// Cache key of a single run. The dataset path is deliberately absent.
#[derive(Debug, Serialize)]
pub struct SingleRunKey {
    pub image_width: usize,
    pub aspect_ratio: f64,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub l1_penalty: f64,
    pub l2_penalty: f64,
    pub epochs: usize,
    pub steps_per_epoch: usize,
    pub validation_steps: usize,
    pub prefetch: bool,
    pub seed: u64,
}

impl From<&RunConfig> for SingleRunKey {
    fn from(c: &RunConfig) -> Self {
        Self {
            image_width: c.image_width,
            aspect_ratio: c.aspect_ratio,
            batch_size: c.batch_size,
            learning_rate: c.learning_rate,
            l1_penalty: c.l1_penalty,
            l2_penalty: c.l2_penalty,
            epochs: c.epochs,
            steps_per_epoch: c.steps_per_epoch,
            validation_steps: c.validation_steps,
            prefetch: c.prefetch,
            seed: c.seed,
        }
    }
}

impl CacheKey for SingleRunKey {
    const PREFIX: &'static str = "single_model_run";
    const VERSION: u32 = 2;
    const LABEL: &'static str = "Training run";
}

/// Orchestrates cached single runs and sweeps around a [`Trainer`].
pub struct Experiments<T: Trainer> {
    pub(crate) trainer: T,
    pub(crate) cache: RunCache,
}

impl<T: Trainer> Experiments<T> {
    pub fn new(trainer: T, cache: RunCache) -> Self {
        Self { trainer, cache }
    }

    pub fn cache(&self) -> &RunCache {
        &self.cache
    }

    pub fn trainer(&self) -> &T {
        &self.trainer
    }

    /// Train one configuration, or load its result if it was trained before.
    pub fn single_run(&self, data_dir: &Path, config: &RunConfig) -> Result<History, MlError> {
        config.validate()?;
        let image_height = config.image_height()?;
        let key = SingleRunKey::from(config);
        self.cache.get_or_compute(&key, || {
            info!(
                data_dir = %data_dir.display(),
                image_width = config.image_width,
                image_height,
                batch_size = config.batch_size,
                learning_rate = config.learning_rate,
                epochs = config.epochs,
                "Starting training run"
            );
            self.trainer.fit(data_dir, config)
        })
    }
}


#[cfg(test)]
mod tests {
    use super::fakes::RecordingTrainer;
    use super::*;
    use crate::training::cache::fingerprint;
    use crate::training::cache::log_capture::with_captured_logs;
    use tempfile::TempDir;

    fn config() -> RunConfig {
        RunConfig {
            image_width: 64,
            epochs: 2,
            steps_per_epoch: 5,
            validation_steps: 5,
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_height_derived_from_aspect_ratio() {
        assert_eq!(config().image_height().unwrap(), 48);
        let c = RunConfig {
            image_width: 100,
            aspect_ratio: 3.0,
            ..RunConfig::default()
        };
        assert_eq!(c.image_height().unwrap(), 33);
    }

    #[test]
    fn test_degenerate_aspect_ratios_are_rejected() {
        for aspect_ratio in [0.0, -1.0, f64::NAN, f64::INFINITY, 1000.0] {
            let c = RunConfig {
                aspect_ratio,
                ..config()
            };
            assert!(
                matches!(c.image_height(), Err(MlError::InvalidInput(_))),
                "aspect ratio {aspect_ratio} accepted"
            );
            assert!(c.dataset_options().is_err());
        }
    }

    #[test]
    fn test_non_finite_rates_are_rejected() {
        let variants = [
            RunConfig { learning_rate: f64::NAN, ..config() },
            RunConfig { learning_rate: f64::INFINITY, ..config() },
            RunConfig { l1_penalty: f64::NEG_INFINITY, ..config() },
            RunConfig { l2_penalty: f64::NAN, ..config() },
            RunConfig { batch_size: 0, ..config() },
            RunConfig { image_width: 0, ..config() },
        ];
        for variant in &variants {
            assert!(matches!(variant.validate(), Err(MlError::InvalidInput(_))));
        }
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_invalid_config_neither_trains_nor_caches() {
        let dir = TempDir::new().unwrap();
        let experiments = Experiments::new(RecordingTrainer::default(), RunCache::new(dir.path()));
        let zero_aspect = RunConfig {
            aspect_ratio: 0.0,
            ..config()
        };
        let nan_rate = RunConfig {
            learning_rate: f64::NAN,
            ..config()
        };

        for bad in [&zero_aspect, &nan_rate] {
            let result = experiments.single_run(Path::new("data"), bad);
            assert!(matches!(result, Err(MlError::InvalidInput(_))));
        }
        assert!(experiments.trainer().calls.borrow().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_single_run_computes_once() {
        let dir = TempDir::new().unwrap();
        let experiments = Experiments::new(RecordingTrainer::default(), RunCache::new(dir.path()));

        let first = experiments.single_run(Path::new("data"), &config()).unwrap();
        let second = experiments.single_run(Path::new("data"), &config()).unwrap();

        assert_eq!(experiments.trainer().calls.borrow().len(), 1);
        assert_eq!(first, second);
        assert_eq!(first.epochs(), 2);
    }

    #[test]
    fn test_repeat_run_reports_loading_from_disk() {
        let dir = TempDir::new().unwrap();
        let experiments = Experiments::new(RecordingTrainer::default(), RunCache::new(dir.path()));

        let (_, first_logs) =
            with_captured_logs(|| experiments.single_run(Path::new("data"), &config()).unwrap());
        assert!(first_logs.contains("Starting training run"));
        assert!(!first_logs.contains("already complete"));

        let (_, second_logs) =
            with_captured_logs(|| experiments.single_run(Path::new("data"), &config()).unwrap());
        assert!(second_logs.contains("Training run already complete, loading results from disk."));
        assert!(!second_logs.contains("Starting training run"));
        assert_eq!(experiments.trainer().calls.borrow().len(), 1);
    }

    #[test]
    fn test_result_file_survives_new_orchestrator() {
        let dir = TempDir::new().unwrap();
        let first = Experiments::new(RecordingTrainer::default(), RunCache::new(dir.path()))
            .single_run(Path::new("data"), &config())
            .unwrap();

        let fresh = Experiments::new(RecordingTrainer::default(), RunCache::new(dir.path()));
        let second = fresh.single_run(Path::new("data"), &config()).unwrap();
        assert!(fresh.trainer().calls.borrow().is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn test_data_dir_is_not_part_of_the_key() {
        let dir = TempDir::new().unwrap();
        let experiments = Experiments::new(RecordingTrainer::default(), RunCache::new(dir.path()));
        experiments.single_run(Path::new("a"), &config()).unwrap();
        experiments.single_run(Path::new("b"), &config()).unwrap();
        assert_eq!(experiments.trainer().calls.borrow().len(), 1);
    }

    #[test]
    fn test_every_field_changes_the_key() {
        let base = config();
        let variants = [
            RunConfig { image_width: 32, ..base.clone() },
            RunConfig { aspect_ratio: 1.0, ..base.clone() },
            RunConfig { batch_size: 4, ..base.clone() },
            RunConfig { learning_rate: 0.01, ..base.clone() },
            RunConfig { l1_penalty: 0.1, ..base.clone() },
            RunConfig { l2_penalty: 0.1, ..base.clone() },
            RunConfig { epochs: 3, ..base.clone() },
            RunConfig { steps_per_epoch: 6, ..base.clone() },
            RunConfig { validation_steps: 6, ..base.clone() },
            RunConfig { prefetch: false, ..base.clone() },
            RunConfig { seed: 1, ..base.clone() },
        ];
        let base_fp = fingerprint(&SingleRunKey::from(&base)).unwrap();
        for variant in &variants {
            assert_ne!(fingerprint(&SingleRunKey::from(variant)).unwrap(), base_fp);
        }
    }

    #[test]
    fn test_failed_fit_is_not_cached() {
        let dir = TempDir::new().unwrap();
        let trainer = RecordingTrainer {
            fail_on_call: Some(1),
            ..RecordingTrainer::default()
        };
        let experiments = Experiments::new(trainer, RunCache::new(dir.path()));
        assert!(experiments.single_run(Path::new("data"), &config()).is_err());
        assert!(
            !experiments
                .cache()
                .contains(&SingleRunKey::from(&config()))
                .unwrap()
        );
    }
}
