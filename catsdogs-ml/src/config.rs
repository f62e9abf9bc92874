//! Configuration for catsdogs.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> explicit file -> environment. The resolved values
//! are passed explicitly into the orchestrators; nothing here is global state.

use crate::error::MlError;
use crate::plot::AxisLimits;
use crate::training::experiment::RunConfig;
use crate::training::sweep::SweepConfig;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub(crate) const DEFAULT_BATCH_SIZE: usize = 8;
pub(crate) const DEFAULT_LEARNING_RATE: f64 = 0.1;
pub(crate) const DEFAULT_L1_PENALTY: f64 = 0.0;
pub(crate) const DEFAULT_L2_PENALTY: f64 = 0.0;
pub(crate) const DEFAULT_IMAGE_WIDTH: usize = 48;
pub(crate) const DEFAULT_ASPECT_RATIO: f64 = 4.0 / 3.0;
pub(crate) const DEFAULT_SEED: u64 = 315;

pub(crate) const SINGLE_RUN_EPOCHS: usize = 200;
pub(crate) const SINGLE_RUN_STEPS_PER_EPOCH: usize = 25;
pub(crate) const SINGLE_RUN_VALIDATION_STEPS: usize = 25;

pub(crate) const SWEEP_EPOCHS: usize = 20;
pub(crate) const SWEEP_STEPS_PER_EPOCH: usize = 10;
pub(crate) const SWEEP_VALIDATION_STEPS: usize = 10;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatsDogsConfig {
    /// Directory holding cached run results.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Dataset directory with one subdirectory per class.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Defaults for a single training run.
    #[serde(default)]
    pub single_run: RunConfig,
    /// Defaults for a hyperparameter sweep.
    #[serde(default)]
    pub sweep: SweepConfig,
    /// Fixed y-axis limits for rendered figures.
    #[serde(default)]
    pub plot: AxisLimits,
}

impl Default for CatsDogsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            data_dir: None,
            single_run: RunConfig::default(),
            sweep: SweepConfig::default(),
            plot: AxisLimits::default(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".catsdogs/runs")
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `CATSDOGS_`, nested with `__`)
/// 2. Explicit config file (e.g. from `--config`)
/// 3. Workspace-local config (`.catsdogs/config.toml`)
/// 4. User config (`~/.config/catsdogs/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<CatsDogsConfig, MlError> {
    let mut figment = Figment::from(Serialized::defaults(CatsDogsConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "catsdogs", "catsdogs") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".catsdogs").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(MlError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    // CATSDOGS_SINGLE_RUN__EPOCHS, CATSDOGS_CACHE_DIR, ...
    figment = figment.merge(Env::prefixed("CATSDOGS_").split("__"));

    Ok(figment.extract()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_matches_helper_constants() {
        let config = CatsDogsConfig::default();
        assert_eq!(config.single_run.batch_size, 8);
        assert_eq!(config.single_run.learning_rate, 0.1);
        assert_eq!(config.single_run.image_width, 48);
        assert_eq!(config.single_run.epochs, 200);
        assert_eq!(config.single_run.steps_per_epoch, 25);
        assert_eq!(config.sweep.epochs, 20);
        assert_eq!(config.sweep.validation_steps, 10);
        assert_eq!(config.sweep.grid.batch_sizes, vec![8]);
    }

    #[test]
    fn test_workspace_config_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg_dir = dir.path().join(".catsdogs");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            r#"
cache_dir = "results"

[single_run]
epochs = 3
learning_rate = 0.001

[sweep.grid]
batch_sizes = [4, 8]
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("results"));
        assert_eq!(config.single_run.epochs, 3);
        assert_eq!(config.single_run.learning_rate, 0.001);
        // untouched fields keep their defaults
        assert_eq!(config.single_run.batch_size, 8);
        assert_eq!(config.sweep.grid.batch_sizes, vec![4, 8]);
        assert_eq!(config.sweep.grid.image_widths, vec![48]);
    }

    #[test]
    fn test_missing_explicit_config_is_error() {
        let dir = TempDir::new().unwrap();
        let result = load_config(None, Some(&dir.path().join("nope.toml")));
        assert!(matches!(result, Err(MlError::Config(_))));
    }

    #[test]
    fn test_explicit_file_sets_plot_limits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catsdogs.toml");
        std::fs::write(&path, "[plot]\naccuracy = [40.0, 100.0]\n").unwrap();

        let config = load_config(None, Some(&path)).unwrap();
        assert_eq!(config.plot.accuracy, Some((40.0, 100.0)));
        assert_eq!(config.plot.entropy, None);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = CatsDogsConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CatsDogsConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
