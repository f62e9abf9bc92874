//! Subcommand handlers.

use crate::{Cli, Commands, ConfigAction, DataArgs, PlotArgs, SweepArgs, TrainArgs};
use anyhow::{Context, bail};
use burn::backend::{Autodiff, NdArray};
use catsdogs_ml::persistence::load_json;
use catsdogs_ml::training::cache::CacheEntry;
use catsdogs_ml::training::metrics::{BINARY_ACCURACY, LOSS, VAL_BINARY_ACCURACY, VAL_LOSS};
use catsdogs_ml::{
    BurnTrainer, CatsDogsConfig, Experiments, Figure, History, Hyperparameter, RunCache,
    RunConfig, SweepConfig, SweepResult, single_run_figure, sweep_figure,
};
use std::path::{Path, PathBuf};

/// CPU backend with autodiff used for every training run.
type TrainBackend = Autodiff<NdArray<f32>>;

/// Handle a CLI subcommand.
pub fn handle_command(cli: Cli, workspace: &Path) -> anyhow::Result<()> {
    let config = catsdogs_ml::load_config(Some(workspace), cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let cache_dir = resolve(
        workspace,
        cli.cache_dir.as_deref().unwrap_or(config.cache_dir.as_path()),
    );
    tracing::debug!(cache_dir = %cache_dir.display(), "Resolved cache directory");

    match cli.command {
        Commands::Train(args) => handle_train(args, &config, workspace, &cache_dir),
        Commands::Sweep(args) => handle_sweep(args, &config, workspace, &cache_dir),
        Commands::Plot(args) => handle_plot(args, &config),
        Commands::Config { action } => handle_config(action, &config, workspace),
    }
}

fn experiments(cache_dir: &Path) -> Experiments<BurnTrainer<TrainBackend>> {
    Experiments::new(
        BurnTrainer::new(Default::default()),
        RunCache::new(cache_dir),
    )
}

fn handle_train(
    args: TrainArgs,
    config: &CatsDogsConfig,
    workspace: &Path,
    cache_dir: &Path,
) -> anyhow::Result<()> {
    let data_dir = data_dir(&args.data, config, workspace)?;
    let run = train_config(&args, &config.single_run);

    let history = experiments(cache_dir)
        .single_run(&data_dir, &run)
        .with_context(|| format!("training on {}", data_dir.display()))?;

    print_summary(&history);
    if let Some(path) = &args.plot {
        let figure = single_run_figure(&history).with_axis_limits(&config.plot);
        render(&figure, &resolve(workspace, path))?;
    }
    Ok(())
}

fn handle_sweep(
    args: SweepArgs,
    config: &CatsDogsConfig,
    workspace: &Path,
    cache_dir: &Path,
) -> anyhow::Result<()> {
    let data_dir = data_dir(&args.data, config, workspace)?;
    let shown = parse_shown(&args.show)?;
    let sweep = sweep_config(&args, &config.sweep);

    let result = experiments(cache_dir)
        .sweep(&data_dir, &sweep)
        .with_context(|| format!("sweeping on {}", data_dir.display()))?;

    println!("Completed {} run(s)", result.len());
    if let Some(best) = result.best_by_val_accuracy() {
        let c = &best.config;
        println!(
            "Best: batch size {}, learning rate {}, L1 {}, L2 {}, width {} -> val accuracy {:.1}%",
            c.batch_size,
            c.learning_rate,
            c.l1_penalty,
            c.l2_penalty,
            c.image_width,
            best.history
                .metric(VAL_BINARY_ACCURACY)
                .last()
                .copied()
                .unwrap_or_default()
                * 100.0
        );
    }
    if let Some(path) = &args.plot {
        let figure = sweep_figure(&result, &shown).with_axis_limits(&config.plot);
        render(&figure, &resolve(workspace, path))?;
    }
    Ok(())
}

fn handle_plot(args: PlotArgs, config: &CatsDogsConfig) -> anyhow::Result<()> {
    let shown = parse_shown(&args.show)?;
    let figure = figure_from_file(&args.result, &shown)?.with_axis_limits(&config.plot);
    render(&figure, &args.output)
}

fn handle_config(
    action: ConfigAction,
    config: &CatsDogsConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".catsdogs");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&CatsDogsConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

/// Build the figure for a cached result, dispatching on the entry's kind.
fn figure_from_file(path: &Path, shown: &[Hyperparameter]) -> anyhow::Result<Figure> {
    let entry: CacheEntry<serde_json::Value, serde_json::Value> = load_json(path)?
        .with_context(|| format!("result file not found: {}", path.display()))?;

    match entry.kind.as_str() {
        "single_model_run" => {
            let history: History = serde_json::from_value(entry.result)?;
            Ok(single_run_figure(&history))
        }
        "optimization_run" => {
            let result: SweepResult = serde_json::from_value(entry.result)?;
            Ok(sweep_figure(&result, shown))
        }
        other => bail!("unknown result kind '{}' in {}", other, path.display()),
    }
}

fn render(figure: &Figure, path: &Path) -> anyhow::Result<()> {
    let is_png = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("png"));
    if is_png {
        figure.render_png(path)?;
    } else {
        figure.render_svg(path)?;
    }
    println!("Figure written to {}", path.display());
    Ok(())
}

fn print_summary(history: &History) {
    let last = |name: &str| history.metric(name).last().copied().unwrap_or(f64::NAN);
    println!("Epochs: {}", history.epochs());
    println!(
        "Final: loss {:.4}, accuracy {:.1}%, val loss {:.4}, val accuracy {:.1}%",
        last(LOSS),
        last(BINARY_ACCURACY) * 100.0,
        last(VAL_LOSS),
        last(VAL_BINARY_ACCURACY) * 100.0
    );
    if let Some((epoch, acc)) = history.best_val_accuracy() {
        println!("Best val accuracy {:.1}% at epoch {}", acc * 100.0, epoch);
    }
}

fn data_dir(
    args: &DataArgs,
    config: &CatsDogsConfig,
    workspace: &Path,
) -> anyhow::Result<PathBuf> {
    match args.data_dir.as_ref().or(config.data_dir.as_ref()) {
        Some(dir) => Ok(resolve(workspace, dir)),
        None => bail!("no dataset directory: pass --data-dir or set data_dir in the config"),
    }
}

fn parse_shown(names: &[String]) -> anyhow::Result<Vec<Hyperparameter>> {
    names
        .iter()
        .map(|name| name.parse::<Hyperparameter>().map_err(anyhow::Error::from))
        .collect()
}

/// Relative paths are taken from the workspace.
fn resolve(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

fn apply_data_args(run: &mut RunConfig, args: &DataArgs) {
    if let Some(v) = args.aspect_ratio {
        run.aspect_ratio = v;
    }
    if let Some(v) = args.epochs {
        run.epochs = v;
    }
    if let Some(v) = args.steps_per_epoch {
        run.steps_per_epoch = v;
    }
    if let Some(v) = args.validation_steps {
        run.validation_steps = v;
    }
    if args.no_prefetch {
        run.prefetch = false;
    }
    if let Some(v) = args.seed {
        run.seed = v;
    }
}

/// Configured single-run defaults with command-line overrides applied.
fn train_config(args: &TrainArgs, defaults: &RunConfig) -> RunConfig {
    let mut run = defaults.clone();
    apply_data_args(&mut run, &args.data);
    if let Some(v) = args.image_width {
        run.image_width = v;
    }
    if let Some(v) = args.batch_size {
        run.batch_size = v;
    }
    if let Some(v) = args.learning_rate {
        run.learning_rate = v;
    }
    if let Some(v) = args.l1 {
        run.l1_penalty = v;
    }
    if let Some(v) = args.l2 {
        run.l2_penalty = v;
    }
    run
}

/// Configured sweep defaults with command-line overrides applied.
fn sweep_config(args: &SweepArgs, defaults: &SweepConfig) -> SweepConfig {
    let mut sweep = defaults.clone();
    let d = &args.data;
    if let Some(v) = d.aspect_ratio {
        sweep.aspect_ratio = v;
    }
    if let Some(v) = d.epochs {
        sweep.epochs = v;
    }
    if let Some(v) = d.steps_per_epoch {
        sweep.steps_per_epoch = v;
    }
    if let Some(v) = d.validation_steps {
        sweep.validation_steps = v;
    }
    if d.no_prefetch {
        sweep.prefetch = false;
    }
    if let Some(v) = d.seed {
        sweep.seed = v;
    }

    let grid = &mut sweep.grid;
    if let Some(v) = &args.image_widths {
        grid.image_widths = v.clone();
    }
    if let Some(v) = &args.batch_sizes {
        grid.batch_sizes = v.clone();
    }
    if let Some(v) = &args.learning_rates {
        grid.learning_rates = v.clone();
    }
    if let Some(v) = &args.l1_penalties {
        grid.l1_penalties = v.clone();
    }
    if let Some(v) = &args.l2_penalties {
        grid.l2_penalties = v.clone();
    }
    sweep
}
