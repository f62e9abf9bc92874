//! catsdogs CLI: train, sweep and plot the cats vs. dogs classifier.
//!
//! Every completed run is cached under the cache directory, so repeating a
//! command with the same hyperparameters loads the stored result instead of
//! retraining.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// catsdogs: cached CNN training runs and hyperparameter sweeps
#[derive(Parser, Debug)]
#[command(name = "catsdogs", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (reads `.catsdogs/config.toml` from here)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding cached run results
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train a single configuration (or load its cached result)
    Train(TrainArgs),
    /// Train every combination of a hyperparameter grid
    Sweep(SweepArgs),
    /// Render a figure from a cached result file
    Plot(PlotArgs),
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug, Default)]
struct DataArgs {
    /// Dataset directory with one subdirectory per class
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Width / height of the input images
    #[arg(long)]
    aspect_ratio: Option<f64>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    steps_per_epoch: Option<usize>,

    #[arg(long)]
    validation_steps: Option<usize>,

    /// Disable caching, shuffling and read-ahead in the dataset streams
    #[arg(long)]
    no_prefetch: bool,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(clap::Args, Debug)]
struct TrainArgs {
    #[command(flatten)]
    data: DataArgs,

    #[arg(long)]
    image_width: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    l1: Option<f64>,

    #[arg(long)]
    l2: Option<f64>,

    /// Write the training curves to this file (.svg or .png)
    #[arg(long)]
    plot: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct SweepArgs {
    #[command(flatten)]
    data: DataArgs,

    /// Comma-separated candidate values
    #[arg(long, value_delimiter = ',')]
    image_widths: Option<Vec<usize>>,

    #[arg(long, value_delimiter = ',')]
    batch_sizes: Option<Vec<usize>>,

    #[arg(long, value_delimiter = ',')]
    learning_rates: Option<Vec<f64>>,

    #[arg(long, value_delimiter = ',')]
    l1_penalties: Option<Vec<f64>>,

    #[arg(long, value_delimiter = ',')]
    l2_penalties: Option<Vec<f64>>,

    /// Write one row of curves per run to this file (.svg or .png)
    #[arg(long)]
    plot: Option<PathBuf>,

    /// Hyperparameters named in each row title (e.g. batch_size,learning_rate)
    #[arg(long, value_delimiter = ',')]
    show: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct PlotArgs {
    /// Cached result file (single_model_run_*.json or optimization_run_*.json)
    result: PathBuf,

    /// Output figure (.svg or .png)
    #[arg(short, long)]
    output: PathBuf,

    /// Hyperparameters named in each sweep row title
    #[arg(long, value_delimiter = ',')]
    show: Vec<String>,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default config file in the workspace
    Init,
    /// Show the resolved configuration
    Show,
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "catsdogs", "catsdogs")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "catsdogs.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli, &workspace)
}
