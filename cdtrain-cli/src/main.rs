//! cdtrain CLI: train change-detection models and evaluate checkpoints.

mod commands;

use std::path::PathBuf;

use cdtrain_core::{ExperimentLayout, PathResolver, RunConfig};
use clap::Parser;
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// cdtrain: train and evaluate bi-temporal change detectors
#[derive(Parser, Debug)]
#[command(name = "cdtrain", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Do not prompt for run notes before training
    #[arg(long, global = true)]
    no_notes: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train a model, optionally resuming from a checkpoint
    Train(RunArgs),
    /// Evaluate a checkpoint on the validation split
    Val(RunArgs),
}

impl Commands {
    fn parts(&self) -> (&'static str, &RunArgs) {
        match self {
            Commands::Train(args) => ("train", args),
            Commands::Val(args) => ("val", args),
        }
    }
}

/// Per-run overrides. Only flags that were given take part in the merge.
#[derive(clap::Args, Serialize, Debug, Default)]
pub(crate) struct RunArgs {
    /// Checkpoint to resume from
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    resume: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    num_epochs: Option<usize>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    batch_size: Option<usize>,

    /// Base learning rate
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    lr: Option<f64>,

    /// Learning-rate policy: step, poly or const
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    lr_mode: Option<String>,

    /// Step size of the step policy, in epochs
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<usize>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    weight_decay: Option<f64>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    momentum: Option<f64>,

    /// Ignore the epoch counter and best score of the resumed checkpoint
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    anew: bool,

    /// Restore optimizer state when resuming
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    load_optim: bool,

    /// Store optimizer state in checkpoints
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    save_optim: bool,

    /// Write predicted change maps during validation
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    save_on: bool,

    /// Sub-directory for predicted change maps (implies --save-on)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    out_dir: Option<String>,

    /// Metric names, first one selects the best model (e.g. F1Score,OA)
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<Vec<String>>,

    /// Keep a history checkpoint every N epochs
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    track_intvl: Option<usize>,

    /// cpu, cuda or cuda:<n>
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<String>,

    /// Network architecture (siamdiff, ef)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    criterion: Option<String>,

    /// Optimizer (SGD, Adam)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    optimizer: Option<String>,

    /// Data source (folder, synthetic)
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    dataset: Option<String>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    crop_size: Option<usize>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    repeats: Option<usize>,

    /// Validation batches per epoch while training
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    val_iters: Option<usize>,

    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,

    /// Experiment root directory
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    exp_dir: Option<PathBuf>,

    /// Experiment name below the root directory
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    tag: Option<String>,

    /// Suffix appended to checkpoint and output file names
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    suffix: Option<String>,

    /// Do not append the suffix to output images
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    suffix_off: bool,

    /// Do not write the JSON log file
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    log_off: bool,
}

/// Overrides merged on top of file and environment configuration.
#[derive(Serialize, Debug)]
pub(crate) struct Overrides<'a> {
    cmd: &'a str,
    #[serde(flatten)]
    args: &'a RunArgs,
}

/// User-level configuration used when `--config` is not given.
fn default_config_file() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "cdtrain", "cdtrain")
        .map(|d| d.config_dir().join("config.toml"))
        .filter(|path| path.is_file())
}

/// Human-readable stderr output plus, unless disabled, a daily JSON log file
/// in the experiment's log directory.
fn init_tracing(
    cli: &Cli,
    config: &RunConfig,
    layout: &ExperimentLayout,
) -> anyhow::Result<Option<WorkerGuard>> {
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

    let (json_layer, guard) = if config.log_off {
        (None, None)
    } else {
        let log_dir = layout.log_dir();
        std::fs::create_dir_all(&log_dir)?;
        let file_appender = tracing_appender::rolling::daily(&log_dir, "cdtrain.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_filter(EnvFilter::new("debug"));
        (Some(layer), Some(guard))
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    Ok(guard)
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let (cmd, args) = cli.command.parts();

    let config_file = cli.config.clone().or_else(default_config_file);
    let config = cdtrain_core::load_config(config_file.as_deref(), &Overrides { cmd, args })
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let layout = ExperimentLayout::from_config(&config);
    let _guard = init_tracing(&cli, &config, &layout)?;
    if let Some(path) = &config_file {
        tracing::info!(config = %path.display(), "configuration file loaded");
    }

    commands::run(config, layout, cli.no_notes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_parses_train_overrides() {
        let cli = Cli::try_parse_from([
            "cdtrain",
            "train",
            "--num-epochs",
            "3",
            "--metrics",
            "F1Score,OA",
            "--anew",
            "--no-notes",
        ])
        .unwrap();
        assert!(cli.no_notes);
        let (cmd, args) = cli.command.parts();
        assert_eq!(cmd, "train");
        assert_eq!(args.num_epochs, Some(3));
        assert_eq!(
            args.metrics,
            Some(vec!["F1Score".to_string(), "OA".to_string()])
        );
        assert!(args.anew);
    }

    #[test]
    fn test_only_given_flags_are_serialized() {
        let args = RunArgs {
            lr: Some(0.01),
            save_on: true,
            ..Default::default()
        };
        let value = serde_json::to_value(Overrides {
            cmd: "val",
            args: &args,
        })
        .unwrap();
        assert_eq!(
            value,
            serde_json::json!({"cmd": "val", "lr": 0.01, "save_on": true})
        );
    }

    #[test]
    fn test_overrides_win_over_defaults() {
        let args = RunArgs {
            batch_size: Some(4),
            lr_mode: Some("poly".into()),
            ..Default::default()
        };
        let config = cdtrain_core::load_config(None, &Overrides { cmd: "val", args: &args }).unwrap();
        assert!(!config.is_training());
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.lr_mode, "poly");
        assert_eq!(config.num_epochs, RunConfig::default().num_epochs);
    }

    #[test]
    fn test_unknown_subcommand_is_rejected() {
        assert!(Cli::try_parse_from(["cdtrain", "predict"]).is_err());
    }
}
