//! CLI for the image-classification training benchmark.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use clsbench_common::{defaults_for, resolve_config, ConfigOverrides, ModelArch, RunConfig};
use clsbench_train::{below_target, run_worker, spawn, RunSummary, SingleProcess};

/// Exit status when validation accuracy misses `--target-accuracy`.
const EXIT_BELOW_TARGET: u8 = 21;

#[derive(Parser, Debug)]
#[command(
    name = "clsbench-train",
    about = "Train an image classifier on synthetic data and report throughput"
)]
struct Args {
    /// Architecture, e.g. resnet50, vgg16_bn, squeezenet1_1.
    #[arg(long)]
    model: Option<ModelArch>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    test_set_batch_size: Option<usize>,
    #[arg(long)]
    num_epochs: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    momentum: Option<f64>,
    #[arg(long)]
    weight_decay: Option<f64>,
    /// Minimum top-1 accuracy (percent) for a zero exit status.
    #[arg(long)]
    target_accuracy: Option<f64>,
    /// none, step-decay, warmup-step-decay or cosine.
    #[arg(long)]
    lr_scheduler_type: Option<String>,
    #[arg(long)]
    lr_scheduler_divisor: Option<f64>,
    #[arg(long)]
    lr_scheduler_divide_every_n_epochs: Option<usize>,
    #[arg(long)]
    lr_scheduler_warmup_epochs: Option<f64>,
    /// Synthetic training set size.
    #[arg(long)]
    train_samples: Option<usize>,
    #[arg(long)]
    test_samples: Option<usize>,
    /// Worker replicas, one thread each.
    #[arg(long)]
    num_cores: Option<usize>,
    #[arg(long)]
    log_steps: Option<usize>,
    /// Directory for summary.csv, run_config.json and run_summary.json.
    #[arg(long)]
    logdir: Option<PathBuf>,
    #[arg(long)]
    validate: bool,
    #[arg(long)]
    fine_grained_metrics: bool,
    #[arg(long)]
    metrics_debug: bool,
    /// Disable dynamic loss scaling.
    #[arg(long)]
    no_amp: bool,
}

impl Args {
    fn overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            model: self.model,
            batch_size: self.batch_size,
            test_set_batch_size: self.test_set_batch_size,
            num_epochs: self.num_epochs,
            lr: self.lr,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
            target_accuracy: self.target_accuracy,
            lr_scheduler_type: self.lr_scheduler_type,
            lr_scheduler_divisor: self.lr_scheduler_divisor,
            lr_scheduler_divide_every_n_epochs: self.lr_scheduler_divide_every_n_epochs,
            lr_scheduler_warmup_epochs: self.lr_scheduler_warmup_epochs,
            train_samples: self.train_samples,
            test_samples: self.test_samples,
            num_cores: self.num_cores,
            log_steps: self.log_steps,
            logdir: self.logdir,
            validate: self.validate,
            fine_grained_metrics: self.fine_grained_metrics,
            metrics_debug: self.metrics_debug,
            no_amp: self.no_amp,
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let overrides = Args::parse().overrides();
    let config = resolve_config(&overrides, &defaults_for(overrides.model()))?;
    tracing::info!(?config, "resolved run config");

    let summary = if config.num_cores <= 1 {
        run_worker(&config, SingleProcess)?
    } else {
        let mut summaries = spawn(config.num_cores, |member| run_worker(&config, member))?;
        summaries.swap_remove(0)
    };
    write_summary(&config, &summary)?;

    if below_target(&summary, &config) {
        tracing::error!(
            accuracy = ?summary.max_accuracy,
            target = format!("{:.2}", config.target_accuracy),
            "accuracy below target"
        );
        return Ok(ExitCode::from(EXIT_BELOW_TARGET));
    }
    Ok(ExitCode::SUCCESS)
}

fn write_summary(config: &RunConfig, summary: &RunSummary) -> anyhow::Result<()> {
    if let Some(logdir) = &config.logdir {
        let path = logdir.join("run_summary.json");
        std::fs::write(&path, serde_json::to_string_pretty(summary)?)?;
        tracing::info!(path = %path.display(), "run summary saved");
    }
    Ok(())
}
