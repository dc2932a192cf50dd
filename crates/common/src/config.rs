//! Run configuration for a benchmark run.
//!
//! A run is configured in two layers: the user's explicit overrides (CLI
//! flags) and the defaults registered for the chosen model. [`resolve_config`]
//! merges them into an immutable [`RunConfig`] that is built once per run and
//! passed by reference to every worker.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::arch::ModelArch;
use crate::error::ConfigurationError;

// ── Resolved config ─────────────────────────────────────────────────────────

/// Fully-resolved settings for one run.
///
/// Serialised as JSON next to the summary so a run can be reproduced.
/// Missing optional fields fall back to their `#[serde(default)]` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelArch,

    // ── Optimisation ────────────────────────────────────────────────────────
    /// Per-worker training batch size.
    pub batch_size: usize,
    pub test_set_batch_size: usize,
    pub num_epochs: usize,
    pub lr: f64,
    pub momentum: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Minimum validation accuracy (percent) for the run to count as passing.
    pub target_accuracy: f64,
    /// Dynamic loss scaling around the backward pass.
    #[serde(default = "default_true")]
    pub amp: bool,

    // ── LR schedule ─────────────────────────────────────────────────────────
    #[serde(default)]
    pub lr_scheduler_type: Option<String>,
    #[serde(default)]
    pub lr_scheduler_divisor: Option<f64>,
    #[serde(default)]
    pub lr_scheduler_divide_every_n_epochs: Option<usize>,
    #[serde(default)]
    pub lr_scheduler_warmup_epochs: Option<f64>,

    // ── Data ────────────────────────────────────────────────────────────────
    /// Size of the synthetic training set (roughly ImageNet).
    #[serde(default = "default_train_samples")]
    pub train_samples: usize,
    #[serde(default = "default_test_samples")]
    pub test_samples: usize,

    // ── Runtime & reporting ─────────────────────────────────────────────────
    /// Number of worker replicas.
    #[serde(default = "default_num_cores")]
    pub num_cores: usize,
    #[serde(default = "default_log_steps")]
    pub log_steps: usize,
    #[serde(default)]
    pub logdir: Option<PathBuf>,
    #[serde(default)]
    pub validate: bool,
    #[serde(default)]
    pub fine_grained_metrics: bool,
    #[serde(default)]
    pub metrics_debug: bool,
}

fn default_weight_decay() -> f64 {
    1e-4
}
fn default_true() -> bool {
    true
}
fn default_train_samples() -> usize {
    1_200_000
}
fn default_test_samples() -> usize {
    50_000
}
fn default_num_cores() -> usize {
    1
}
fn default_log_steps() -> usize {
    20
}

impl RunConfig {
    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// Training batches each worker sees per epoch.
    pub fn steps_per_epoch(&self) -> usize {
        self.train_samples / (self.batch_size * self.num_cores.max(1))
    }

    /// Validation batches each worker sees per pass.
    ///
    /// Divides by the training batch size, not the test one, matching how
    /// the synthetic validation set has always been sized.
    pub fn test_steps(&self) -> usize {
        self.test_samples / self.batch_size / self.num_cores.max(1)
    }
}

// ── Layers ──────────────────────────────────────────────────────────────────

/// Values explicitly given by the user. `None` means "not given".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub model: Option<ModelArch>,
    pub batch_size: Option<usize>,
    pub test_set_batch_size: Option<usize>,
    pub num_epochs: Option<usize>,
    pub lr: Option<f64>,
    pub momentum: Option<f64>,
    pub weight_decay: Option<f64>,
    pub target_accuracy: Option<f64>,
    pub lr_scheduler_type: Option<String>,
    pub lr_scheduler_divisor: Option<f64>,
    pub lr_scheduler_divide_every_n_epochs: Option<usize>,
    pub lr_scheduler_warmup_epochs: Option<f64>,
    pub train_samples: Option<usize>,
    pub test_samples: Option<usize>,
    pub num_cores: Option<usize>,
    pub log_steps: Option<usize>,
    pub logdir: Option<PathBuf>,
    pub validate: bool,
    pub fine_grained_metrics: bool,
    pub metrics_debug: bool,
    pub no_amp: bool,
}

impl ConfigOverrides {
    /// The model the user asked for, or the default architecture.
    pub fn model(&self) -> ModelArch {
        self.model.unwrap_or_default()
    }
}

/// Defaults registered for a model. Fields left `None` must come from the user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelDefaults {
    pub batch_size: Option<usize>,
    pub test_set_batch_size: Option<usize>,
    pub num_epochs: Option<usize>,
    pub lr: Option<f64>,
    pub momentum: Option<f64>,
    pub target_accuracy: Option<f64>,
    pub lr_scheduler_type: Option<String>,
    pub lr_scheduler_divisor: Option<f64>,
    pub lr_scheduler_divide_every_n_epochs: Option<usize>,
}

/// Defaults shared by every model without a specific entry.
pub fn default_kwargs() -> ModelDefaults {
    ModelDefaults {
        batch_size: Some(128),
        test_set_batch_size: Some(64),
        num_epochs: Some(18),
        lr: Some(0.1),
        momentum: Some(0.9),
        target_accuracy: Some(0.0),
        ..Default::default()
    }
}

/// Defaults for `model`: the shared defaults, with model-specific entries on top.
pub fn defaults_for(model: ModelArch) -> ModelDefaults {
    match model {
        ModelArch::ResNet50 => ModelDefaults {
            lr: Some(0.5),
            lr_scheduler_type: Some("warmup-step-decay".to_string()),
            lr_scheduler_divisor: Some(5.0),
            lr_scheduler_divide_every_n_epochs: Some(20),
            ..default_kwargs()
        },
        _ => default_kwargs(),
    }
}

/// Merge user overrides over model defaults into a new [`RunConfig`].
///
/// Neither input is modified. A setting that is neither given by the user
/// nor defaulted for the model is a [`ConfigurationError::Missing`].
pub fn resolve_config(
    user: &ConfigOverrides,
    defaults: &ModelDefaults,
) -> Result<RunConfig, ConfigurationError> {
    fn pick<T: Clone>(
        user: &Option<T>,
        default: &Option<T>,
        field: &'static str,
    ) -> Result<T, ConfigurationError> {
        user.clone()
            .or_else(|| default.clone())
            .ok_or(ConfigurationError::Missing(field))
    }

    let config = RunConfig {
        model: user.model(),
        batch_size: pick(&user.batch_size, &defaults.batch_size, "batch_size")?,
        test_set_batch_size: pick(
            &user.test_set_batch_size,
            &defaults.test_set_batch_size,
            "test_set_batch_size",
        )?,
        num_epochs: pick(&user.num_epochs, &defaults.num_epochs, "num_epochs")?,
        lr: pick(&user.lr, &defaults.lr, "lr")?,
        momentum: pick(&user.momentum, &defaults.momentum, "momentum")?,
        weight_decay: user.weight_decay.unwrap_or_else(default_weight_decay),
        target_accuracy: pick(
            &user.target_accuracy,
            &defaults.target_accuracy,
            "target_accuracy",
        )?,
        amp: !user.no_amp,
        lr_scheduler_type: user
            .lr_scheduler_type
            .clone()
            .or_else(|| defaults.lr_scheduler_type.clone()),
        lr_scheduler_divisor: user.lr_scheduler_divisor.or(defaults.lr_scheduler_divisor),
        lr_scheduler_divide_every_n_epochs: user
            .lr_scheduler_divide_every_n_epochs
            .or(defaults.lr_scheduler_divide_every_n_epochs),
        lr_scheduler_warmup_epochs: user.lr_scheduler_warmup_epochs,
        train_samples: user.train_samples.unwrap_or_else(default_train_samples),
        test_samples: user.test_samples.unwrap_or_else(default_test_samples),
        num_cores: user.num_cores.unwrap_or_else(default_num_cores),
        log_steps: user.log_steps.unwrap_or_else(default_log_steps),
        logdir: user.logdir.clone(),
        validate: user.validate,
        fine_grained_metrics: user.fine_grained_metrics,
        metrics_debug: user.metrics_debug,
    };

    for (field, value) in [
        ("batch_size", config.batch_size),
        ("test_set_batch_size", config.test_set_batch_size),
        ("num_cores", config.num_cores),
        ("log_steps", config.log_steps),
    ] {
        if value == 0 {
            return Err(ConfigurationError::NonPositive {
                field,
                value: 0.0,
            });
        }
    }
    Ok(config)
}

// ── Tests ───────────────────────────────────────────────────────────────────
