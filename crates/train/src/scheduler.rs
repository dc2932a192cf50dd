//! Learning-rate schedules driven by the global training step.
//!
//! [`wrap_optimizer_with_scheduler`] validates a [`SchedulerConfig`], captures
//! the optimizer's per-group base rates and returns an [`LrScheduler`] (or
//! `None` when no schedule is configured). Call [`LrScheduler::step`] once per
//! optimiser step; the rate written back is a pure function of the step
//! count and the config, never of the optimizer's current rate.

use std::f64::consts::PI;
use std::str::FromStr;

use clsbench_common::{ConfigurationError, RunConfig};

use crate::metrics::SharedSink;

/// Summary tag under which the rate of parameter group 0 is recorded.
pub const LR_TAG: &str = "LearningRate";

/// Warmup length used when the warmup schedule is selected without one.
pub const DEFAULT_WARMUP_EPOCHS: f64 = 0.9;

// ── Optimizer seam ──────────────────────────────────────────────────────────

/// An optimizer whose parameter groups each carry a writable learning rate.
pub trait ParamGroups {
    fn num_groups(&self) -> usize;
    fn group_lr(&self, group: usize) -> f64;
    fn set_group_lr(&mut self, group: usize, lr: f64);
}

// ── Config ──────────────────────────────────────────────────────────────────

/// Decay policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerKind {
    /// Divide by `divisor` every `divide_every_n_epochs` epochs.
    StepDecay,
    /// Linear warmup over `warmup_epochs`, then step decay.
    WarmupStepDecay,
    /// Half-cosine from the base rate to zero over `total_epochs`.
    Cosine,
}

impl SchedulerKind {
    /// `None` for an unset or `"none"` kind.
    pub fn parse(kind: Option<&str>) -> Result<Option<Self>, ConfigurationError> {
        match kind.map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) if s.eq_ignore_ascii_case("none") => Ok(None),
            Some(s) => s.parse().map(Some),
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "step-decay" | "step" => Ok(Self::StepDecay),
            "warmup-step-decay" | "WarmupAndExponentialDecayScheduler" => {
                Ok(Self::WarmupStepDecay)
            }
            "cosine" => Ok(Self::Cosine),
            other => Err(ConfigurationError::UnknownScheduler(other.to_string())),
        }
    }
}

/// Immutable scheduler inputs, as given on the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerConfig {
    pub kind: Option<String>,
    pub divisor: Option<f64>,
    pub divide_every_n_epochs: Option<usize>,
    pub steps_per_epoch: usize,
    pub warmup_epochs: Option<f64>,
    pub total_epochs: Option<usize>,
}

impl SchedulerConfig {
    /// Scheduler settings of a resolved run.
    pub fn from_run(config: &RunConfig, steps_per_epoch: usize) -> Self {
        Self {
            kind: config.lr_scheduler_type.clone(),
            divisor: config.lr_scheduler_divisor,
            divide_every_n_epochs: config.lr_scheduler_divide_every_n_epochs,
            steps_per_epoch,
            warmup_epochs: config.lr_scheduler_warmup_epochs,
            total_epochs: Some(config.num_epochs),
        }
    }
}

/// Validated policy with every parameter its kind needs.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Policy {
    StepDecay {
        divisor: f64,
        every: usize,
    },
    WarmupStepDecay {
        warmup_steps: f64,
        divisor: f64,
        every: usize,
    },
    Cosine {
        total_steps: usize,
    },
}

fn positive_f64(value: Option<f64>, field: &'static str) -> Result<f64, ConfigurationError> {
    let value = value.ok_or(ConfigurationError::Missing(field))?;
    if value > 0.0 && value.is_finite() {
        Ok(value)
    } else {
        Err(ConfigurationError::NonPositive { field, value })
    }
}

/// Decay divisors must shrink the rate.
fn decay_divisor(value: Option<f64>) -> Result<f64, ConfigurationError> {
    let field = "lr_scheduler_divisor";
    let value = positive_f64(value, field)?;
    if value > 1.0 {
        Ok(value)
    } else {
        Err(ConfigurationError::NotAbove {
            field,
            value,
            bound: 1.0,
        })
    }
}

fn positive_usize(value: Option<usize>, field: &'static str) -> Result<usize, ConfigurationError> {
    match value.ok_or(ConfigurationError::Missing(field))? {
        0 => Err(ConfigurationError::NonPositive { field, value: 0.0 }),
        v => Ok(v),
    }
}

impl Policy {
    fn new(kind: SchedulerKind, config: &SchedulerConfig) -> Result<Self, ConfigurationError> {
        let steps_per_epoch = positive_usize(Some(config.steps_per_epoch), "num_steps_per_epoch")?;
        let policy = match kind {
            SchedulerKind::StepDecay => Self::StepDecay {
                divisor: decay_divisor(config.divisor)?,
                every: positive_usize(
                    config.divide_every_n_epochs,
                    "lr_scheduler_divide_every_n_epochs",
                )?,
            },
            SchedulerKind::WarmupStepDecay => {
                let warmup_epochs = positive_f64(
                    Some(config.warmup_epochs.unwrap_or(DEFAULT_WARMUP_EPOCHS)),
                    "lr_scheduler_warmup_epochs",
                )?;
                Self::WarmupStepDecay {
                    warmup_steps: warmup_epochs * steps_per_epoch as f64,
                    divisor: decay_divisor(config.divisor)?,
                    every: positive_usize(
                        config.divide_every_n_epochs,
                        "lr_scheduler_divide_every_n_epochs",
                    )?,
                }
            }
            SchedulerKind::Cosine => Self::Cosine {
                total_steps: positive_usize(config.total_epochs, "num_epochs")? * steps_per_epoch,
            },
        };
        Ok(policy)
    }

    /// Rate for a group with base rate `base` at `step`.
    fn rate(&self, base: f64, step: usize, steps_per_epoch: usize) -> f64 {
        let step_decay = |divisor: f64, every: usize| {
            let epoch = step / steps_per_epoch;
            let decay_count = epoch / every;
            base / divisor.powf(decay_count as f64)
        };
        match *self {
            Self::StepDecay { divisor, every } => step_decay(divisor, every),
            Self::WarmupStepDecay {
                warmup_steps,
                divisor,
                every,
            } => {
                if (step as f64) < warmup_steps {
                    base * ((step as f64 + 1.0) / warmup_steps).min(1.0)
                } else {
                    step_decay(divisor, every)
                }
            }
            Self::Cosine { total_steps } => {
                let progress = (step as f64 / total_steps as f64).min(1.0);
                base * 0.5 * (1.0 + (PI * progress).cos())
            }
        }
    }
}

// ── LR Scheduler ────────────────────────────────────────────────────────────

/// Per-step learning-rate schedule over every parameter group of an optimizer.
///
/// One instance per training run and per worker. Workers stay in agreement
/// only while they call [`step`](Self::step) the same number of times.
pub struct LrScheduler {
    policy: Policy,
    steps_per_epoch: usize,
    base_lrs: Vec<f64>,
    current_lrs: Vec<f64>,
    global_step: usize,
    sink: Option<SharedSink>,
}

/// Build a scheduler for `optimizer`, or `None` if no schedule is configured.
///
/// With a schedule, the step-0 rates are written into the optimizer right
/// away and, if `sink` is given, the first group's rate is recorded.
/// Without one, the optimizer is left untouched and keeps its fixed rate.
pub fn wrap_optimizer_with_scheduler<O: ParamGroups + ?Sized>(
    optimizer: &mut O,
    config: &SchedulerConfig,
    sink: Option<SharedSink>,
) -> Result<Option<LrScheduler>, ConfigurationError> {
    let Some(kind) = SchedulerKind::parse(config.kind.as_deref())? else {
        return Ok(None);
    };
    let policy = Policy::new(kind, config)?;
    let base_lrs: Vec<f64> = (0..optimizer.num_groups())
        .map(|g| optimizer.group_lr(g))
        .collect();

    let mut scheduler = LrScheduler {
        policy,
        steps_per_epoch: config.steps_per_epoch,
        current_lrs: base_lrs.clone(),
        base_lrs,
        global_step: 0,
        sink,
    };
    scheduler.apply(optimizer);
    tracing::debug!(?kind, base_lrs = ?scheduler.base_lrs, "lr scheduler attached");
    Ok(Some(scheduler))
}

impl LrScheduler {
    /// Advance one optimiser step and write the new rates into `optimizer`.
    ///
    /// Call exactly once per processed batch, after the optimizer update.
    /// Not idempotent: a second call for the same batch advances the
    /// schedule again.
    pub fn step<O: ParamGroups + ?Sized>(&mut self, optimizer: &mut O) {
        self.global_step += 1;
        self.apply(optimizer);
    }

    fn apply<O: ParamGroups + ?Sized>(&mut self, optimizer: &mut O) {
        for (g, (base, current)) in self
            .base_lrs
            .iter()
            .zip(self.current_lrs.iter_mut())
            .enumerate()
            .take(optimizer.num_groups())
        {
            *current = self.policy.rate(*base, self.global_step, self.steps_per_epoch);
            optimizer.set_group_lr(g, *current);
        }
        if let (Some(sink), Some(&lr)) = (&self.sink, self.current_lrs.first()) {
            sink.lock().add_scalar(LR_TAG, lr, self.global_step);
        }
    }

    /// Rate of parameter group 0.
    pub fn current_lr(&self) -> f64 {
        self.current_lrs.first().copied().unwrap_or(0.0)
    }

    pub fn current_lrs(&self) -> &[f64] {
        &self.current_lrs
    }

    pub fn base_lrs(&self) -> &[f64] {
        &self.base_lrs
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
