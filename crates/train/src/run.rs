//! One worker's whole run: data, model, optimiser, schedule and epoch loop.

use std::sync::Arc;

use candle_core::{DType, Device, Var};
use candle_nn::{ModuleT, Optimizer, VarBuilder, VarMap};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use clsbench_common::{RunConfig, SyntheticImages, NUM_CLASSES};
use clsbench_core::Classifier;

use crate::mesh::Collective;
use crate::metrics::{write_to_summary, CsvSummaryWriter, SharedSink};
use crate::optim::{ParamsSgd, Sgd};
use crate::scaler::GradScaler;
use crate::scheduler::{wrap_optimizer_with_scheduler, SchedulerConfig};
use crate::trainer::{Trainer, TrainerConfig};

pub const ACCURACY_TAG: &str = "Accuracy/test";
pub const RUN_CONFIG_FILE: &str = "run_config.json";

/// Outcome of a worker's run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Best validation accuracy (percent); `None` when validation is off.
    pub max_accuracy: Option<f64>,
    pub last_accuracy: Option<f64>,
    pub global_step: usize,
    pub skipped_steps: usize,
}

/// Whether the run missed `config.target_accuracy`.
///
/// A run without an accuracy, or with an accuracy of exactly zero, is never
/// judged against the target.
pub fn below_target(summary: &RunSummary, config: &RunConfig) -> bool {
    matches!(summary.max_accuracy, Some(a) if a != 0.0 && a < config.target_accuracy)
}

/// Train `config.model` on synthetic ImageNet-sized data.
pub fn run_worker<C: Collective>(config: &RunConfig, collective: C) -> anyhow::Result<RunSummary> {
    let device = Device::cuda_if_available(0)?;
    let arch = config.model;
    run_with(config, collective, &device, arch.img_dim(), |vb| {
        Classifier::new(arch, NUM_CLASSES, vb)
    })
}

/// [`run_worker`] with an explicit device, input size and model builder.
pub fn run_with<C, M, F>(
    config: &RunConfig,
    collective: C,
    device: &Device,
    img_dim: usize,
    build: F,
) -> anyhow::Result<RunSummary>
where
    C: Collective,
    M: ModuleT,
    F: FnOnce(VarBuilder) -> candle_core::Result<M>,
{
    let master = collective.is_master();
    let steps_per_epoch = config.steps_per_epoch();
    let train_loader =
        SyntheticImages::zeros(config.batch_size, img_dim, steps_per_epoch, device)?;
    let test_loader = SyntheticImages::zeros(
        config.test_set_batch_size,
        img_dim,
        config.test_steps(),
        device,
    )?;
    if master {
        tracing::info!(
            model = %config.model,
            world_size = collective.world_size(),
            steps_per_epoch,
            test_steps = config.test_steps(),
            "starting run"
        );
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = build(vb)?;
    let vars = sorted_vars(&varmap)?;
    sync_replicas(&collective, &vars)?;

    let writer: Option<SharedSink> = match (&config.logdir, master) {
        (Some(logdir), true) => {
            let writer = CsvSummaryWriter::create(logdir)?;
            config.save(&logdir.join(RUN_CONFIG_FILE))?;
            tracing::info!(path = %writer.path().display(), "writing summaries");
            let shared: SharedSink = Arc::new(Mutex::new(writer));
            Some(shared)
        }
        _ => None,
    };

    let mut optimizer = Sgd::new(
        vars.clone(),
        ParamsSgd {
            lr: config.lr,
            momentum: config.momentum,
            weight_decay: config.weight_decay,
            nesterov: false,
        },
    )?;
    let scheduler = wrap_optimizer_with_scheduler(
        &mut optimizer,
        &SchedulerConfig::from_run(config, steps_per_epoch),
        writer.clone(),
    )?;

    let mut trainer = Trainer::new(
        model,
        vars,
        optimizer,
        collective,
        TrainerConfig {
            batch_size: config.batch_size,
            log_steps: config.log_steps,
            steps_per_epoch,
            fine_grained_metrics: config.fine_grained_metrics,
        },
    )
    .with_scheduler(scheduler)
    .with_scaler(GradScaler::new(config.amp))
    .with_writer(writer.clone());

    let mut max_accuracy: Option<f64> = None;
    let mut last_accuracy = None;
    for epoch in 1..=config.num_epochs {
        if master {
            tracing::info!(epoch, "epoch train begin");
        }
        let report = trainer.train_epoch(&train_loader, epoch)?;
        if master {
            tracing::info!(
                epoch,
                steps = report.steps,
                loss = format!("{:.5}", report.last_loss),
                global_rate = format!("{:.2}", report.global_rate),
                "epoch train end"
            );
        }

        if config.validate {
            let accuracy = trainer.evaluate(&test_loader, epoch)?;
            if master {
                tracing::info!(epoch, accuracy = format!("{accuracy:.2}"), "epoch test end");
                write_to_summary(writer.as_ref(), epoch, &[(ACCURACY_TAG, accuracy)]);
            }
            max_accuracy = Some(max_accuracy.map_or(accuracy, |m: f64| m.max(accuracy)));
            last_accuracy = Some(accuracy);
        }

        if config.metrics_debug && master {
            tracing::info!(
                epoch,
                loss_scale = trainer.scaler().scale_factor(),
                skipped_steps = report.skipped_steps,
                lr = trainer
                    .scheduler()
                    .map(|s| s.current_lr())
                    .unwrap_or_else(|| trainer.optimizer().learning_rate()),
                "metrics report"
            );
        }
        if let Some(w) = &writer {
            w.lock().flush();
        }
    }

    if let (true, Some(max_accuracy)) = (master, max_accuracy) {
        tracing::info!(max_accuracy = format!("{max_accuracy:.2}"), "max accuracy");
    }
    Ok(RunSummary {
        max_accuracy,
        last_accuracy,
        global_step: trainer.global_step(),
        skipped_steps: trainer.scaler().skipped_steps(),
    })
}

/// Variables ordered by name, identical on every worker.
fn sorted_vars(varmap: &VarMap) -> anyhow::Result<Vec<Var>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
    let mut named: Vec<(&String, &Var)> = data.iter().collect();
    named.sort_by(|a, b| a.0.cmp(b.0));
    let vars = named.into_iter().map(|(_, v)| v.clone()).collect();
    Ok(vars)
}

/// Overwrite every replica's weights with the master's.
fn sync_replicas<C: Collective>(collective: &C, vars: &[Var]) -> candle_core::Result<()> {
    if collective.world_size() <= 1 {
        return Ok(());
    }
    let local = vars.iter().map(|v| v.as_tensor().clone()).collect();
    let master = collective.broadcast(local)?;
    if !collective.is_master() {
        for (var, t) in vars.iter().zip(master) {
            var.set(&t)?;
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
