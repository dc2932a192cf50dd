//! End-to-end runs with a tiny linear classifier on CPU.

use candle_core::{Device, Module, Result, Tensor};
use candle_nn::{linear, Linear, ModuleT, VarBuilder};

use clsbench_common::{defaults_for, resolve_config, ConfigOverrides, ModelArch, RunConfig};
use clsbench_train::{below_target, run_with, spawn};

const IMG_DIM: usize = 4;
const CLASSES: usize = 10;

struct Tiny(Linear);

impl ModuleT for Tiny {
    fn forward_t(&self, x: &Tensor, _train: bool) -> Result<Tensor> {
        self.0.forward(&x.flatten_from(1)?)
    }
}

fn tiny(vb: VarBuilder) -> Result<Tiny> {
    Ok(Tiny(linear(3 * IMG_DIM * IMG_DIM, CLASSES, vb)?))
}

fn config(customize: impl FnOnce(&mut ConfigOverrides)) -> RunConfig {
    let mut overrides = ConfigOverrides {
        model: Some(ModelArch::ResNet18),
        batch_size: Some(4),
        test_set_batch_size: Some(4),
        num_epochs: Some(2),
        lr: Some(0.5),
        momentum: Some(0.0),
        train_samples: Some(32),
        test_samples: Some(16),
        log_steps: Some(4),
        validate: true,
        ..Default::default()
    };
    customize(&mut overrides);
    resolve_config(&overrides, &defaults_for(overrides.model())).unwrap()
}

/// `(tag, step, value)` rows of a summary file.
fn read_summary(path: &std::path::Path) -> Vec<(String, usize, f64)> {
    let text = std::fs::read_to_string(path).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("tag,step,value"));
    lines
        .map(|line| {
            let mut cols = line.split(',');
            let tag = cols.next().unwrap().to_string();
            let step = cols.next().unwrap().parse().unwrap();
            let value = cols.next().unwrap().parse().unwrap();
            (tag, step, value)
        })
        .collect()
}

#[test]
fn single_worker_run_writes_schedule_and_accuracy() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(|o| {
        o.lr_scheduler_type = Some("step-decay".into());
        o.lr_scheduler_divisor = Some(10.0);
        o.lr_scheduler_divide_every_n_epochs = Some(1);
        o.logdir = Some(dir.path().to_path_buf());
    });
    assert_eq!(config.steps_per_epoch(), 8);
    assert_eq!(config.test_steps(), 4);

    let summary = run_with(
        &config,
        clsbench_train::SingleProcess,
        &Device::Cpu,
        IMG_DIM,
        tiny,
    )
    .unwrap();
    assert_eq!(summary.global_step, 16);
    assert_eq!(summary.skipped_steps, 0);
    assert_eq!(summary.max_accuracy, Some(100.0));
    assert_eq!(summary.last_accuracy, Some(100.0));

    let rows = read_summary(&dir.path().join("summary.csv"));
    let lr: Vec<_> = rows.iter().filter(|r| r.0 == "LearningRate").collect();
    // Step 0 at construction, then one per batch.
    assert_eq!(lr.len(), 17);
    assert_eq!(lr[0].1, 0);
    assert!((lr[0].2 - 0.5).abs() < 1e-12);
    assert!((lr[7].2 - 0.5).abs() < 1e-12);
    assert!((lr[8].2 - 0.05).abs() < 1e-12);
    assert!((lr[16].2 - 0.005).abs() < 1e-12);

    let accuracy: Vec<_> = rows.iter().filter(|r| r.0 == "Accuracy/test").collect();
    assert_eq!(accuracy.len(), 2);
    assert_eq!((accuracy[0].1, accuracy[1].1), (1, 2));

    // Logged at steps 0 and 4 of each epoch.
    let rate = rows.iter().filter(|r| r.0 == "examples/sec").count();
    assert_eq!(rate, 4);

    let saved = RunConfig::load(&dir.path().join("run_config.json")).unwrap();
    assert_eq!(saved, config);
}

#[test]
fn run_without_schedule_keeps_fixed_rate() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(|o| {
        o.lr_scheduler_type = Some("none".into());
        o.logdir = Some(dir.path().to_path_buf());
        o.no_amp = true;
        o.validate = false;
        o.target_accuracy = Some(75.0);
    });
    let summary = run_with(
        &config,
        clsbench_train::SingleProcess,
        &Device::Cpu,
        IMG_DIM,
        tiny,
    )
    .unwrap();
    assert_eq!(summary.global_step, 16);
    assert_eq!(summary.max_accuracy, None);
    assert!(!below_target(&summary, &config));

    let rows = read_summary(&dir.path().join("summary.csv"));
    assert!(rows.iter().all(|r| r.0 != "LearningRate"));
    assert!(rows.iter().all(|r| r.0 != "Accuracy/test"));
}

#[test]
fn workers_stay_in_lock_step() {
    let config = config(|o| {
        o.num_cores = Some(2);
        o.train_samples = Some(64);
        o.lr_scheduler_type = Some("cosine".into());
    });
    assert_eq!(config.steps_per_epoch(), 8);

    let summaries = spawn(config.num_cores, |member| {
        run_with(&config, member, &Device::Cpu, IMG_DIM, tiny)
    })
    .unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0], summaries[1]);
    assert_eq!(summaries[0].global_step, 16);
    assert_eq!(summaries[0].max_accuracy, Some(100.0));
}

#[test]
fn invalid_schedule_fails_the_run() {
    let config = config(|o| {
        o.lr_scheduler_type = Some("step-decay".into());
        o.lr_scheduler_divisor = Some(0.0);
        o.lr_scheduler_divide_every_n_epochs = Some(1);
    });
    let err = run_with(
        &config,
        clsbench_train::SingleProcess,
        &Device::Cpu,
        IMG_DIM,
        tiny,
    )
    .unwrap_err();
    assert!(err.to_string().contains("lr_scheduler_divisor"), "{err}");
}
