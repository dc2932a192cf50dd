//! Trainer: one worker's training and validation loop.
//!
//! Per batch: forward, cross-entropy, backward of the scaled loss, gradient
//! all-reduce across the mesh, loss-scaler-guarded SGD step, then exactly one
//! learning-rate schedule step. Gradients are rebuilt by every backward pass,
//! so nothing needs zeroing between batches.

use std::time::Instant;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use candle_nn::{loss, ModuleT};

use clsbench_common::BatchSource;

use crate::mesh::Collective;
use crate::metrics::{write_to_summary, LatencySummary, LatencyTracker, RateTracker, SharedSink};
use crate::optim::Sgd;
use crate::scaler::GradScaler;
use crate::scheduler::LrScheduler;

// ── Config ──────────────────────────────────────────────────────────────────

/// Loop-level knobs taken from the run configuration.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub batch_size: usize,
    /// Emit a training update every `log_steps` batches.
    pub log_steps: usize,
    /// Batches each epoch is expected to yield; only used for the lock-step check.
    pub steps_per_epoch: usize,
    pub fine_grained_metrics: bool,
}

/// What one epoch of training did.
#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch: usize,
    pub steps: usize,
    /// Loss of the last batch (0 if the epoch was empty).
    pub last_loss: f32,
    /// Optimiser steps skipped this epoch on non-finite gradients.
    pub skipped_steps: usize,
    pub global_rate: f64,
    /// Present in fine-grained mode.
    pub latency: Option<LatencySummary>,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// Owns one model replica and everything that updates it.
pub struct Trainer<M, C> {
    model: M,
    vars: Vec<Var>,
    optimizer: Sgd,
    scheduler: Option<LrScheduler>,
    scaler: GradScaler,
    collective: C,
    writer: Option<SharedSink>,
    pub config: TrainerConfig,
    global_step: usize,
}

impl<M: ModuleT, C: Collective> Trainer<M, C> {
    /// `vars` are the trainable variables, in the same order on every worker.
    pub fn new(
        model: M,
        vars: Vec<Var>,
        optimizer: Sgd,
        collective: C,
        config: TrainerConfig,
    ) -> Self {
        Self {
            model,
            vars,
            optimizer,
            scheduler: None,
            scaler: GradScaler::new(false),
            collective,
            writer: None,
            config,
            global_step: 0,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Option<LrScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_scaler(mut self, scaler: GradScaler) -> Self {
        self.scaler = scaler;
        self
    }

    pub fn with_writer(mut self, writer: Option<SharedSink>) -> Self {
        self.writer = writer;
        self
    }

    /// One pass over `loader`.
    pub fn train_epoch(
        &mut self,
        loader: &dyn BatchSource,
        epoch: usize,
    ) -> anyhow::Result<EpochReport> {
        if loader.len() != self.config.steps_per_epoch {
            tracing::warn!(
                ordinal = self.collective.ordinal(),
                batches = loader.len(),
                steps_per_epoch = self.config.steps_per_epoch,
                "epoch length differs from the schedule's steps per epoch"
            );
        }

        let mut tracker = RateTracker::default();
        let mut latency = self.config.fine_grained_metrics.then(LatencyTracker::default);
        let skipped_before = self.scaler.skipped_steps();
        let mut last_loss = 0.0f32;
        let mut steps = 0usize;

        for (step, batch) in loader.batches().enumerate() {
            let (data, target) = batch?;
            let t0 = Instant::now();

            let logits = self.model.forward_t(&data, true)?;
            let loss = loss::cross_entropy(&logits, &target)?;
            if latency.is_some() {
                // Reading the loss waits for the forward pass to finish.
                last_loss = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            }
            let t_forward = t0.elapsed().as_secs_f64();

            let mut grads = self.scaler.scale(&loss)?.backward()?;
            self.reduce_gradients(&mut grads)?;
            self.scaler.step(&mut self.optimizer, &mut grads, &self.vars)?;
            self.scaler.update();
            if let Some(scheduler) = self.scheduler.as_mut() {
                scheduler.step(&mut self.optimizer);
            }
            self.global_step += 1;
            tracker.add(self.config.batch_size);
            steps += 1;

            if let Some(latency) = latency.as_mut() {
                let t_step = t0.elapsed().as_secs_f64();
                latency.record(t_step, t_forward, t_step - t_forward);
            }

            if self.config.log_steps > 0 && step % self.config.log_steps == 0 {
                last_loss = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
                self.train_update(step, epoch, last_loss, &mut tracker, latency.as_ref());
            } else if step + 1 == loader.len() && latency.is_none() {
                last_loss = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            }
        }

        let latency = latency.map(|l| l.summary(self.config.batch_size));
        if let Some(s) = &latency {
            tracing::info!(
                ordinal = self.collective.ordinal(),
                epoch,
                step_p50 = format!("{:.4}", s.step_p50),
                forward_p50 = format!("{:.4}", s.forward_p50),
                backward_p50 = format!("{:.4}", s.backward_p50),
                rate_p50 = format!("{:.2}", s.rate_p50),
                "epoch latency"
            );
        }

        Ok(EpochReport {
            epoch,
            steps,
            last_loss,
            skipped_steps: self.scaler.skipped_steps() - skipped_before,
            global_rate: tracker.global_rate(),
            latency,
        })
    }

    /// Sum gradients over the mesh and divide by the world size.
    fn reduce_gradients(&self, grads: &mut GradStore) -> candle_core::Result<()> {
        let world = self.collective.world_size();
        if world <= 1 {
            return Ok(());
        }
        let mut owners = Vec::new();
        let mut local = Vec::new();
        for var in &self.vars {
            if let Some(g) = grads.remove(var.as_tensor()) {
                owners.push(var);
                local.push(g);
            }
        }
        let reduced = self.collective.all_reduce_sum(local, 1.0 / world as f64)?;
        for (var, g) in owners.into_iter().zip(reduced) {
            grads.insert(var.as_tensor(), g);
        }
        Ok(())
    }

    fn train_update(
        &self,
        step: usize,
        epoch: usize,
        loss: f32,
        tracker: &mut RateTracker,
        latency: Option<&LatencyTracker>,
    ) {
        let rate = tracker.rate();
        let global_rate = tracker.global_rate();
        match latency {
            // Fine-grained mode reports step medians in place of the usual line.
            Some(l) => {
                let s = l.summary(self.config.batch_size);
                tracing::info!(
                    ordinal = self.collective.ordinal(),
                    epoch,
                    step,
                    loss = format!("{loss:.5}"),
                    step_p50 = format!("{:.4}", s.step_p50),
                    forward_p50 = format!("{:.4}", s.forward_p50),
                    backward_p50 = format!("{:.4}", s.backward_p50),
                    rate_p50 = format!("{:.2}", s.rate_p50),
                    "step latency"
                );
            }
            None => tracing::info!(
                ordinal = self.collective.ordinal(),
                epoch,
                step,
                loss = format!("{loss:.5}"),
                rate = format!("{rate:.2}"),
                global_rate = format!("{global_rate:.2}"),
                lr = self.optimizer_lr(),
                "train"
            ),
        }
        if self.collective.is_master() {
            write_to_summary(
                self.writer.as_ref(),
                self.global_step,
                &[("examples/sec", rate), ("average_examples/sec", global_rate)],
            );
        }
    }

    fn optimizer_lr(&self) -> f64 {
        match &self.scheduler {
            Some(s) => s.current_lr(),
            None => candle_nn::Optimizer::learning_rate(&self.optimizer),
        }
    }

    /// Top-1 accuracy in percent over `loader`, averaged across workers.
    pub fn evaluate(&self, loader: &dyn BatchSource, epoch: usize) -> anyhow::Result<f64> {
        let mut correct = 0usize;
        let mut total = 0usize;
        let mut tracker = RateTracker::default();

        for (step, batch) in loader.batches().enumerate() {
            let (data, target) = batch?;
            let logits = self.model.forward_t(&data, false)?;
            correct += count_correct(&logits, &target)?;
            total += target.dim(0)?;
            tracker.add(loader.batch_size());
            if self.config.log_steps > 0 && step % self.config.log_steps == 0 {
                tracing::debug!(
                    ordinal = self.collective.ordinal(),
                    epoch,
                    step,
                    rate = format!("{:.2}", tracker.rate()),
                    "test"
                );
            }
        }

        let accuracy = if total == 0 {
            0.0
        } else {
            100.0 * correct as f64 / total as f64
        };
        Ok(self.collective.mesh_mean(accuracy)?)
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &Sgd {
        &self.optimizer
    }

    pub fn scheduler(&self) -> Option<&LrScheduler> {
        self.scheduler.as_ref()
    }

    pub fn scaler(&self) -> &GradScaler {
        &self.scaler
    }

    pub fn collective(&self) -> &C {
        &self.collective
    }

    /// Optimiser steps attempted so far, skipped ones included.
    pub fn global_step(&self) -> usize {
        self.global_step
    }
}

/// Rows whose arg-max logit equals the label.
fn count_correct(logits: &Tensor, target: &Tensor) -> candle_core::Result<usize> {
    let pred = logits.argmax_keepdim(1)?.squeeze(1)?;
    let hits = pred
        .eq(&target.to_dtype(pred.dtype())?)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(hits as usize)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::Arc;

    use candle_core::Device;
    use candle_nn::{linear, Linear, Module, Optimizer, VarBuilder, VarMap};
    use clsbench_common::SyntheticImages;
    use parking_lot::Mutex;

    use super::*;
    use crate::mesh::SingleProcess;
    use crate::optim::ParamsSgd;
    use crate::scheduler::{wrap_optimizer_with_scheduler, SchedulerConfig};

    struct Flat(Linear);

    impl ModuleT for Flat {
        fn forward_t(&self, x: &Tensor, _train: bool) -> candle_core::Result<Tensor> {
            self.0.forward(&x.flatten_from(1)?)
        }
    }

    /// 3-channel 1x1 images, two classes, step decay by 10 every epoch of one batch.
    fn trainer(fine_grained_metrics: bool) -> Trainer<Flat, SingleProcess> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Flat(linear(3, 2, vb).unwrap());
        let vars = varmap.all_vars();
        let mut optimizer = Sgd::new(
            vars.clone(),
            ParamsSgd {
                lr: 0.1,
                ..Default::default()
            },
        )
        .unwrap();
        let scheduler = wrap_optimizer_with_scheduler(
            &mut optimizer,
            &SchedulerConfig {
                kind: Some("step-decay".into()),
                divisor: Some(10.0),
                divide_every_n_epochs: Some(1),
                steps_per_epoch: 1,
                ..Default::default()
            },
            None,
        )
        .unwrap();
        Trainer::new(
            model,
            vars,
            optimizer,
            SingleProcess,
            TrainerConfig {
                batch_size: 1,
                log_steps: 1,
                steps_per_epoch: 1,
                fine_grained_metrics,
            },
        )
        .with_scheduler(scheduler)
        .with_scaler(GradScaler::new(true))
    }

    fn images(value: f32, batches: usize) -> SyntheticImages {
        let data = Tensor::full(value, (1, 3, 1, 1), &Device::Cpu).unwrap();
        let target = Tensor::zeros(1, DType::U32, &Device::Cpu).unwrap();
        SyntheticImages::new(data, target, batches)
    }

    #[test]
    fn counts_argmax_hits() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[0.1f32, 0.9], [0.8, 0.2], [0.3, 0.7]], &dev).unwrap();
        let target = Tensor::new(&[1u32, 1, 1], &dev).unwrap();
        assert_eq!(count_correct(&logits, &target).unwrap(), 2);
    }

    #[test]
    fn skipped_step_still_advances_the_schedule() {
        let mut t = trainer(false);
        let before = t.model().0.weight().to_vec2::<f32>().unwrap();

        let report = t.train_epoch(&images(f32::INFINITY, 1), 1).unwrap();

        assert_eq!(report.skipped_steps, 1);
        assert_eq!(t.scaler().skipped_steps(), 1);
        assert_eq!(t.scaler().scale_factor(), GradScaler::INIT_SCALE / 2.0);
        assert_eq!(t.model().0.weight().to_vec2::<f32>().unwrap(), before);

        let sched = t.scheduler().unwrap();
        assert_eq!(sched.global_step(), 1);
        assert!((sched.current_lr() - 0.01).abs() < 1e-12);
        assert!((t.optimizer().learning_rate() - 0.01).abs() < 1e-12);
        assert_eq!(t.global_step(), 1);
    }

    #[test]
    fn clean_steps_update_weights() {
        let mut t = trainer(false);
        let before = t.model().0.weight().to_vec2::<f32>().unwrap();
        let report = t.train_epoch(&images(1.0, 2), 1).unwrap();
        assert_eq!(report.steps, 2);
        assert_eq!(report.skipped_steps, 0);
        assert_ne!(t.model().0.weight().to_vec2::<f32>().unwrap(), before);
        assert_eq!(t.scheduler().unwrap().global_step(), 2);
    }

    /// Formatted log output, shared with the subscriber.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn info_log_of_epoch(fine_grained_metrics: bool) -> String {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let mut t = trainer(fine_grained_metrics);
        tracing::subscriber::with_default(subscriber, || {
            t.train_epoch(&images(1.0, 2), 1).unwrap();
        });
        let bytes = out.0.lock().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn fine_grained_latency_is_logged_at_info() {
        let fine = info_log_of_epoch(true);
        assert!(fine.contains("step latency"), "{fine}");
        assert!(fine.contains("step_p50"), "{fine}");

        let plain = info_log_of_epoch(false);
        assert!(!plain.contains("step latency"), "{plain}");
        assert!(plain.contains("global_rate"), "{plain}");
    }
}
