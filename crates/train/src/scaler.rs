//! Dynamic loss scaling.
//!
//! The loss is multiplied by `scale` before backward so small gradients
//! survive reduced-precision arithmetic. Before the optimiser step the
//! gradients are unscaled and checked; a non-finite gradient skips the step
//! and halves the scale, while `growth_interval` clean steps in a row double
//! it.

use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor, Var};
use candle_nn::Optimizer;

/// Loss scaler with the usual growth / backoff policy.
#[derive(Debug, Clone)]
pub struct GradScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    growth_tracker: usize,
    found_inf: bool,
    skipped_steps: usize,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new(true)
    }
}

impl GradScaler {
    pub const INIT_SCALE: f64 = 65536.0;

    /// A disabled scaler passes losses and steps straight through.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: Self::INIT_SCALE,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
            found_inf: false,
            skipped_steps: 0,
        }
    }

    pub fn with_growth_interval(mut self, growth_interval: usize) -> Self {
        self.growth_interval = growth_interval.max(1);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current scale (1 when disabled).
    pub fn scale_factor(&self) -> f64 {
        if self.enabled {
            self.scale
        } else {
            1.0
        }
    }

    /// Optimiser steps skipped because of non-finite gradients.
    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }

    pub fn scale(&self, loss: &Tensor) -> Result<Tensor> {
        if !self.enabled {
            return Ok(loss.clone());
        }
        loss.affine(self.scale, 0.0)
    }

    /// Unscale the gradients of `vars` in place and step `optimizer` if they
    /// are all finite. Returns whether the step was taken.
    pub fn step<O: Optimizer>(
        &mut self,
        optimizer: &mut O,
        grads: &mut GradStore,
        vars: &[Var],
    ) -> Result<bool> {
        if !self.enabled {
            optimizer.step(grads)?;
            return Ok(true);
        }
        let inv_scale = 1.0 / self.scale;
        let mut finite = true;
        for var in vars {
            if let Some(g) = grads.remove(var.as_tensor()) {
                let g = g.affine(inv_scale, 0.0)?;
                finite &= is_finite(&g)?;
                grads.insert(var.as_tensor(), g);
            }
        }
        self.found_inf = !finite;
        if finite {
            optimizer.step(grads)?;
        } else {
            self.skipped_steps += 1;
        }
        Ok(finite)
    }

    /// Adjust the scale after a [`step`](Self::step).
    pub fn update(&mut self) {
        if !self.enabled {
            return;
        }
        if self.found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
            tracing::debug!(scale = self.scale, "non-finite gradients, backing off loss scale");
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker == self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
            }
        }
        self.found_inf = false;
    }
}

/// NaN and ±inf both poison the sum.
fn is_finite(t: &Tensor) -> Result<bool> {
    let sum = t.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    Ok(sum.is_finite())
}

// ── Tests ───────────────────────────────────────────────────────────────────
