//! SGD with momentum, weight decay and parameter groups.
//!
//! `candle_nn::SGD` has a single learning rate and no momentum; the
//! benchmark needs both, plus per-group rates for the scheduler.

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::Optimizer;

use crate::scheduler::ParamGroups;

/// Hyper-parameters shared by the variables of one group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsSgd {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 0.1,
            momentum: 0.0,
            weight_decay: 0.0,
            nesterov: false,
        }
    }
}

struct Group {
    vars: Vec<Var>,
    params: ParamsSgd,
    /// Momentum buffer per variable, created on its first gradient.
    velocity: Vec<Option<Tensor>>,
}

/// Stochastic gradient descent over one or more parameter groups.
///
/// Per variable with a gradient `g`:
/// ```text
/// d = g + weight_decay * w
/// v = momentum * v + d          (v = d on the first step)
/// w = w - lr * (nesterov ? d + momentum * v : v)
/// ```
/// Variables without a gradient (e.g. batch-norm running statistics) are
/// left untouched.
pub struct Sgd {
    groups: Vec<Group>,
}

impl Sgd {
    /// One group per `(vars, params)` pair.
    pub fn with_groups(groups: Vec<(Vec<Var>, ParamsSgd)>) -> Self {
        let groups = groups
            .into_iter()
            .map(|(vars, params)| Group {
                velocity: vec![None; vars.len()],
                vars,
                params,
            })
            .collect();
        Self { groups }
    }

    pub fn params(&self, group: usize) -> &ParamsSgd {
        &self.groups[group].params
    }

    /// All variables, in group order.
    pub fn vars(&self) -> impl Iterator<Item = &Var> {
        self.groups.iter().flat_map(|g| g.vars.iter())
    }
}

impl Optimizer for Sgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, config: ParamsSgd) -> Result<Self> {
        Ok(Self::with_groups(vec![(vars, config)]))
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        for group in &mut self.groups {
            let p = group.params;
            for (var, velocity) in group.vars.iter().zip(group.velocity.iter_mut()) {
                let Some(grad) = grads.get(var.as_tensor()) else {
                    continue;
                };
                let mut d = grad.clone();
                if p.weight_decay != 0.0 {
                    d = (d + var.as_tensor().affine(p.weight_decay, 0.0)?)?;
                }
                if p.momentum != 0.0 {
                    let v = match velocity.take() {
                        None => d.clone(),
                        Some(v) => (v.affine(p.momentum, 0.0)? + &d)?,
                    };
                    d = if p.nesterov {
                        (d + v.affine(p.momentum, 0.0)?)?
                    } else {
                        v.clone()
                    };
                    *velocity = Some(v.detach());
                }
                var.set(&var.as_tensor().sub(&d.affine(p.lr, 0.0)?)?)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.groups.first().map(|g| g.params.lr).unwrap_or(0.0)
    }

    /// Sets the same rate on every group.
    fn set_learning_rate(&mut self, lr: f64) {
        for group in &mut self.groups {
            group.params.lr = lr;
        }
    }
}

impl ParamGroups for Sgd {
    fn num_groups(&self) -> usize {
        self.groups.len()
    }

    fn group_lr(&self, group: usize) -> f64 {
        self.groups[group].params.lr
    }

    fn set_group_lr(&mut self, group: usize, lr: f64) {
        self.groups[group].params.lr = lr;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn value(var: &Var) -> f32 {
        var.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    /// loss = w * x, so dloss/dw = x.
    fn grads_for(var: &Var, x: f32) -> GradStore {
        let x = Tensor::new(&[x], &Device::Cpu).unwrap();
        var.as_tensor().mul(&x).unwrap().sum_all().unwrap().backward().unwrap()
    }

    #[test]
    fn plain_sgd_step() {
        let w = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let mut opt = Sgd::new(
            vec![w.clone()],
            ParamsSgd {
                lr: 0.1,
                ..Default::default()
            },
        )
        .unwrap();
        opt.step(&grads_for(&w, 2.0)).unwrap();
        assert!((value(&w) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let w = Var::new(&[0.0f32], &Device::Cpu).unwrap();
        let mut opt = Sgd::new(
            vec![w.clone()],
            ParamsSgd {
                lr: 1.0,
                momentum: 0.5,
                ..Default::default()
            },
        )
        .unwrap();
        opt.step(&grads_for(&w, 1.0)).unwrap();
        assert!((value(&w) + 1.0).abs() < 1e-6);
        // v = 0.5 * 1 + 1
        opt.step(&grads_for(&w, 1.0)).unwrap();
        assert!((value(&w) + 2.5).abs() < 1e-6);
    }

    #[test]
    fn weight_decay_pulls_towards_zero() {
        let w = Var::new(&[2.0f32], &Device::Cpu).unwrap();
        let mut opt = Sgd::new(
            vec![w.clone()],
            ParamsSgd {
                lr: 0.1,
                weight_decay: 0.5,
                ..Default::default()
            },
        )
        .unwrap();
        opt.step(&grads_for(&w, 0.0)).unwrap();
        // 2 - 0.1 * (0 + 0.5 * 2)
        assert!((value(&w) - 1.9).abs() < 1e-6);
    }

    #[test]
    fn groups_keep_their_own_rates() {
        let a = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let b = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let mut opt = Sgd::with_groups(vec![
            (
                vec![a.clone()],
                ParamsSgd {
                    lr: 0.1,
                    ..Default::default()
                },
            ),
            (
                vec![b.clone()],
                ParamsSgd {
                    lr: 0.01,
                    ..Default::default()
                },
            ),
        ]);
        assert_eq!(opt.num_groups(), 2);
        assert_eq!(opt.group_lr(1), 0.01);

        let x = Tensor::new(&[1.0f32], &Device::Cpu).unwrap();
        let loss = (a.as_tensor().mul(&x).unwrap() + b.as_tensor().mul(&x).unwrap())
            .unwrap()
            .sum_all()
            .unwrap();
        opt.step(&loss.backward().unwrap()).unwrap();
        assert!((value(&a) - 0.9).abs() < 1e-6);
        assert!((value(&b) - 0.99).abs() < 1e-6);

        opt.set_group_lr(0, 0.5);
        assert_eq!(opt.learning_rate(), 0.5);
        opt.set_learning_rate(0.2);
        assert_eq!(opt.group_lr(1), 0.2);
    }

    #[test]
    fn vars_without_gradients_are_skipped() {
        let w = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let stat = Var::new(&[5.0f32], &Device::Cpu).unwrap();
        let mut opt = Sgd::new(
            vec![w.clone(), stat.clone()],
            ParamsSgd {
                lr: 0.1,
                weight_decay: 0.1,
                ..Default::default()
            },
        )
        .unwrap();
        opt.step(&grads_for(&w, 1.0)).unwrap();
        assert_eq!(value(&stat), 5.0);
        assert_eq!(opt.vars().count(), 2);
    }
}
