//! VGG-11/13/16/19, with or without batch norm.

use candle_core::{Result, Tensor};
use candle_nn::{
    batch_norm, conv2d, linear, BatchNorm, Conv2d, Conv2dConfig, Dropout, Linear, Module, ModuleT,
    VarBuilder,
};

use crate::pool::adaptive_avg_pool2d;

/// One entry of a VGG feature plan: a 3×3 conv to `n` channels, or a 2×2 max-pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Conv(usize),
    Pool,
}

use Stage::{Conv as C, Pool as M};

/// Feature plan for a VGG of the given depth (11, 13, 16 or 19).
pub fn plan(depth: usize) -> Option<&'static [Stage]> {
    const A: &[Stage] = &[
        C(64), M, C(128), M, C(256), C(256), M, C(512), C(512), M, C(512), C(512), M,
    ];
    const B: &[Stage] = &[
        C(64), C(64), M, C(128), C(128), M, C(256), C(256), M, C(512), C(512), M, C(512), C(512), M,
    ];
    const D: &[Stage] = &[
        C(64), C(64), M, C(128), C(128), M, C(256), C(256), C(256), M, C(512), C(512), C(512), M,
        C(512), C(512), C(512), M,
    ];
    const E: &[Stage] = &[
        C(64), C(64), M, C(128), C(128), M, C(256), C(256), C(256), C(256), M, C(512), C(512),
        C(512), C(512), M, C(512), C(512), C(512), C(512), M,
    ];
    match depth {
        11 => Some(A),
        13 => Some(B),
        16 => Some(D),
        19 => Some(E),
        _ => None,
    }
}

enum Feature {
    Conv { conv: Conv2d, bn: Option<BatchNorm> },
    Pool,
}

pub struct Vgg {
    features: Vec<Feature>,
    fc1: Linear,
    fc2: Linear,
    fc3: Linear,
    dropout: Dropout,
}

impl Vgg {
    pub fn new(
        stages: &[Stage],
        batch_norm_layers: bool,
        num_classes: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let fvb = vb.pp("features");
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        // Indices count every torchvision module (conv, bn, relu, pool).
        let mut idx = 0;
        let mut in_c = 3;
        let mut features = Vec::with_capacity(stages.len());
        for stage in stages {
            match *stage {
                Stage::Conv(out_c) => {
                    let conv = conv2d(in_c, out_c, 3, cfg, fvb.pp(idx.to_string()))?;
                    idx += 1;
                    let bn = if batch_norm_layers {
                        let bn = batch_norm(out_c, 1e-5, fvb.pp(idx.to_string()))?;
                        idx += 1;
                        Some(bn)
                    } else {
                        None
                    };
                    idx += 1; // relu
                    features.push(Feature::Conv { conv, bn });
                    in_c = out_c;
                }
                Stage::Pool => {
                    idx += 1;
                    features.push(Feature::Pool);
                }
            }
        }

        let cvb = vb.pp("classifier");
        Ok(Self {
            features,
            fc1: linear(in_c * 7 * 7, 4096, cvb.pp("0"))?,
            fc2: linear(4096, 4096, cvb.pp("3"))?,
            fc3: linear(4096, num_classes, cvb.pp("6"))?,
            dropout: Dropout::new(0.5),
        })
    }
}

impl ModuleT for Vgg {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = x.clone();
        for feature in &self.features {
            x = match feature {
                Feature::Conv { conv, bn } => {
                    let y = x.apply(conv)?;
                    let y = match bn {
                        Some(bn) => y.apply_t(bn, train)?,
                        None => y,
                    };
                    y.relu()?
                }
                Feature::Pool => x.max_pool2d_with_stride(2, 2)?,
            };
        }
        let x = adaptive_avg_pool2d(&x, 7)?.flatten_from(1)?;
        let x = self.fc1.forward(&x)?.relu()?.apply_t(&self.dropout, train)?;
        let x = self.fc2.forward(&x)?.relu()?.apply_t(&self.dropout, train)?;
        self.fc3.forward(&x)
    }
}
