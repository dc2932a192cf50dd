//! DenseNet-121/161/169/201.
//!
//! Every layer sees the concatenation of all earlier feature maps in its
//! block; transitions halve both the channel count and the resolution.
//! Parameter names follow torchvision (`features.denseblock1.denselayer1.conv1`,
//! `features.transition1.conv`, `features.norm5`, `classifier`).

use candle_core::{Result, Tensor, D};
use candle_nn::{
    batch_norm, conv2d_no_bias, linear, BatchNorm, Conv2d, Conv2dConfig, Linear, Module, ModuleT,
    VarBuilder,
};

use crate::pool::max_pool2d_padded;

/// Growth rate, stem width and layers per dense block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DenseNetConfig {
    pub growth_rate: usize,
    pub num_init_features: usize,
    pub block_config: [usize; 4],
    /// Bottleneck width as a multiple of the growth rate.
    pub bn_size: usize,
}

impl DenseNetConfig {
    pub fn densenet121() -> Self {
        Self {
            growth_rate: 32,
            num_init_features: 64,
            block_config: [6, 12, 24, 16],
            bn_size: 4,
        }
    }

    pub fn densenet161() -> Self {
        Self {
            growth_rate: 48,
            num_init_features: 96,
            block_config: [6, 12, 36, 24],
            bn_size: 4,
        }
    }

    pub fn densenet169() -> Self {
        Self {
            growth_rate: 32,
            num_init_features: 64,
            block_config: [6, 12, 32, 32],
            bn_size: 4,
        }
    }

    pub fn densenet201() -> Self {
        Self {
            growth_rate: 32,
            num_init_features: 64,
            block_config: [6, 12, 48, 32],
            bn_size: 4,
        }
    }
}

fn conv(in_c: usize, out_c: usize, k: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: k / 2,
        ..Default::default()
    };
    conv2d_no_bias(in_c, out_c, k, cfg, vb)
}

// ── Blocks ──────────────────────────────────────────────────────────────────

/// BN → ReLU → 1×1 conv → BN → ReLU → 3×3 conv, producing `growth_rate` maps.
struct DenseLayer {
    norm1: BatchNorm,
    conv1: Conv2d,
    norm2: BatchNorm,
    conv2: Conv2d,
}

impl DenseLayer {
    fn new(in_c: usize, config: &DenseNetConfig, vb: VarBuilder) -> Result<Self> {
        let width = config.bn_size * config.growth_rate;
        Ok(Self {
            norm1: batch_norm(in_c, 1e-5, vb.pp("norm1"))?,
            conv1: conv(in_c, width, 1, vb.pp("conv1"))?,
            norm2: batch_norm(width, 1e-5, vb.pp("norm2"))?,
            conv2: conv(width, config.growth_rate, 3, vb.pp("conv2"))?,
        })
    }

    fn forward_t(&self, features: &[Tensor], train: bool) -> Result<Tensor> {
        let x = Tensor::cat(features, 1)?;
        x.apply_t(&self.norm1, train)?
            .relu()?
            .apply(&self.conv1)?
            .apply_t(&self.norm2, train)?
            .relu()?
            .apply(&self.conv2)
    }
}

struct DenseBlock {
    layers: Vec<DenseLayer>,
}

impl DenseBlock {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut features = vec![x.clone()];
        for layer in &self.layers {
            let new = layer.forward_t(&features, train)?;
            features.push(new);
        }
        Tensor::cat(&features, 1)
    }
}

/// BN → ReLU → 1×1 conv → 2×2 average pool.
struct Transition {
    norm: BatchNorm,
    conv: Conv2d,
}

impl Transition {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        x.apply_t(&self.norm, train)?
            .relu()?
            .apply(&self.conv)?
            .avg_pool2d(2)
    }
}

// ── DenseNet ────────────────────────────────────────────────────────────────

pub struct DenseNet {
    conv0: Conv2d,
    norm0: BatchNorm,
    blocks: Vec<(DenseBlock, Option<Transition>)>,
    norm5: BatchNorm,
    classifier: Linear,
}

impl DenseNet {
    pub fn new(config: &DenseNetConfig, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let features = vb.pp("features");
        let init = config.num_init_features;
        let conv0 = conv2d_no_bias(
            3,
            init,
            7,
            Conv2dConfig {
                padding: 3,
                stride: 2,
                ..Default::default()
            },
            features.pp("conv0"),
        )?;
        let norm0 = batch_norm(init, 1e-5, features.pp("norm0"))?;

        let mut channels = init;
        let mut blocks = Vec::with_capacity(config.block_config.len());
        for (i, &num_layers) in config.block_config.iter().enumerate() {
            let block_vb = features.pp(format!("denseblock{}", i + 1));
            let mut layers = Vec::with_capacity(num_layers);
            for j in 0..num_layers {
                let in_c = channels + j * config.growth_rate;
                let layer_vb = block_vb.pp(format!("denselayer{}", j + 1));
                layers.push(DenseLayer::new(in_c, config, layer_vb)?);
            }
            channels += num_layers * config.growth_rate;

            let transition = if i + 1 < config.block_config.len() {
                let vb = features.pp(format!("transition{}", i + 1));
                let t = Transition {
                    norm: batch_norm(channels, 1e-5, vb.pp("norm"))?,
                    conv: conv(channels, channels / 2, 1, vb.pp("conv"))?,
                };
                channels /= 2;
                Some(t)
            } else {
                None
            };
            blocks.push((DenseBlock { layers }, transition));
        }

        let norm5 = batch_norm(channels, 1e-5, features.pp("norm5"))?;
        let classifier = linear(channels, num_classes, vb.pp("classifier"))?;
        Ok(Self {
            conv0,
            norm0,
            blocks,
            norm5,
            classifier,
        })
    }
}

impl ModuleT for DenseNet {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = x.apply(&self.conv0)?.apply_t(&self.norm0, train)?.relu()?;
        let mut x = max_pool2d_padded(&x, 3, 2, 1)?;
        for (block, transition) in &self.blocks {
            x = block.forward_t(&x, train)?;
            if let Some(t) = transition {
                x = t.forward_t(&x, train)?;
            }
        }
        let x = x.apply_t(&self.norm5, train)?.relu()?;
        let x = x.mean(D::Minus1)?.mean(D::Minus1)?;
        self.classifier.forward(&x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn densenet121_names_and_widths() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        DenseNet::new(&DenseNetConfig::densenet121(), 10, vb).unwrap();
        let data = varmap.data().lock().unwrap();
        for name in [
            "features.conv0.weight",
            "features.norm0.running_mean",
            "features.denseblock1.denselayer1.norm1.weight",
            "features.denseblock1.denselayer6.conv2.weight",
            "features.transition1.conv.weight",
            "features.denseblock4.denselayer16.conv1.weight",
            "features.norm5.bias",
            "classifier.weight",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        assert!(!data.contains_key("features.transition4.conv.weight"));
        assert!(!data.contains_key("features.denseblock1.denselayer7.conv1.weight"));
        // 64 + 6*32 = 256 channels go into the first transition, 128 come out.
        assert_eq!(
            data["features.transition1.conv.weight"].as_tensor().dims(),
            &[128, 256, 1, 1]
        );
        assert_eq!(data["classifier.weight"].as_tensor().dims(), &[10, 1024]);
    }

    #[test]
    fn densenet161_is_wider() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        DenseNet::new(&DenseNetConfig::densenet161(), 10, vb).unwrap();
        let data = varmap.data().lock().unwrap();
        assert_eq!(data["features.conv0.weight"].as_tensor().dims(), &[96, 3, 7, 7]);
        assert_eq!(data["classifier.weight"].as_tensor().dims(), &[10, 2208]);
    }

    #[test]
    fn small_densenet_logits_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = DenseNetConfig {
            growth_rate: 4,
            num_init_features: 8,
            block_config: [2, 2, 2, 2],
            bn_size: 2,
        };
        let model = DenseNet::new(&config, 5, vb).unwrap();
        let x = Tensor::zeros((2, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.forward_t(&x, true).unwrap().dims(), &[2, 5]);
        assert_eq!(model.forward_t(&x, false).unwrap().dims(), &[2, 5]);
    }
}
