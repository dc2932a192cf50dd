//! ResNet-18/34/50/101/152.
//!
//! Parameter names follow torchvision (`conv1`, `layer1.0.bn2`,
//! `layer2.0.downsample.0`, `fc`, ...), so checkpoints line up.

use candle_core::{Result, Tensor, D};
use candle_nn::{
    batch_norm, conv2d_no_bias, linear, BatchNorm, Conv2d, Conv2dConfig, Linear, Module, ModuleT,
    VarBuilder,
};

use crate::pool::max_pool2d_padded;

/// Residual block flavour and per-stage block counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResNetConfig {
    pub bottleneck: bool,
    pub layers: [usize; 4],
}

impl ResNetConfig {
    pub fn resnet18() -> Self {
        Self {
            bottleneck: false,
            layers: [2, 2, 2, 2],
        }
    }

    pub fn resnet34() -> Self {
        Self {
            bottleneck: false,
            layers: [3, 4, 6, 3],
        }
    }

    pub fn resnet50() -> Self {
        Self {
            bottleneck: true,
            layers: [3, 4, 6, 3],
        }
    }

    pub fn resnet101() -> Self {
        Self {
            bottleneck: true,
            layers: [3, 4, 23, 3],
        }
    }

    pub fn resnet152() -> Self {
        Self {
            bottleneck: true,
            layers: [3, 8, 36, 3],
        }
    }

    fn expansion(&self) -> usize {
        if self.bottleneck {
            4
        } else {
            1
        }
    }
}

fn conv(in_c: usize, out_c: usize, k: usize, stride: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: k / 2,
        stride,
        ..Default::default()
    };
    conv2d_no_bias(in_c, out_c, k, cfg, vb)
}

// ── Blocks ──────────────────────────────────────────────────────────────────

/// 1×1 projection on the shortcut when shape changes.
struct Downsample {
    conv: Conv2d,
    bn: BatchNorm,
}

impl Downsample {
    fn new(in_c: usize, out_c: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv: conv(in_c, out_c, 1, stride, vb.pp("0"))?,
            bn: batch_norm(out_c, 1e-5, vb.pp("1"))?,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        x.apply(&self.conv)?.apply_t(&self.bn, train)
    }
}

/// Conv + BN pair; the last pair of a block is not followed by ReLU.
struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBn {
    fn new(
        in_c: usize,
        out_c: usize,
        k: usize,
        stride: usize,
        idx: usize,
        vb: &VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            conv: conv(in_c, out_c, k, stride, vb.pp(format!("conv{idx}")))?,
            bn: batch_norm(out_c, 1e-5, vb.pp(format!("bn{idx}")))?,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        x.apply(&self.conv)?.apply_t(&self.bn, train)
    }
}

/// Basic (two 3×3) or bottleneck (1×1 → 3×3 → 1×1) residual block.
struct Block {
    convs: Vec<ConvBn>,
    downsample: Option<Downsample>,
}

impl Block {
    fn new(
        config: &ResNetConfig,
        in_c: usize,
        planes: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let out_c = planes * config.expansion();
        let convs = if config.bottleneck {
            vec![
                ConvBn::new(in_c, planes, 1, 1, 1, &vb)?,
                ConvBn::new(planes, planes, 3, stride, 2, &vb)?,
                ConvBn::new(planes, out_c, 1, 1, 3, &vb)?,
            ]
        } else {
            vec![
                ConvBn::new(in_c, planes, 3, stride, 1, &vb)?,
                ConvBn::new(planes, planes, 3, 1, 2, &vb)?,
            ]
        };
        let downsample = if stride != 1 || in_c != out_c {
            Some(Downsample::new(in_c, out_c, stride, vb.pp("downsample"))?)
        } else {
            None
        };
        Ok(Self { convs, downsample })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let last = self.convs.len() - 1;
        let mut out = x.clone();
        for (i, cb) in self.convs.iter().enumerate() {
            out = cb.forward_t(&out, train)?;
            if i != last {
                out = out.relu()?;
            }
        }
        let shortcut = match &self.downsample {
            Some(ds) => ds.forward_t(x, train)?,
            None => x.clone(),
        };
        (out + shortcut)?.relu()
    }
}

// ── ResNet ──────────────────────────────────────────────────────────────────

pub struct ResNet {
    stem: ConvBn,
    stages: Vec<Vec<Block>>,
    fc: Linear,
}

impl ResNet {
    pub fn new(config: &ResNetConfig, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let stem = ConvBn {
            conv: conv2d_no_bias(
                3,
                64,
                7,
                Conv2dConfig {
                    padding: 3,
                    stride: 2,
                    ..Default::default()
                },
                vb.pp("conv1"),
            )?,
            bn: batch_norm(64, 1e-5, vb.pp("bn1"))?,
        };

        let mut in_c = 64;
        let mut stages = Vec::with_capacity(4);
        for (i, &blocks) in config.layers.iter().enumerate() {
            let planes = 64 << i;
            let stride = if i == 0 { 1 } else { 2 };
            let stage_vb = vb.pp(format!("layer{}", i + 1));
            let mut stage = Vec::with_capacity(blocks);
            for b in 0..blocks {
                let s = if b == 0 { stride } else { 1 };
                stage.push(Block::new(config, in_c, planes, s, stage_vb.pp(b.to_string()))?);
                in_c = planes * config.expansion();
            }
            stages.push(stage);
        }

        let fc = linear(in_c, num_classes, vb.pp("fc"))?;
        Ok(Self { stem, stages, fc })
    }
}

impl ModuleT for ResNet {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = self.stem.forward_t(x, train)?.relu()?;
        x = max_pool2d_padded(&x, 3, 2, 1)?;
        for stage in &self.stages {
            for block in stage {
                x = block.forward_t(&x, train)?;
            }
        }
        // Global average pool → (batch, channels).
        let x = x.mean(D::Minus1)?.mean(D::Minus1)?;
        self.fc.forward(&x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn depth_presets() {
        let depth = |c: ResNetConfig| {
            let per_block = if c.bottleneck { 3 } else { 2 };
            c.layers.iter().sum::<usize>() * per_block + 2
        };
        assert_eq!(depth(ResNetConfig::resnet18()), 18);
        assert_eq!(depth(ResNetConfig::resnet34()), 34);
        assert_eq!(depth(ResNetConfig::resnet50()), 50);
        assert_eq!(depth(ResNetConfig::resnet101()), 101);
        assert_eq!(depth(ResNetConfig::resnet152()), 152);
        assert!(!ResNetConfig::resnet34().bottleneck);
        assert!(ResNetConfig::resnet50().bottleneck);
    }

    #[test]
    fn resnet18_logits_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = ResNet::new(&ResNetConfig::resnet18(), 10, vb).unwrap();
        let x = Tensor::zeros((2, 3, 64, 64), DType::F32, &Device::Cpu).unwrap();
        let logits = model.forward_t(&x, false).unwrap();
        assert_eq!(logits.dims(), &[2, 10]);
    }

    #[test]
    fn torchvision_parameter_names() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        ResNet::new(&ResNetConfig::resnet18(), 10, vb).unwrap();
        let data = varmap.data().lock().unwrap();
        for name in [
            "conv1.weight",
            "bn1.weight",
            "layer1.0.conv2.weight",
            "layer2.0.downsample.0.weight",
            "layer4.1.bn2.bias",
            "fc.weight",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        assert!(!data.contains_key("layer1.0.downsample.0.weight"));
        assert!(!data.contains_key("layer1.0.conv3.weight"));
    }

    #[test]
    fn bottleneck_expands_channels() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = ResNetConfig {
            bottleneck: true,
            layers: [1, 1, 1, 1],
        };
        ResNet::new(&config, 3, vb).unwrap();
        let data = varmap.data().lock().unwrap();
        // Stage 1 goes 64 → 256, so even stride 1 needs a projection.
        assert!(data.contains_key("layer1.0.downsample.0.weight"));
        assert_eq!(data["fc.weight"].as_tensor().dims(), &[3, 2048]);
    }
}
