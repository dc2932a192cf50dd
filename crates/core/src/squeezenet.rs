//! SqueezeNet 1.0 and 1.1.

use candle_core::{Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Dropout, Module, ModuleT, VarBuilder};

use crate::pool::{adaptive_avg_pool2d, max_pool2d_ceil};

/// Squeeze (1×1) followed by concatenated 1×1 and 3×3 expands.
struct Fire {
    squeeze: Conv2d,
    expand1x1: Conv2d,
    expand3x3: Conv2d,
}

impl Fire {
    fn new(in_c: usize, squeeze: usize, e1: usize, e3: usize, vb: VarBuilder) -> Result<Self> {
        let pad1 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            squeeze: conv2d(in_c, squeeze, 1, Default::default(), vb.pp("squeeze"))?,
            expand1x1: conv2d(squeeze, e1, 1, Default::default(), vb.pp("expand1x1"))?,
            expand3x3: conv2d(squeeze, e3, 3, pad1, vb.pp("expand3x3"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let s = self.squeeze.forward(x)?.relu()?;
        let a = self.expand1x1.forward(&s)?.relu()?;
        let b = self.expand3x3.forward(&s)?.relu()?;
        Tensor::cat(&[&a, &b], 1)
    }
}

enum Layer {
    Stem(Conv2d),
    Pool,
    Fire(Fire),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqueezeNetVersion {
    V1_0,
    V1_1,
}

pub struct SqueezeNet {
    features: Vec<Layer>,
    final_conv: Conv2d,
    dropout: Dropout,
}

impl SqueezeNet {
    pub fn new(version: SqueezeNetVersion, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let fvb = vb.pp("features");
        let fire =
            |idx: usize, in_c, s, e1, e3| Fire::new(in_c, s, e1, e3, fvb.pp(idx.to_string()));

        let features = match version {
            SqueezeNetVersion::V1_0 => {
                let stem = conv2d(
                    3,
                    96,
                    7,
                    Conv2dConfig {
                        stride: 2,
                        ..Default::default()
                    },
                    fvb.pp("0"),
                )?;
                vec![
                    Layer::Stem(stem),
                    Layer::Pool,
                    Layer::Fire(fire(3, 96, 16, 64, 64)?),
                    Layer::Fire(fire(4, 128, 16, 64, 64)?),
                    Layer::Fire(fire(5, 128, 32, 128, 128)?),
                    Layer::Pool,
                    Layer::Fire(fire(7, 256, 32, 128, 128)?),
                    Layer::Fire(fire(8, 256, 48, 192, 192)?),
                    Layer::Fire(fire(9, 384, 48, 192, 192)?),
                    Layer::Fire(fire(10, 384, 64, 256, 256)?),
                    Layer::Pool,
                    Layer::Fire(fire(12, 512, 64, 256, 256)?),
                ]
            }
            SqueezeNetVersion::V1_1 => {
                let stem = conv2d(
                    3,
                    64,
                    3,
                    Conv2dConfig {
                        stride: 2,
                        ..Default::default()
                    },
                    fvb.pp("0"),
                )?;
                vec![
                    Layer::Stem(stem),
                    Layer::Pool,
                    Layer::Fire(fire(3, 64, 16, 64, 64)?),
                    Layer::Fire(fire(4, 128, 16, 64, 64)?),
                    Layer::Pool,
                    Layer::Fire(fire(6, 128, 32, 128, 128)?),
                    Layer::Fire(fire(7, 256, 32, 128, 128)?),
                    Layer::Pool,
                    Layer::Fire(fire(9, 256, 48, 192, 192)?),
                    Layer::Fire(fire(10, 384, 48, 192, 192)?),
                    Layer::Fire(fire(11, 384, 64, 256, 256)?),
                    Layer::Fire(fire(12, 512, 64, 256, 256)?),
                ]
            }
        };

        let final_conv = conv2d(512, num_classes, 1, Default::default(), vb.pp("classifier.1"))?;
        Ok(Self {
            features,
            final_conv,
            dropout: Dropout::new(0.5),
        })
    }
}

impl ModuleT for SqueezeNet {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in &self.features {
            x = match layer {
                Layer::Stem(conv) => conv.forward(&x)?.relu()?,
                Layer::Pool => max_pool2d_ceil(&x, 3, 2)?,
                Layer::Fire(fire) => fire.forward(&x)?,
            };
        }
        let x = x.apply_t(&self.dropout, train)?;
        let x = self.final_conv.forward(&x)?.relu()?;
        adaptive_avg_pool2d(&x, 1)?.flatten_from(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn squeezenet1_1_logits_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = SqueezeNet::new(SqueezeNetVersion::V1_1, 7, vb).unwrap();
        let x = Tensor::zeros((1, 3, 224, 224), DType::F32, &Device::Cpu).unwrap();
        let logits = model.forward_t(&x, false).unwrap();
        assert_eq!(logits.dims(), &[1, 7]);
    }
}
