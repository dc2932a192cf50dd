//! AlexNet (torchvision variant, 64-192-384-256-256 channels).

use candle_core::{Result, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Dropout, Linear, Module, ModuleT, VarBuilder};

use crate::pool::adaptive_avg_pool2d;

pub struct AlexNet {
    convs: Vec<Conv2d>,
    fc1: Linear,
    fc2: Linear,
    fc3: Linear,
    dropout: Dropout,
}

impl AlexNet {
    pub fn new(num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let fvb = vb.pp("features");
        // (module index, in, out, kernel, stride, padding)
        let layers = [
            (0, 3, 64, 11, 4, 2),
            (3, 64, 192, 5, 1, 2),
            (6, 192, 384, 3, 1, 1),
            (8, 384, 256, 3, 1, 1),
            (10, 256, 256, 3, 1, 1),
        ];
        let convs = layers
            .iter()
            .map(|&(idx, in_c, out_c, k, stride, padding)| {
                let cfg = Conv2dConfig {
                    padding,
                    stride,
                    ..Default::default()
                };
                conv2d(in_c, out_c, k, cfg, fvb.pp(idx.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let cvb = vb.pp("classifier");
        Ok(Self {
            convs,
            fc1: linear(256 * 6 * 6, 4096, cvb.pp("1"))?,
            fc2: linear(4096, 4096, cvb.pp("4"))?,
            fc3: linear(4096, num_classes, cvb.pp("6"))?,
            dropout: Dropout::new(0.5),
        })
    }
}

impl ModuleT for AlexNet {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = x.clone();
        for (i, conv) in self.convs.iter().enumerate() {
            x = x.apply(conv)?.relu()?;
            // Max-pool after conv 1, 2 and 5.
            if matches!(i, 0 | 1 | 4) {
                x = x.max_pool2d_with_stride(3, 2)?;
            }
        }
        let x = adaptive_avg_pool2d(&x, 6)?.flatten_from(1)?;
        let x = x.apply_t(&self.dropout, train)?;
        let x = self.fc1.forward(&x)?.relu()?.apply_t(&self.dropout, train)?;
        let x = self.fc2.forward(&x)?.relu()?;
        self.fc3.forward(&x)
    }
}
