//! Inception v3, without the auxiliary classifier.
//!
//! Expects 299×299 inputs (anything from 75×75 up works). Parameter names
//! follow torchvision (`Conv2d_1a_3x3.conv`, `Mixed_5b.branch5x5_1.bn`, `fc`).

use candle_core::{Result, Tensor, D};
use candle_nn::{batch_norm, init, linear, BatchNorm, Dropout, Linear, Module, ModuleT, VarBuilder};

use crate::pool::avg_pool2d_padded;

/// Conv (no bias) → BN → ReLU, with separate kernel height and width.
struct BasicConv2d {
    weight: Tensor,
    bn: BatchNorm,
    stride: usize,
    padding: (usize, usize),
}

impl BasicConv2d {
    fn new(
        in_c: usize,
        out_c: usize,
        kernel: (usize, usize),
        stride: usize,
        padding: (usize, usize),
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.pp("conv").get_with_hints(
            (out_c, in_c, kernel.0, kernel.1),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        Ok(Self {
            weight,
            bn: batch_norm(out_c, 1e-3, vb.pp("bn"))?,
            stride,
            padding,
        })
    }

    /// Square kernel, stride 1.
    fn square(in_c: usize, out_c: usize, k: usize, pad: usize, vb: VarBuilder) -> Result<Self> {
        Self::new(in_c, out_c, (k, k), 1, (pad, pad), vb)
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (ph, pw) = self.padding;
        let x = if ph > 0 || pw > 0 {
            x.pad_with_zeros(D::Minus2, ph, ph)?
                .pad_with_zeros(D::Minus1, pw, pw)?
        } else {
            x.clone()
        };
        x.conv2d(&self.weight, 0, self.stride, 1, 1)?
            .apply_t(&self.bn, train)?
            .relu()
    }
}

/// Runs `x` through each conv in turn.
fn chain(convs: &[BasicConv2d], x: &Tensor, train: bool) -> Result<Tensor> {
    let mut x = x.clone();
    for c in convs {
        x = c.forward_t(&x, train)?;
    }
    Ok(x)
}

fn avg_pool_3x3(x: &Tensor) -> Result<Tensor> {
    avg_pool2d_padded(x, 3, 1, 1)
}

// ── Mixed blocks ────────────────────────────────────────────────────────────

/// 35×35 block: 1×1, 5×5, double 3×3 and pooled branches.
struct InceptionA {
    branch1x1: BasicConv2d,
    branch5x5: [BasicConv2d; 2],
    branch3x3dbl: [BasicConv2d; 3],
    branch_pool: BasicConv2d,
}

impl InceptionA {
    fn new(in_c: usize, pool_features: usize, vb: VarBuilder) -> Result<Self> {
        let c = |i, o, k, p, name: &str| BasicConv2d::square(i, o, k, p, vb.pp(name));
        Ok(Self {
            branch1x1: c(in_c, 64, 1, 0, "branch1x1")?,
            branch5x5: [
                c(in_c, 48, 1, 0, "branch5x5_1")?,
                c(48, 64, 5, 2, "branch5x5_2")?,
            ],
            branch3x3dbl: [
                c(in_c, 64, 1, 0, "branch3x3dbl_1")?,
                c(64, 96, 3, 1, "branch3x3dbl_2")?,
                c(96, 96, 3, 1, "branch3x3dbl_3")?,
            ],
            branch_pool: c(in_c, pool_features, 1, 0, "branch_pool")?,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let a = self.branch1x1.forward_t(x, train)?;
        let b = chain(&self.branch5x5, x, train)?;
        let c = chain(&self.branch3x3dbl, x, train)?;
        let d = self.branch_pool.forward_t(&avg_pool_3x3(x)?, train)?;
        Tensor::cat(&[a, b, c, d], 1)
    }
}

/// Grid reduction 35×35 → 17×17.
struct InceptionB {
    branch3x3: BasicConv2d,
    branch3x3dbl: [BasicConv2d; 3],
}

impl InceptionB {
    fn new(in_c: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            branch3x3: BasicConv2d::new(in_c, 384, (3, 3), 2, (0, 0), vb.pp("branch3x3"))?,
            branch3x3dbl: [
                BasicConv2d::square(in_c, 64, 1, 0, vb.pp("branch3x3dbl_1"))?,
                BasicConv2d::square(64, 96, 3, 1, vb.pp("branch3x3dbl_2"))?,
                BasicConv2d::new(96, 96, (3, 3), 2, (0, 0), vb.pp("branch3x3dbl_3"))?,
            ],
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let a = self.branch3x3.forward_t(x, train)?;
        let b = chain(&self.branch3x3dbl, x, train)?;
        let c = x.max_pool2d_with_stride(3, 2)?;
        Tensor::cat(&[a, b, c], 1)
    }
}

/// 17×17 block with factorised 7×7 convolutions.
struct InceptionC {
    branch1x1: BasicConv2d,
    branch7x7: [BasicConv2d; 3],
    branch7x7dbl: [BasicConv2d; 5],
    branch_pool: BasicConv2d,
}

impl InceptionC {
    fn new(in_c: usize, c7: usize, vb: VarBuilder) -> Result<Self> {
        let row = |i, o, name: &str| BasicConv2d::new(i, o, (1, 7), 1, (0, 3), vb.pp(name));
        let col = |i, o, name: &str| BasicConv2d::new(i, o, (7, 1), 1, (3, 0), vb.pp(name));
        Ok(Self {
            branch1x1: BasicConv2d::square(in_c, 192, 1, 0, vb.pp("branch1x1"))?,
            branch7x7: [
                BasicConv2d::square(in_c, c7, 1, 0, vb.pp("branch7x7_1"))?,
                row(c7, c7, "branch7x7_2")?,
                col(c7, 192, "branch7x7_3")?,
            ],
            branch7x7dbl: [
                BasicConv2d::square(in_c, c7, 1, 0, vb.pp("branch7x7dbl_1"))?,
                col(c7, c7, "branch7x7dbl_2")?,
                row(c7, c7, "branch7x7dbl_3")?,
                col(c7, c7, "branch7x7dbl_4")?,
                row(c7, 192, "branch7x7dbl_5")?,
            ],
            branch_pool: BasicConv2d::square(in_c, 192, 1, 0, vb.pp("branch_pool"))?,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let a = self.branch1x1.forward_t(x, train)?;
        let b = chain(&self.branch7x7, x, train)?;
        let c = chain(&self.branch7x7dbl, x, train)?;
        let d = self.branch_pool.forward_t(&avg_pool_3x3(x)?, train)?;
        Tensor::cat(&[a, b, c, d], 1)
    }
}

/// Grid reduction 17×17 → 8×8.
struct InceptionD {
    branch3x3: [BasicConv2d; 2],
    branch7x7x3: [BasicConv2d; 4],
}

impl InceptionD {
    fn new(in_c: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            branch3x3: [
                BasicConv2d::square(in_c, 192, 1, 0, vb.pp("branch3x3_1"))?,
                BasicConv2d::new(192, 320, (3, 3), 2, (0, 0), vb.pp("branch3x3_2"))?,
            ],
            branch7x7x3: [
                BasicConv2d::square(in_c, 192, 1, 0, vb.pp("branch7x7x3_1"))?,
                BasicConv2d::new(192, 192, (1, 7), 1, (0, 3), vb.pp("branch7x7x3_2"))?,
                BasicConv2d::new(192, 192, (7, 1), 1, (3, 0), vb.pp("branch7x7x3_3"))?,
                BasicConv2d::new(192, 192, (3, 3), 2, (0, 0), vb.pp("branch7x7x3_4"))?,
            ],
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let a = chain(&self.branch3x3, x, train)?;
        let b = chain(&self.branch7x7x3, x, train)?;
        let c = x.max_pool2d_with_stride(3, 2)?;
        Tensor::cat(&[a, b, c], 1)
    }
}

/// 8×8 block whose 3×3 branches split into parallel 1×3 and 3×1 halves.
struct InceptionE {
    branch1x1: BasicConv2d,
    branch3x3_1: BasicConv2d,
    branch3x3_2: [BasicConv2d; 2],
    branch3x3dbl: [BasicConv2d; 2],
    branch3x3dbl_3: [BasicConv2d; 2],
    branch_pool: BasicConv2d,
}

impl InceptionE {
    fn new(in_c: usize, vb: VarBuilder) -> Result<Self> {
        let split = |i, prefix: &str| -> Result<[BasicConv2d; 2]> {
            Ok([
                BasicConv2d::new(i, 384, (1, 3), 1, (0, 1), vb.pp(format!("{prefix}a")))?,
                BasicConv2d::new(i, 384, (3, 1), 1, (1, 0), vb.pp(format!("{prefix}b")))?,
            ])
        };
        Ok(Self {
            branch1x1: BasicConv2d::square(in_c, 320, 1, 0, vb.pp("branch1x1"))?,
            branch3x3_1: BasicConv2d::square(in_c, 384, 1, 0, vb.pp("branch3x3_1"))?,
            branch3x3_2: split(384, "branch3x3_2")?,
            branch3x3dbl: [
                BasicConv2d::square(in_c, 448, 1, 0, vb.pp("branch3x3dbl_1"))?,
                BasicConv2d::square(448, 384, 3, 1, vb.pp("branch3x3dbl_2"))?,
            ],
            branch3x3dbl_3: split(384, "branch3x3dbl_3")?,
            branch_pool: BasicConv2d::square(in_c, 192, 1, 0, vb.pp("branch_pool"))?,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let halves = |convs: &[BasicConv2d; 2], x: &Tensor| -> Result<Tensor> {
            let a = convs[0].forward_t(x, train)?;
            let b = convs[1].forward_t(x, train)?;
            Tensor::cat(&[a, b], 1)
        };
        let a = self.branch1x1.forward_t(x, train)?;
        let b = halves(&self.branch3x3_2, &self.branch3x3_1.forward_t(x, train)?)?;
        let c = halves(&self.branch3x3dbl_3, &chain(&self.branch3x3dbl, x, train)?)?;
        let d = self.branch_pool.forward_t(&avg_pool_3x3(x)?, train)?;
        Tensor::cat(&[a, b, c, d], 1)
    }
}

// ── Inception v3 ────────────────────────────────────────────────────────────

enum Mixed {
    A(InceptionA),
    B(InceptionB),
    C(InceptionC),
    D(InceptionD),
    E(InceptionE),
}

impl Mixed {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::A(m) => m.forward_t(x, train),
            Self::B(m) => m.forward_t(x, train),
            Self::C(m) => m.forward_t(x, train),
            Self::D(m) => m.forward_t(x, train),
            Self::E(m) => m.forward_t(x, train),
        }
    }
}

pub struct InceptionV3 {
    /// `Conv2d_1a_3x3` .. `Conv2d_2b_3x3`, then max pool.
    stem1: Vec<BasicConv2d>,
    /// `Conv2d_3b_1x1`, `Conv2d_4a_3x3`, then max pool.
    stem2: Vec<BasicConv2d>,
    mixed: Vec<Mixed>,
    dropout: Dropout,
    fc: Linear,
}

impl InceptionV3 {
    pub fn new(num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let stem1 = vec![
            BasicConv2d::new(3, 32, (3, 3), 2, (0, 0), vb.pp("Conv2d_1a_3x3"))?,
            BasicConv2d::square(32, 32, 3, 0, vb.pp("Conv2d_2a_3x3"))?,
            BasicConv2d::square(32, 64, 3, 1, vb.pp("Conv2d_2b_3x3"))?,
        ];
        let stem2 = vec![
            BasicConv2d::square(64, 80, 1, 0, vb.pp("Conv2d_3b_1x1"))?,
            BasicConv2d::square(80, 192, 3, 0, vb.pp("Conv2d_4a_3x3"))?,
        ];
        let mixed = vec![
            Mixed::A(InceptionA::new(192, 32, vb.pp("Mixed_5b"))?),
            Mixed::A(InceptionA::new(256, 64, vb.pp("Mixed_5c"))?),
            Mixed::A(InceptionA::new(288, 64, vb.pp("Mixed_5d"))?),
            Mixed::B(InceptionB::new(288, vb.pp("Mixed_6a"))?),
            Mixed::C(InceptionC::new(768, 128, vb.pp("Mixed_6b"))?),
            Mixed::C(InceptionC::new(768, 160, vb.pp("Mixed_6c"))?),
            Mixed::C(InceptionC::new(768, 160, vb.pp("Mixed_6d"))?),
            Mixed::C(InceptionC::new(768, 192, vb.pp("Mixed_6e"))?),
            Mixed::D(InceptionD::new(768, vb.pp("Mixed_7a"))?),
            Mixed::E(InceptionE::new(1280, vb.pp("Mixed_7b"))?),
            Mixed::E(InceptionE::new(2048, vb.pp("Mixed_7c"))?),
        ];
        Ok(Self {
            stem1,
            stem2,
            mixed,
            dropout: Dropout::new(0.5),
            fc: linear(2048, num_classes, vb.pp("fc"))?,
        })
    }
}

impl ModuleT for InceptionV3 {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = chain(&self.stem1, x, train)?.max_pool2d_with_stride(3, 2)?;
        let mut x = chain(&self.stem2, &x, train)?.max_pool2d_with_stride(3, 2)?;
        for m in &self.mixed {
            x = m.forward_t(&x, train)?;
        }
        let x = x.mean(D::Minus1)?.mean(D::Minus1)?;
        let x = x.apply_t(&self.dropout, train)?;
        self.fc.forward(&x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn rectangular_kernels_keep_the_grid() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let row = BasicConv2d::new(4, 6, (1, 7), 1, (0, 3), vb.pp("row")).unwrap();
        let col = BasicConv2d::new(6, 2, (7, 1), 1, (3, 0), vb.pp("col")).unwrap();
        let x = Tensor::ones((1, 4, 9, 11), DType::F32, &Device::Cpu).unwrap();
        let y = col.forward_t(&row.forward_t(&x, false).unwrap(), false).unwrap();
        assert_eq!(y.dims(), &[1, 2, 9, 11]);
        let data = varmap.data().lock().unwrap();
        assert_eq!(data["row.conv.weight"].as_tensor().dims(), &[6, 4, 1, 7]);
        assert!(!data.contains_key("row.conv.bias"));
    }

    #[test]
    fn mixed_block_widths() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let dev = &Device::Cpu;

        let a = InceptionA::new(8, 16, vb.pp("a")).unwrap();
        let x = Tensor::zeros((1, 8, 5, 5), DType::F32, dev).unwrap();
        // 64 + 64 + 96 + pool_features.
        assert_eq!(a.forward_t(&x, false).unwrap().dims(), &[1, 240, 5, 5]);

        let b = InceptionB::new(8, vb.pp("b")).unwrap();
        let x = Tensor::zeros((1, 8, 7, 7), DType::F32, dev).unwrap();
        assert_eq!(b.forward_t(&x, false).unwrap().dims(), &[1, 384 + 96 + 8, 3, 3]);

        let e = InceptionE::new(8, vb.pp("e")).unwrap();
        let x = Tensor::zeros((1, 8, 3, 3), DType::F32, dev).unwrap();
        assert_eq!(e.forward_t(&x, false).unwrap().dims(), &[1, 2048, 3, 3]);
    }

    #[test]
    fn inception_v3_smallest_input() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = InceptionV3::new(7, vb).unwrap();
        {
            let data = varmap.data().lock().unwrap();
            for name in [
                "Conv2d_1a_3x3.conv.weight",
                "Conv2d_4a_3x3.bn.running_var",
                "Mixed_5b.branch_pool.conv.weight",
                "Mixed_6e.branch7x7dbl_5.conv.weight",
                "Mixed_7c.branch3x3dbl_3b.bn.weight",
                "fc.weight",
            ] {
                assert!(data.contains_key(name), "missing {name}");
            }
            assert!(data.keys().all(|k| !k.starts_with("AuxLogits")));
        }
        let x = Tensor::zeros((1, 3, 75, 75), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.forward_t(&x, false).unwrap().dims(), &[1, 7]);
    }
}
