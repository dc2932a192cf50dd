//! Pooling helpers missing from `candle-core`: padded, ceil-mode and
//! adaptive variants of 2-D pooling over `(batch, channels, h, w)` tensors.

use candle_core::{Error, Result, Tensor, D};

/// Max-pool with symmetric `pad`.
///
/// Padding replicates the border, which leaves the maximum of every window
/// unchanged, so it is equivalent to padding with `-inf`.
pub fn max_pool2d_padded(x: &Tensor, kernel: usize, stride: usize, pad: usize) -> Result<Tensor> {
    let x = if pad > 0 {
        x.pad_with_same(D::Minus1, pad, pad)?
            .pad_with_same(D::Minus2, pad, pad)?
    } else {
        x.clone()
    };
    x.max_pool2d_with_stride(kernel, stride)
}

/// Average-pool with symmetric zero `pad`; padded cells count towards the mean.
pub fn avg_pool2d_padded(x: &Tensor, kernel: usize, stride: usize, pad: usize) -> Result<Tensor> {
    let x = if pad > 0 {
        x.pad_with_zeros(D::Minus1, pad, pad)?
            .pad_with_zeros(D::Minus2, pad, pad)?
    } else {
        x.clone()
    };
    x.avg_pool2d_with_stride(kernel, stride)
}

/// Max-pool with ceil rounding of the output size.
pub fn max_pool2d_ceil(x: &Tensor, kernel: usize, stride: usize) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    let x = x
        .pad_with_same(D::Minus2, 0, ceil_padding(h, kernel, stride))?
        .pad_with_same(D::Minus1, 0, ceil_padding(w, kernel, stride))?;
    x.max_pool2d_with_stride(kernel, stride)
}

/// Trailing padding that makes floor-mode pooling produce the ceil-mode size.
fn ceil_padding(len: usize, kernel: usize, stride: usize) -> usize {
    if len <= kernel {
        return kernel - len;
    }
    let out = (len - kernel).div_ceil(stride) + 1;
    (out - 1) * stride + kernel - len
}

/// Average-pool to an `out × out` grid.
///
/// Only exact divisions are supported; the architectures here always reach
/// these layers at a multiple of the target size.
pub fn adaptive_avg_pool2d(x: &Tensor, out: usize) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    if h == out && w == out {
        return Ok(x.clone());
    }
    if out == 1 {
        return x.mean_keepdim(D::Minus1)?.mean_keepdim(D::Minus2);
    }
    if h % out != 0 || w % out != 0 {
        return Err(Error::Msg(format!(
            "adaptive_avg_pool2d: {h}x{w} is not a multiple of {out}x{out}"
        )));
    }
    let (kh, kw) = (h / out, w / out);
    x.avg_pool2d_with_stride((kh, kw), (kh, kw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn ceil_padding_matches_ceil_mode_sizes() {
        // 55 → 27 in both modes.
        assert_eq!(ceil_padding(55, 3, 2), 0);
        // 54 → 27 in ceil mode (26 in floor mode).
        assert_eq!(ceil_padding(54, 3, 2), 1);
        assert_eq!(ceil_padding(2, 3, 2), 1);
    }

    #[test]
    fn ceil_mode_output_size() {
        let x = Tensor::zeros((1, 2, 54, 54), DType::F32, &Device::Cpu).unwrap();
        let y = max_pool2d_ceil(&x, 3, 2).unwrap();
        assert_eq!(y.dims(), &[1, 2, 27, 27]);
    }

    #[test]
    fn padded_pool_keeps_maximum() {
        let x = Tensor::arange(0f32, 16., &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 4, 4))
            .unwrap();
        let y = max_pool2d_padded(&x, 3, 2, 1).unwrap();
        assert_eq!(y.dims(), &[1, 1, 2, 2]);
        let v: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(v, vec![5., 7., 13., 15.]);
    }

    #[test]
    fn padded_average_counts_the_border() {
        let x = Tensor::ones((1, 1, 3, 3), DType::F32, &Device::Cpu).unwrap();
        let y = avg_pool2d_padded(&x, 3, 1, 1).unwrap();
        assert_eq!(y.dims(), &[1, 1, 3, 3]);
        let v: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        // Corners see 4 of 9 cells, edges 6, the centre all 9.
        let expected = [4., 6., 4., 6., 9., 6., 4., 6., 4.].map(|n: f32| n / 9.0);
        for (got, want) in v.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{got} != {want}");
        }
    }

    #[test]
    fn adaptive_pool_averages_blocks() {
        let x = Tensor::arange(0f32, 16., &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 4, 4))
            .unwrap();
        let y = adaptive_avg_pool2d(&x, 2).unwrap();
        let v: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(v, vec![2.5, 4.5, 10.5, 12.5]);

        let g = adaptive_avg_pool2d(&x, 1).unwrap();
        assert_eq!(g.dims(), &[1, 1, 1, 1]);
        let mean: f32 = g.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0];
        assert!((mean - 7.5).abs() < 1e-6);
    }

    #[test]
    fn adaptive_pool_rejects_uneven_grid() {
        let x = Tensor::zeros((1, 1, 5, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(adaptive_avg_pool2d(&x, 2).is_err());
    }
}
