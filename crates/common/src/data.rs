//! Batch sources for training and validation.
//!
//! * **[`BatchSource`]** — anything that yields `(images, labels)` batches with
//!   a known length, so the trainer can size its schedule up front.
//! * **[`SyntheticImages`]** — a fixed batch of zero images repeated
//!   `sample_count` times. Used for throughput benchmarking; no disk I/O.

use candle_core::{DType, Device, Result, Tensor};

// ── BatchSource trait ───────────────────────────────────────────────────────

/// Common interface for loaders that yield `(images, labels)` batches.
///
/// Images are `(batch, 3, img_dim, img_dim)` f32; labels are `(batch,)` u32.
pub trait BatchSource {
    /// Number of batches one pass yields.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Images per batch.
    fn batch_size(&self) -> usize;

    fn batches(&self) -> Box<dyn Iterator<Item = Result<(Tensor, Tensor)>> + '_>;
}

// ── SyntheticImages ─────────────────────────────────────────────────────────

/// Repeats one pre-built batch. Cloning a tensor only bumps a reference count,
/// so every pass is allocation-free after construction.
pub struct SyntheticImages {
    data: Tensor,
    target: Tensor,
    sample_count: usize,
}

impl SyntheticImages {
    /// All-zero images of side `img_dim` with label 0, `sample_count` batches per pass.
    pub fn zeros(
        batch_size: usize,
        img_dim: usize,
        sample_count: usize,
        device: &Device,
    ) -> Result<Self> {
        let data = Tensor::zeros((batch_size, 3, img_dim, img_dim), DType::F32, device)?;
        let target = Tensor::zeros(batch_size, DType::U32, device)?;
        Ok(Self::new(data, target, sample_count))
    }

    /// Repeat an arbitrary `(data, target)` batch.
    pub fn new(data: Tensor, target: Tensor, sample_count: usize) -> Self {
        Self {
            data,
            target,
            sample_count,
        }
    }
}

impl BatchSource for SyntheticImages {
    fn len(&self) -> usize {
        self.sample_count
    }

    fn batch_size(&self) -> usize {
        self.data.dims().first().copied().unwrap_or(0)
    }

    fn batches(&self) -> Box<dyn Iterator<Item = Result<(Tensor, Tensor)>> + '_> {
        Box::new(
            std::iter::repeat_with(move || Ok((self.data.clone(), self.target.clone())))
                .take(self.sample_count),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_sample_count_batches_of_the_right_shape() {
        let source = SyntheticImages::zeros(4, 8, 3, &Device::Cpu).unwrap();
        assert_eq!(source.len(), 3);
        assert_eq!(source.batch_size(), 4);

        let batches: Vec<_> = source.batches().collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 3);
        let (data, target) = &batches[0];
        assert_eq!(data.dims(), &[4, 3, 8, 8]);
        assert_eq!(target.dims(), &[4]);
        assert_eq!(target.dtype(), DType::U32);
    }

    #[test]
    fn every_pass_restarts() {
        let source = SyntheticImages::zeros(1, 2, 5, &Device::Cpu).unwrap();
        assert_eq!(source.batches().count(), 5);
        assert_eq!(source.batches().count(), 5);
    }

    #[test]
    fn empty_source() {
        let source = SyntheticImages::zeros(2, 2, 0, &Device::Cpu).unwrap();
        assert!(source.is_empty());
        assert_eq!(source.batches().count(), 0);
    }
}
