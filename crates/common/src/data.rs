//! Batch source: seeded, class-conditional synthetic images.
//!
//! Each class owns a fixed binary template drawn once from the seed; a sample
//! is its class template plus uniform noise. The task is learnable but not
//! trivial, which is enough to drive the binarized training loop end to end
//! without any dataset files.
//!
//! Batches are flat `(images, labels)` vectors; [`batch_to_tensors`] turns
//! them into `(B, C, S, S)` / `(B,)` Candle tensors.

use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ── SyntheticDigits ─────────────────────────────────────────────────────────

/// Deterministic in-memory image classification set.
///
/// Sample `i` is a pure function of `(seed, i)`, so train and validation
/// splits are just two instances with different seeds over the same templates.
#[derive(Debug, Clone)]
pub struct SyntheticDigits {
    templates: Vec<Vec<f32>>,
    channels: usize,
    side: usize,
    len: usize,
    noise: f32,
    seed: u64,
}

impl SyntheticDigits {
    /// `template_seed` fixes the class templates; `seed` fixes the noise and
    /// label order.
    pub fn new(
        num_classes: usize,
        channels: usize,
        side: usize,
        len: usize,
        noise: f32,
        template_seed: u64,
        seed: u64,
    ) -> Self {
        let image_len = channels * side * side;
        let mut rng = StdRng::seed_from_u64(template_seed);
        let templates = (0..num_classes)
            .map(|_| {
                (0..image_len)
                    .map(|_| if rng.gen_bool(0.3) { 1.0 } else { 0.0 })
                    .collect()
            })
            .collect();
        Self {
            templates,
            channels,
            side,
            len,
            noise: noise.abs(),
            seed,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_classes(&self) -> usize {
        self.templates.len()
    }

    /// Flattened pixel count of one image.
    pub fn image_len(&self) -> usize {
        self.channels * self.side * self.side
    }

    /// Image pixels and label of sample `index`.
    pub fn sample(&self, index: usize) -> (Vec<f32>, u32) {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(index as u64));
        let label = rng.gen_range(0..self.templates.len());
        let image = self.templates[label]
            .iter()
            .map(|&p| p + rng.gen_range(-self.noise..=self.noise))
            .collect();
        (image, label as u32)
    }

    /// Yield `(images, labels)` batches of exactly `batch_size` samples; a
    /// trailing partial batch is dropped.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = (Vec<f32>, Vec<u32>)> + '_ {
        let mut start = 0usize;
        std::iter::from_fn(move || {
            if batch_size == 0 || start + batch_size > self.len {
                return None;
            }
            let mut images = Vec::with_capacity(batch_size * self.image_len());
            let mut labels = Vec::with_capacity(batch_size);
            for i in start..start + batch_size {
                let (img, label) = self.sample(i);
                images.extend(img);
                labels.push(label);
            }
            start += batch_size;
            Some((images, labels))
        })
    }
}

// ── Tensor conversion ───────────────────────────────────────────────────────

/// Convert a flat batch into `(B, C, S, S)` f32 images and `(B,)` u32 labels.
pub fn batch_to_tensors(
    images: &[f32],
    labels: &[u32],
    channels: usize,
    side: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let batch_size = labels.len();
    let images = Tensor::from_vec(images.to_vec(), (batch_size, channels, side, side), device)?;
    let labels = Tensor::from_vec(labels.to_vec(), batch_size, device)?;
    Ok((images, labels))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn digits(seed: u64) -> SyntheticDigits {
        SyntheticDigits::new(10, 1, 8, 20, 0.1, 7, seed)
    }

    #[test]
    fn samples_are_deterministic() {
        let a = digits(1);
        let b = digits(1);
        assert_eq!(a.sample(3), b.sample(3));
    }

    #[test]
    fn splits_share_templates() {
        let train = digits(1);
        let val = digits(99);
        assert_eq!(train.templates, val.templates);
    }

    #[test]
    fn noise_stays_in_band() {
        let ds = digits(5);
        for i in 0..ds.len() {
            let (img, label) = ds.sample(i);
            assert!((label as usize) < ds.num_classes());
            for (&p, &t) in img.iter().zip(&ds.templates[label as usize]) {
                assert!((p - t).abs() <= 0.1 + 1e-6);
            }
        }
    }

    #[test]
    fn batches_drop_partial_tail() {
        let ds = digits(2);
        let batches: Vec<_> = ds.batches(6).collect();
        assert_eq!(batches.len(), 3);
        for (images, labels) in &batches {
            assert_eq!(labels.len(), 6);
            assert_eq!(images.len(), 6 * ds.image_len());
        }
    }

    #[test]
    fn batch_to_tensors_shapes() {
        let ds = digits(3);
        let (images, labels) = ds.batches(4).next().unwrap();
        let (x, y) = batch_to_tensors(&images, &labels, 1, 8, &Device::Cpu).unwrap();
        assert_eq!(x.dims(), &[4, 1, 8, 8]);
        assert_eq!(y.dims(), &[4]);
    }
}
