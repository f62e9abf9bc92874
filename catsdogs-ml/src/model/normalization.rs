//! Input normalization adapted from sampled training batches.

use crate::data::ImageDataset;
use crate::error::MlError;
use burn::tensor::Tensor;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

/// Upper bound on batches sampled when adapting the statistics.
pub const MAX_ADAPT_BATCHES: usize = 1000;

const EPSILON: f64 = 1e-7;

/// Mean/variance of the pixel intensities, applied as `(x - mean) / std`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: f64,
    pub variance: f64,
    /// Pixels the statistics were computed from.
    pub count: u64,
}

impl Normalization {
    /// Compute statistics from up to [`MAX_ADAPT_BATCHES`] batches of a fresh
    /// stream over `dataset`, labels ignored. The stream repeats, so sampling
    /// stops after one full pass; further passes would not move the result.
    pub fn adapt(dataset: &ImageDataset) -> Result<Self, MlError> {
        let batches = dataset.batches_per_pass().min(MAX_ADAPT_BATCHES);
        let mut stats = Self {
            mean: 0.0,
            variance: 0.0,
            count: 0,
        };
        let mut m2 = 0.0;

        for batch in dataset.iter().take(batches) {
            for &pixel in &batch?.images {
                stats.count += 1;
                let x = f64::from(pixel);
                let delta = x - stats.mean;
                stats.mean += delta / stats.count as f64;
                m2 += delta * (x - stats.mean);
            }
        }

        if stats.count == 0 {
            return Err(MlError::dataset(
                "cannot adapt normalization: training stream is empty",
            ));
        }
        stats.variance = m2 / stats.count as f64;
        Ok(stats)
    }

    pub fn std(&self) -> f64 {
        self.variance.max(0.0).sqrt().max(EPSILON)
    }

    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        x.sub_scalar(self.mean).div_scalar(self.std())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::source::fixtures::write_class_dirs;
    use crate::data::{ImageDirectory, StreamPolicy};
    use burn::backend::NdArray;
    use tempfile::TempDir;

    #[test]
    fn test_adapt_matches_pixel_statistics() {
        let dir = TempDir::new().unwrap();
        // one image per class, flat shades 10 and 30
        write_class_dirs(dir.path(), &[("cat", 10), ("dog", 30)], 1);
        let index = ImageDirectory::index(dir.path()).unwrap();
        let ds = ImageDataset::new(index.images, 4, 4, 1, StreamPolicy::repeat_only(), 0).unwrap();

        let norm = Normalization::adapt(&ds).unwrap();
        assert_eq!(norm.count, 32);
        assert!((norm.mean - 20.0).abs() < 1e-9);
        assert!((norm.variance - 100.0).abs() < 1e-9);
        assert!((norm.std() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_adapt_empty_dataset_fails() {
        let ds = ImageDataset::new(Vec::new(), 4, 4, 1, StreamPolicy::repeat_only(), 0).unwrap();
        assert!(matches!(
            Normalization::adapt(&ds),
            Err(MlError::Dataset(_))
        ));
    }

    #[test]
    fn test_apply_standardizes() {
        let norm = Normalization {
            mean: 20.0,
            variance: 100.0,
            count: 2,
        };
        let device = Default::default();
        let x = Tensor::<NdArray, 1>::from_floats([10.0, 30.0], &device);
        let y = norm.apply(x).into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert_eq!(y, vec![-1.0, 1.0]);
    }

    #[test]
    fn test_constant_input_does_not_divide_by_zero() {
        let norm = Normalization {
            mean: 5.0,
            variance: 0.0,
            count: 4,
        };
        assert!(norm.std() > 0.0);
    }
}
