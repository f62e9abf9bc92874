//! Fixed-topology CNN: three conv/pool blocks, two dense layers, sigmoid output.

use crate::error::MlError;
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{Initializer, Linear, LinearConfig, Relu};
use burn::tensor::Tensor;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;

/// Output channels of the three convolution blocks.
pub const CONV_FILTERS: [usize; 3] = [16, 32, 64];
/// Units of the two hidden dense layers.
pub const DENSE_UNITS: [usize; 2] = [128, 64];

const KERNEL: usize = 3;
const POOL: usize = 2;

#[derive(Config, Debug)]
pub struct ClassifierConfig {
    pub image_width: usize,
    pub image_height: usize,
    #[config(default = "315")]
    pub seed: u64,
}

impl ClassifierConfig {
    /// Side length after three valid 3x3 convolutions each followed by a
    /// 2x2/2 max-pool, or `None` if the input is too small.
    pub fn feature_side(input: usize) -> Option<usize> {
        let mut side = input;
        for _ in 0..CONV_FILTERS.len() {
            side = side.checked_sub(KERNEL - 1)? / POOL;
            if side == 0 {
                return None;
            }
        }
        Some(side)
    }

    /// Width of the flattened feature vector entering the dense layers.
    pub fn flattened_features(&self) -> Result<usize, MlError> {
        match (
            Self::feature_side(self.image_height),
            Self::feature_side(self.image_width),
        ) {
            (Some(h), Some(w)) => Ok(CONV_FILTERS[2] * h * w),
            _ => Err(MlError::model(format!(
                "image size {}x{} is too small for three conv/pool blocks",
                self.image_width, self.image_height
            ))),
        }
    }

    /// Allocate weights. All kernels use Glorot uniform initialization drawn
    /// from the backend RNG seeded with `self.seed`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<CatDogClassifier<B>, MlError> {
        let flattened = self.flattened_features()?;
        B::seed(self.seed);

        let glorot = Initializer::XavierUniform { gain: 1.0 };
        let conv = |channels: [usize; 2]| {
            Conv2dConfig::new(channels, [KERNEL, KERNEL])
                .with_initializer(glorot.clone())
                .init(device)
        };
        let dense = |d_in: usize, d_out: usize| {
            LinearConfig::new(d_in, d_out)
                .with_initializer(glorot.clone())
                .init(device)
        };

        Ok(CatDogClassifier {
            conv1: conv([1, CONV_FILTERS[0]]),
            conv2: conv([CONV_FILTERS[0], CONV_FILTERS[1]]),
            conv3: conv([CONV_FILTERS[1], CONV_FILTERS[2]]),
            pool: MaxPool2dConfig::new([POOL, POOL])
                .with_strides([POOL, POOL])
                .init(),
            dense1: dense(flattened, DENSE_UNITS[0]),
            dense2: dense(DENSE_UNITS[0], DENSE_UNITS[1]),
            output: dense(DENSE_UNITS[1], 1),
            activation: Relu::new(),
        })
    }
}

#[derive(Module, Debug)]
pub struct CatDogClassifier<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    pool: MaxPool2d,
    dense1: Linear<B>,
    dense2: Linear<B>,
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> CatDogClassifier<B> {
    /// `[batch, 1, height, width]` normalized images -> `[batch, 1]` probabilities.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(self.activation.forward(self.conv1.forward(images)));
        let x = self.pool.forward(self.activation.forward(self.conv2.forward(x)));
        let x = self.pool.forward(self.activation.forward(self.conv3.forward(x)));

        let [batch, channels, height, width] = x.dims();
        let x = x.reshape([batch, channels * height * width]);

        let x = self.activation.forward(self.dense1.forward(x));
        let x = self.activation.forward(self.dense2.forward(x));
        sigmoid(self.output.forward(x))
    }

    /// `l1 * sum|w| + l2 * sum(w^2)` over the two hidden dense kernels.
    /// Returns `None` when both coefficients are zero.
    pub fn weight_penalty(&self, l1: f64, l2: f64) -> Option<Tensor<B, 1>> {
        if l1 == 0.0 && l2 == 0.0 {
            return None;
        }
        let kernels = [self.dense1.weight.val(), self.dense2.weight.val()];
        let mut total: Option<Tensor<B, 1>> = None;
        for w in kernels {
            let l1_term = w.clone().abs().sum().mul_scalar(l1);
            let l2_term = w.powf_scalar(2.0).sum().mul_scalar(l2);
            let term = l1_term + l2_term;
            total = Some(match total {
                Some(acc) => acc + term,
                None => term,
            });
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_feature_side() {
        // 64 -> 62 -> 31 -> 29 -> 14 -> 12 -> 6
        assert_eq!(ClassifierConfig::feature_side(64), Some(6));
        // 48 -> 46 -> 23 -> 21 -> 10 -> 8 -> 4
        assert_eq!(ClassifierConfig::feature_side(48), Some(4));
        assert_eq!(ClassifierConfig::feature_side(10), None);
        assert_eq!(ClassifierConfig::feature_side(1), None);
    }

    #[test]
    fn test_flattened_features() {
        let config = ClassifierConfig::new(64, 48);
        assert_eq!(config.flattened_features().unwrap(), 64 * 4 * 6);
    }

    #[test]
    fn test_too_small_image_is_model_error() {
        let device = Default::default();
        let result = ClassifierConfig::new(8, 6).init::<TestBackend>(&device);
        assert!(matches!(result, Err(MlError::Model(_))));
    }

    #[test]
    fn test_forward_shape_and_range() {
        let device = Default::default();
        let model = ClassifierConfig::new(32, 24)
            .init::<TestBackend>(&device)
            .unwrap();
        let images = Tensor::<TestBackend, 4>::ones([3, 1, 24, 32], &device);
        let probs = model.forward(images);
        assert_eq!(probs.dims(), [3, 1]);

        let values = probs.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_weight_penalty() {
        let device = Default::default();
        let model = ClassifierConfig::new(32, 24)
            .init::<TestBackend>(&device)
            .unwrap();
        assert!(model.weight_penalty(0.0, 0.0).is_none());

        let penalty = model.weight_penalty(0.01, 0.01).unwrap();
        let value = penalty.into_data().convert::<f32>().to_vec::<f32>().unwrap();
        assert!(value[0] > 0.0);
    }
}
