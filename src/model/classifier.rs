use crate::model::layers::{conv_out, down_conv};
use burn::nn::conv::Conv2d;
use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, sigmoid};

/// Configuration for the binary image classifier.
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    pub channels: usize,
    pub classifier_dim: usize,
    pub image_size: usize,
}

/// Convolutional classifier producing one score in [0, 1] per image.
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    convs: Vec<Conv2d<B>>,
    bn: BatchNorm<B>,
    fc: Linear<B>,
}

impl ClassifierConfig {
    /// Initialize the classifier layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Classifier<B> {
        let dim = self.classifier_dim;
        let convs = vec![
            down_conv(self.channels, dim, true, device),
            down_conv(dim, dim * 2, false, device),
        ];

        let mut size = self.image_size;
        size = conv_out(size, 4, 2, 1);
        size = conv_out(size, 4, 2, 1);
        let flat_dim = size * size * dim * 2;

        Classifier {
            convs,
            bn: BatchNormConfig::new(dim * 2).init(device),
            fc: LinearConfig::new(flat_dim, 1).init(device),
        }
    }
}

impl<B: Backend> Classifier<B> {
    /// Forward pass returning scores of shape `[batch, 1]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = leaky_relu(self.convs[0].forward(images), 0.2);
        x = leaky_relu(self.bn.forward(self.convs[1].forward(x)), 0.2);

        let [batch, channels, height, width] = x.dims();
        let flat = x.reshape([batch, channels * height * width]);
        sigmoid(self.fc.forward(flat))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn scores_are_probabilities() {
        let device = Default::default();
        let model = ClassifierConfig::new(1, 4, 16).init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::random(
            [3, 1, 16, 16],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        let scores = model.forward(images);
        assert_eq!(scores.dims(), [3, 1]);
        let values = scores.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }
}
