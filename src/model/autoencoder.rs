use crate::model::layers::{down_conv, up_conv};
use burn::nn::conv::{Conv2d, ConvTranspose2d};
use burn::nn::{BatchNorm, BatchNormConfig};
use burn::prelude::*;
use burn::tensor::activation::{leaky_relu, relu};

/// Configuration for the convolutional image autoencoder.
#[derive(Config, Debug)]
pub struct AutoencoderConfig {
    pub channels: usize,
    pub autoencoder_dim: usize,
}

/// Two-level convolutional autoencoder. Output has the same shape as the input.
#[derive(Module, Debug)]
pub struct Autoencoder<B: Backend> {
    enc_convs: Vec<Conv2d<B>>,
    enc_bn: BatchNorm<B>,
    dec_convs: Vec<ConvTranspose2d<B>>,
    dec_bn: BatchNorm<B>,
}

impl AutoencoderConfig {
    /// Initialize encoder and decoder layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Autoencoder<B> {
        let dim = self.autoencoder_dim;
        let enc_convs = vec![
            down_conv(self.channels, dim, true, device),
            down_conv(dim, dim * 2, false, device),
        ];
        let dec_convs = vec![
            up_conv(dim * 2, dim, false, device),
            up_conv(dim, self.channels, true, device),
        ];

        Autoencoder {
            enc_convs,
            enc_bn: BatchNormConfig::new(dim * 2).init(device),
            dec_convs,
            dec_bn: BatchNormConfig::new(dim).init(device),
        }
    }
}

impl<B: Backend> Autoencoder<B> {
    /// Reconstruct a normalized BCHW batch.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let encoded = self.encode(images);
        self.decode(encoded)
    }

    pub fn encode(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = leaky_relu(self.enc_convs[0].forward(images), 0.2);
        leaky_relu(self.enc_bn.forward(self.enc_convs[1].forward(x)), 0.2)
    }

    fn decode(&self, encoded: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.dec_bn.forward(self.dec_convs[0].forward(encoded)));
        // Normalized pixels are unbounded, so the last layer stays linear.
        self.dec_convs[1].forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn reconstruction_keeps_input_shape() {
        let device = Default::default();
        let model = AutoencoderConfig::new(3, 4).init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::ones([2, 3, 16, 16], &device);

        assert_eq!(model.encode(images.clone()).dims(), [2, 8, 4, 4]);
        assert_eq!(model.forward(images).dims(), [2, 3, 16, 16]);
    }
}
