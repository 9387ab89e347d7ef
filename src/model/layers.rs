use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;

/// 4x4 convolution with stride 2 that halves the spatial size.
pub fn down_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    bias: bool,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(bias)
        .init(device)
}

/// 4x4 transposed convolution with stride 2 that doubles the spatial size.
pub fn up_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    bias: bool,
    device: &B::Device,
) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding([1, 1])
        .with_bias(bias)
        .init(device)
}

pub fn conv_out(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (input + 2 * padding - (kernel - 1) - 1) / stride + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn down_then_up_restores_spatial_size() {
        let device = Default::default();
        let down = down_conv::<TestBackend>(1, 4, true, &device);
        let up = up_conv::<TestBackend>(4, 1, true, &device);

        let x = Tensor::<TestBackend, 4>::zeros([2, 1, 8, 8], &device);
        let encoded = down.forward(x);
        assert_eq!(encoded.dims(), [2, 4, 4, 4]);
        assert_eq!(up.forward(encoded).dims(), [2, 1, 8, 8]);
    }

    #[test]
    fn conv_out_matches_stride_two() {
        assert_eq!(conv_out(64, 4, 2, 1), 32);
        assert_eq!(conv_out(8, 4, 2, 1), 4);
    }
}
