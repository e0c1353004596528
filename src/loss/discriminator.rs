use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{GroupNorm, PaddingConfig2d};
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::leaky_relu;

use crate::model::block::group_norm;

pub trait DiscriminatorConfig {
    type Model<B>: Discriminator<B, Config = Self>
    where
        B: Backend;
}

pub trait Discriminator<B: Backend>: Module<B> {
    type Config: DiscriminatorConfig;

    fn new(config: Self::Config, device: &B::Device) -> Self;

    /// Realness logits, one per patch.
    fn forward(&self, image: Tensor<B, 4>) -> Tensor<B, 4>;
}

#[derive(Config, Debug)]
pub struct PatchDiscriminatorConfig {
    #[config(default = 3)]
    pub in_channels: usize,
    /// Filters of the first layer; doubled per layer up to eight times.
    #[config(default = 64)]
    pub ndf: usize,
    #[config(default = 3)]
    pub num_layers: usize,
}

impl DiscriminatorConfig for PatchDiscriminatorConfig {
    type Model<B> = PatchDiscriminator<B> where B: Backend;
}

fn conv4x4<B: Backend>(channels_in: usize, channels_out: usize, stride: usize, bias: bool, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([channels_in, channels_out], [4, 4])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(bias)
        .init(device)
}

const LEAKY_SLOPE: f64 = 0.2;

#[derive(Module, Debug)]
pub struct DiscriminatorLayer<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<GroupNorm<B>>,
}

impl<B: Backend> DiscriminatorLayer<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let hidden = self.conv.forward(input);
        let hidden = match &self.norm {
            Some(norm) => norm.forward(hidden),
            None => hidden,
        };
        leaky_relu(hidden, LEAKY_SLOPE)
    }
}

/// PatchGAN discriminator: every output logit judges one receptive field.
#[derive(Module, Debug)]
pub struct PatchDiscriminator<B: Backend> {
    layers: Vec<DiscriminatorLayer<B>>,
    conv_out: Conv2d<B>,
}

impl PatchDiscriminatorConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> PatchDiscriminator<B> {
        let mut layers = vec![DiscriminatorLayer {
            conv: conv4x4(self.in_channels, self.ndf, 2, true, device),
            norm: None,
        }];

        let mut channels = self.ndf;
        for layer in 1..=self.num_layers {
            let stride = if layer < self.num_layers { 2 } else { 1 };
            let channels_out = self.ndf * usize::min(1 << layer, 8);

            layers.push(DiscriminatorLayer {
                conv: conv4x4(channels, channels_out, stride, false, device),
                norm: Some(group_norm(channels_out, device)),
            });
            channels = channels_out;
        }

        PatchDiscriminator {
            layers,
            conv_out: conv4x4(channels, 1, 1, true, device),
        }
    }
}

impl<B: Backend> Discriminator<B> for PatchDiscriminator<B> {
    type Config = PatchDiscriminatorConfig;

    fn new(config: Self::Config, device: &B::Device) -> Self {
        config.init(device)
    }

    fn forward(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut hidden = image;
        for layer in &self.layers {
            hidden = layer.forward(hidden);
        }

        self.conv_out.forward(hidden)
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    use super::*;

    type TestBackend = NdArray;

    #[test]
    fn produces_one_logit_per_patch() {
        TestBackend::seed(0);
        let device = NdArrayDevice::Cpu;
        let discriminator = PatchDiscriminatorConfig::new()
            .with_ndf(8)
            .with_num_layers(2)
            .init::<TestBackend>(&device);
        let image = Tensor::random([2, 3, 32, 32], Distribution::Uniform(-1.0, 1.0), &device);

        // 32 -> 16 -> 8 -> 7 -> 6
        assert_eq!(discriminator.forward(image).dims(), [2, 1, 6, 6]);
    }

    #[test]
    fn leaky_relu_scales_negative_part() {
        let device = NdArrayDevice::Cpu;
        let input = Tensor::<TestBackend, 1>::from_floats([-2.0, 0.0, 3.0], &device);

        let output: Vec<f32> = leaky_relu(input, LEAKY_SLOPE).into_data().iter::<f32>().collect();

        for (got, want) in output.iter().zip([-0.4, 0.0, 3.0]) {
            assert!((got - want).abs() < 1e-6);
        }
    }
}
