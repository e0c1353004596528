use std::iter;

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::Conv2d;
use burn::nn::{Gelu, GroupNorm};
use burn::prelude::{Backend, Tensor};
use itertools::Itertools;

use crate::model::block::{conv3x3, group_norm, AttnBlock, Downsample, MidBlock, ResnetBlock, ResnetBlockConfig};
use crate::model::encoder::{Encoder, EncoderConfig};

#[derive(Config, Debug)]
pub struct ConvEncoderConfig {
    pub in_channels: usize,
    pub hidden_dim: usize,
    /// Channel multiplier per resolution level; every level but the last halves the resolution.
    pub ch_mult: Vec<usize>,
    pub num_res_blocks: usize,
    /// Resolutions at which attention follows each residual block.
    pub attn_resolutions: Vec<usize>,
    pub resolution: usize,
    pub z_channels: usize,
    #[config(default = 0.0)]
    pub dropout: f64,
    #[config(default = false)]
    pub double_z: bool,
}

impl EncoderConfig for ConvEncoderConfig {
    type Model<B> = ConvEncoder<B> where B: Backend;

    fn out_channels(&self) -> usize {
        match self.double_z {
            true => 2 * self.z_channels,
            false => self.z_channels,
        }
    }
}

#[derive(Module, Debug)]
pub struct EncoderLevel<B: Backend> {
    blocks: Vec<ResnetBlock<B>>,
    attentions: Vec<AttnBlock<B>>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> EncoderLevel<B> {
    pub fn forward(&self, mut hidden: Tensor<B, 4>) -> Tensor<B, 4> {
        for (index, block) in self.blocks.iter().enumerate() {
            hidden = block.forward(hidden);
            if let Some(attention) = self.attentions.get(index) {
                hidden = attention.forward(hidden);
            }
        }

        match &self.downsample {
            Some(downsample) => downsample.forward(hidden),
            None => hidden,
        }
    }
}

/// Residual convolutional encoder that downsamples an image by
/// `2^(levels - 1)` into a grid of `z_channels` features.
#[derive(Module, Debug)]
pub struct ConvEncoder<B: Backend> {
    conv_in: Conv2d<B>,
    levels: Vec<EncoderLevel<B>>,
    mid: MidBlock<B>,
    norm_out: GroupNorm<B>,
    activation: Gelu,
    conv_out: Conv2d<B>,
    out_channels: usize,
}

impl ConvEncoderConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> ConvEncoder<B> {
        let num_levels = self.ch_mult.len();
        let level_channels = iter::once(&1)
            .chain(&self.ch_mult)
            .map(|mult| mult * self.hidden_dim)
            .tuple_windows::<(_, _)>();

        let mut resolution = self.resolution;
        let mut levels = Vec::with_capacity(num_levels);
        let mut block_in = self.hidden_dim;

        for (level, (channels_in, channels_out)) in level_channels.enumerate() {
            let mut blocks = Vec::with_capacity(self.num_res_blocks);
            let mut attentions = Vec::new();
            block_in = channels_in;

            for _ in 0..self.num_res_blocks {
                blocks.push(
                    ResnetBlockConfig::new(block_in, channels_out)
                        .with_dropout(self.dropout)
                        .init(device),
                );
                block_in = channels_out;
                if self.attn_resolutions.contains(&resolution) {
                    attentions.push(AttnBlock::new(block_in, device));
                }
            }

            let downsample = (level + 1 != num_levels).then(|| Downsample::new(block_in, device));
            if downsample.is_some() {
                resolution /= 2;
            }

            levels.push(EncoderLevel {
                blocks,
                attentions,
                downsample,
            });
        }

        let out_channels = self.out_channels();

        ConvEncoder {
            conv_in: conv3x3(self.in_channels, self.hidden_dim, device),
            levels,
            mid: MidBlock::new(block_in, self.dropout, device),
            norm_out: group_norm(block_in, device),
            activation: Gelu::new(),
            conv_out: conv3x3(block_in, out_channels, device),
            out_channels,
        }
    }
}

impl<B: Backend> Encoder<B> for ConvEncoder<B> {
    type Config = ConvEncoderConfig;

    fn new(config: Self::Config, device: &B::Device) -> Self {
        config.init(device)
    }

    fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn forward(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut hidden = self.conv_in.forward(image);

        for level in &self.levels {
            hidden = level.forward(hidden);
        }

        let hidden = self.mid.forward(hidden);
        let hidden = self.norm_out.forward(hidden);
        let hidden = self.activation.forward(hidden);
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
    fn downsamples_once_per_extra_level() {
        TestBackend::seed(0);
        let device = NdArrayDevice::Cpu;
        let config = ConvEncoderConfig::new(3, 8, vec![1, 2, 2], 1, vec![8], 16, 4);
        let encoder = config.init::<TestBackend>(&device);
        let image = Tensor::random([2, 3, 16, 16], Distribution::Uniform(-1.0, 1.0), &device);

        let latent = encoder.forward(image);

        assert_eq!(latent.dims(), [2, 4, 4, 4]);
        assert_eq!(encoder.out_channels(), 4);
    }

    #[test]
    fn double_z_doubles_latent_channels() {
        let config = ConvEncoderConfig::new(3, 8, vec![1, 2], 1, vec![], 16, 4).with_double_z(true);

        assert_eq!(config.out_channels(), 8);
    }
}
