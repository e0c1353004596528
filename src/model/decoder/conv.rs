use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::Conv2d;
use burn::nn::{Gelu, GroupNorm};
use burn::prelude::{Backend, Tensor};

use crate::model::block::{conv3x3, group_norm, AttnBlock, MidBlock, ResnetBlock, ResnetBlockConfig, Upsample};
use crate::model::decoder::{Decoder, DecoderConfig};

#[derive(Config, Debug)]
pub struct ConvDecoderConfig {
    pub out_channels: usize,
    pub hidden_dim: usize,
    pub ch_mult: Vec<usize>,
    pub num_res_blocks: usize,
    pub attn_resolutions: Vec<usize>,
    /// Resolution of the reconstructed image.
    pub resolution: usize,
    pub z_channels: usize,
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl DecoderConfig for ConvDecoderConfig {
    type Model<B> = ConvDecoder<B> where B: Backend;

    fn in_channels(&self) -> usize {
        self.z_channels
    }
}

#[derive(Module, Debug)]
pub struct DecoderLevel<B: Backend> {
    blocks: Vec<ResnetBlock<B>>,
    attentions: Vec<AttnBlock<B>>,
    upsample: Option<Upsample<B>>,
}

impl<B: Backend> DecoderLevel<B> {
    pub fn forward(&self, mut hidden: Tensor<B, 4>) -> Tensor<B, 4> {
        for (index, block) in self.blocks.iter().enumerate() {
            hidden = block.forward(hidden);
            if let Some(attention) = self.attentions.get(index) {
                hidden = attention.forward(hidden);
            }
        }

        match &self.upsample {
            Some(upsample) => upsample.forward(hidden),
            None => hidden,
        }
    }
}

/// Mirror of the convolutional encoder: upsamples a latent grid back to an image.
#[derive(Module, Debug)]
pub struct ConvDecoder<B: Backend> {
    conv_in: Conv2d<B>,
    mid: MidBlock<B>,
    levels: Vec<DecoderLevel<B>>,
    norm_out: GroupNorm<B>,
    activation: Gelu,
    conv_out: Conv2d<B>,
    in_channels: usize,
}

impl ConvDecoderConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> ConvDecoder<B> {
        let num_levels = self.ch_mult.len();
        let deepest = self.ch_mult.last().copied().unwrap_or(1);

        let mut block_in = self.hidden_dim * deepest;
        let mut resolution = self.resolution >> num_levels.saturating_sub(1);
        let mut levels = Vec::with_capacity(num_levels);

        for level in (0..num_levels).rev() {
            let block_out = self.hidden_dim * self.ch_mult[level];
            let mut blocks = Vec::with_capacity(self.num_res_blocks + 1);
            let mut attentions = Vec::new();

            for _ in 0..=self.num_res_blocks {
                blocks.push(
                    ResnetBlockConfig::new(block_in, block_out)
                        .with_dropout(self.dropout)
                        .init(device),
                );
                block_in = block_out;
                if self.attn_resolutions.contains(&resolution) {
                    attentions.push(AttnBlock::new(block_in, device));
                }
            }

            let upsample = (level != 0).then(|| Upsample::new(block_in, device));
            if upsample.is_some() {
                resolution *= 2;
            }

            levels.push(DecoderLevel {
                blocks,
                attentions,
                upsample,
            });
        }

        let mid_channels = self.hidden_dim * deepest;

        ConvDecoder {
            conv_in: conv3x3(self.z_channels, mid_channels, device),
            mid: MidBlock::new(mid_channels, self.dropout, device),
            levels,
            norm_out: group_norm(block_in, device),
            activation: Gelu::new(),
            conv_out: conv3x3(block_in, self.out_channels, device),
            in_channels: self.z_channels,
        }
    }
}

impl<B: Backend> Decoder<B> for ConvDecoder<B> {
    type Config = ConvDecoderConfig;

    fn new(config: Self::Config, device: &B::Device) -> Self {
        config.init(device)
    }

    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn forward_hidden(&self, latent: Tensor<B, 4>) -> Tensor<B, 4> {
        let hidden = self.conv_in.forward(latent);
        let mut hidden = self.mid.forward(hidden);

        for level in &self.levels {
            hidden = level.forward(hidden);
        }

        let hidden = self.norm_out.forward(hidden);
        self.activation.forward(hidden)
    }

    fn last_layer(&self) -> &Conv2d<B> {
        &self.conv_out
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
    fn upsamples_back_to_image_resolution() {
        TestBackend::seed(0);
        let device = NdArrayDevice::Cpu;
        let decoder = ConvDecoderConfig::new(3, 8, vec![1, 2, 2], 1, vec![8], 16, 4).init::<TestBackend>(&device);
        let latent = Tensor::random([2, 4, 4, 4], Distribution::Normal(0.0, 1.0), &device);

        let hidden = decoder.forward_hidden(latent.clone());
        let image = decoder.forward(latent);

        assert_eq!(hidden.dims(), [2, 8, 16, 16]);
        assert_eq!(image.dims(), [2, 3, 16, 16]);
        assert_eq!(decoder.last_layer().weight.val().dims(), [3, 8, 3, 3]);
    }
}
