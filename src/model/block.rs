use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Dropout, DropoutConfig, Gelu, GroupNorm, GroupNormConfig, PaddingConfig2d};
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::softmax;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

/// Largest group count up to 32 that divides `channels`.
fn norm_groups(channels: usize) -> usize {
    [32, 16, 8, 4, 2]
        .into_iter()
        .find(|groups| channels % groups == 0)
        .unwrap_or(1)
}

pub fn group_norm<B: Backend>(channels: usize, device: &B::Device) -> GroupNorm<B> {
    GroupNormConfig::new(norm_groups(channels), channels)
        .with_epsilon(1e-6)
        .init(device)
}

pub fn conv3x3<B: Backend>(channels_in: usize, channels_out: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([channels_in, channels_out], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

pub fn conv1x1<B: Backend>(channels_in: usize, channels_out: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([channels_in, channels_out], [1, 1]).init(device)
}

#[derive(Module, Debug)]
pub struct ResnetBlock<B: Backend> {
    norm1: GroupNorm<B>,
    conv1: Conv2d<B>,
    norm2: GroupNorm<B>,
    dropout: Dropout,
    conv2: Conv2d<B>,
    shortcut: Option<Conv2d<B>>,
    activation: Gelu,
}

#[derive(Config)]
pub struct ResnetBlockConfig {
    channels_in: usize,
    channels_out: usize,
    #[config(default = 0.0)]
    dropout: f64,
}

impl ResnetBlockConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> ResnetBlock<B> {
        let shortcut = (self.channels_in != self.channels_out).then(|| conv1x1(self.channels_in, self.channels_out, device));

        ResnetBlock {
            norm1: group_norm(self.channels_in, device),
            conv1: conv3x3(self.channels_in, self.channels_out, device),
            norm2: group_norm(self.channels_out, device),
            dropout: DropoutConfig::new(self.dropout).init(),
            conv2: conv3x3(self.channels_out, self.channels_out, device),
            shortcut,
            activation: Gelu::new(),
        }
    }
}

impl<B: Backend> ResnetBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let hidden = self.norm1.forward(input.clone());
        let hidden = self.activation.forward(hidden);
        let hidden = self.conv1.forward(hidden);

        let hidden = self.norm2.forward(hidden);
        let hidden = self.activation.forward(hidden);
        let hidden = self.dropout.forward(hidden);
        let hidden = self.conv2.forward(hidden);

        let residual = match &self.shortcut {
            Some(shortcut) => shortcut.forward(input),
            None => input,
        };

        residual + hidden
    }
}

/// Single-head self attention over the spatial positions of a feature map.
#[derive(Module, Debug)]
pub struct AttnBlock<B: Backend> {
    norm: GroupNorm<B>,
    query: Conv2d<B>,
    key: Conv2d<B>,
    value: Conv2d<B>,
    proj_out: Conv2d<B>,
}

impl<B: Backend> AttnBlock<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            norm: group_norm(channels, device),
            query: conv1x1(channels, channels, device),
            key: conv1x1(channels, channels, device),
            value: conv1x1(channels, channels, device),
            proj_out: conv1x1(channels, channels, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = input.dims();
        let positions = height * width;

        let hidden = self.norm.forward(input.clone());
        let query = self.query.forward(hidden.clone()).reshape([batch, channels, positions]);
        let key = self.key.forward(hidden.clone()).reshape([batch, channels, positions]);
        let value = self.value.forward(hidden).reshape([batch, channels, positions]);

        let scale = (channels as f32).powf(-0.5);
        let weights = softmax(query.swap_dims(1, 2).matmul(key) * scale, 2);

        let attended = value.matmul(weights.swap_dims(1, 2));
        let attended = attended.reshape([batch, channels, height, width]);

        input + self.proj_out.forward(attended)
    }
}

#[derive(Module, Debug)]
pub struct MidBlock<B: Backend> {
    block_1: ResnetBlock<B>,
    attn: AttnBlock<B>,
    block_2: ResnetBlock<B>,
}

impl<B: Backend> MidBlock<B> {
    pub fn new(channels: usize, dropout: f64, device: &B::Device) -> Self {
        Self {
            block_1: ResnetBlockConfig::new(channels, channels).with_dropout(dropout).init(device),
            attn: AttnBlock::new(channels, device),
            block_2: ResnetBlockConfig::new(channels, channels).with_dropout(dropout).init(device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let hidden = self.block_1.forward(input);
        let hidden = self.attn.forward(hidden);
        self.block_2.forward(hidden)
    }
}

/// Halves the spatial size with a strided 3x3 convolution.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
}

impl<B: Backend> Downsample<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([channels, channels], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        Self { conv }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(input)
    }
}

/// Doubles the spatial size (nearest neighbour) followed by a 3x3 convolution.
#[derive(Module, Debug)]
pub struct Upsample<B: Backend> {
    conv: Conv2d<B>,
}

impl<B: Backend> Upsample<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            conv: conv3x3(channels, channels, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(upsample_nearest(input))
    }
}

/// Doubles both spatial sides by repeating pixels.
pub fn upsample_nearest<B: Backend>(input: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, height, width] = input.dims();

    interpolate(
        input,
        [height * 2, width * 2],
        InterpolateOptions::new(InterpolateMode::Nearest),
    )
}

#[cfg(test)]
mod tests {
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    use super::*;

    type TestBackend = NdArray;

    #[test]
    fn nearest_upsampling_repeats_pixels() {
        let device = NdArrayDevice::Cpu;
        let input = Tensor::<TestBackend, 4>::from_floats([[[[1.0, 2.0], [3.0, 4.0]]]], &device);

        let output = upsample_nearest(input);

        assert_eq!(output.dims(), [1, 1, 4, 4]);
        let values: Vec<f32> = output.into_data().iter::<f32>().collect();
        assert_eq!(&values[..8], &[1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]);
        assert_eq!(&values[8..12], &[3.0, 3.0, 4.0, 4.0]);
    }

    #[test]
    fn blocks_keep_or_change_shape_as_configured() {
        TestBackend::seed(0);
        let device = NdArrayDevice::Cpu;
        let input = Tensor::<TestBackend, 4>::random([2, 8, 8, 8], Distribution::Normal(0.0, 1.0), &device);

        let resnet = ResnetBlockConfig::new(8, 16).init::<TestBackend>(&device);
        assert_eq!(resnet.forward(input.clone()).dims(), [2, 16, 8, 8]);

        let attention = AttnBlock::<TestBackend>::new(8, &device);
        assert_eq!(attention.forward(input.clone()).dims(), [2, 8, 8, 8]);

        let down = Downsample::<TestBackend>::new(8, &device);
        assert_eq!(down.forward(input.clone()).dims(), [2, 8, 4, 4]);

        let up = Upsample::<TestBackend>::new(8, &device);
        assert_eq!(up.forward(input).dims(), [2, 8, 16, 16]);
    }

    #[test]
    fn group_count_divides_channels() {
        assert_eq!(norm_groups(128), 32);
        assert_eq!(norm_groups(48), 16);
        assert_eq!(norm_groups(6), 2);
        assert_eq!(norm_groups(3), 1);
    }
}
