use burn::module::Module;
use burn::prelude::{Backend, Tensor};

pub mod conv;

pub trait EncoderConfig {
    type Model<B>: Encoder<B, Config = Self>
    where
        B: Backend;

    fn out_channels(&self) -> usize;
}

pub trait Encoder<B: Backend>: Module<B> {
    type Config: EncoderConfig;

    fn new(config: Self::Config, device: &B::Device) -> Self;

    /// Channels of the produced latent grid.
    fn out_channels(&self) -> usize;

    /// (batch, channels, height, width) image -> latent grid.
    fn forward(&self, image: Tensor<B, 4>) -> Tensor<B, 4>;
}
