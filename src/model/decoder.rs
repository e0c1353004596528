use burn::module::Module;
use burn::nn::conv::Conv2d;
use burn::prelude::{Backend, Tensor};

pub mod conv;

pub trait DecoderConfig {
    type Model<B>: Decoder<B, Config = Self>
    where
        B: Backend;

    fn in_channels(&self) -> usize;
}

pub trait Decoder<B: Backend>: Module<B> {
    type Config: DecoderConfig;

    fn new(config: Self::Config, device: &B::Device) -> Self;

    fn in_channels(&self) -> usize;

    /// Everything up to, but excluding, the output convolution.
    fn forward_hidden(&self, latent: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Output convolution producing the reconstruction.
    fn last_layer(&self) -> &Conv2d<B>;

    fn forward(&self, latent: Tensor<B, 4>) -> Tensor<B, 4> {
        self.last_layer().forward(self.forward_hidden(latent))
    }
}
