use burn::module::Module;
use burn::prelude::{Backend, Tensor};

/// Learned perceptual distance between two image batches.
pub trait PerceptualLoss<B: Backend>: Module<B> {
    /// Per-sample distance shaped (batch, 1, 1, 1).
    fn forward(&self, input: Tensor<B, 4>, reconstruction: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Perceptual term for setups without a pretrained feature network; always zero.
#[derive(Module, Clone, Debug, Default)]
pub struct NoPerceptual;

impl<B: Backend> PerceptualLoss<B> for NoPerceptual {
    fn forward(&self, input: Tensor<B, 4>, _reconstruction: Tensor<B, 4>) -> Tensor<B, 4> {
        let batch = input.dims()[0];
        Tensor::zeros([batch, 1, 1, 1], &input.device())
    }
}
