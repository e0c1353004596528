use burn::config::Config;
use burn::module::{Module, Param};
use burn::prelude::{Backend, Int, Tensor};
use burn::tensor::activation::softmax;
use burn::tensor::Distribution;

use crate::error::{Result, VqError};
use crate::model::quantizer::{
    check_latent, first_argmin, flatten_grid, one_hot, perplexity, straight_through, unflatten_grid, QuantizeInfo,
    Quantized, Quantizer, QuantizerConfig,
};

fn sample_gumbel<B: Backend>(shape: [usize; 2], device: &B::Device) -> Tensor<B, 2> {
    let eps = 1e-20;
    let tensor = Tensor::random(shape, Distribution::Default, device);

    -Tensor::log(-Tensor::log(tensor + eps) + eps)
}

fn gumbel_softmax_sample<B: Backend>(logits: Tensor<B, 2>, temperature: f32) -> Tensor<B, 2> {
    let noise = sample_gumbel(logits.dims(), &logits.device());

    softmax((logits + noise) / temperature, 1)
}

/// Relaxed one-hot sample over dim 1. With `hard`, the forward value is the
/// one-hot of the sample's argmax while the gradient follows the soft sample.
pub fn gumbel_softmax<B: Backend>(logits: Tensor<B, 2>, temperature: f32, hard: bool) -> Tensor<B, 2> {
    let y = gumbel_softmax_sample(logits, temperature);

    if !hard {
        return y;
    }

    let num_classes = y.dims()[1];
    let y_hard = one_hot(argmax(y.clone()), num_classes);

    straight_through(y_hard, y)
}

fn argmax<B: Backend>(scores: Tensor<B, 2>) -> Tensor<B, 1, Int> {
    first_argmin(scores.detach().neg())
}

#[derive(Config, Debug)]
pub struct GumbelQuantizerConfig {
    pub num_codes: usize,
    pub codebook_dim: usize,
    #[config(default = 5e-4)]
    pub kl_weight: f32,
    #[config(default = 1.0)]
    pub temperature: f32,
    #[config(default = true)]
    pub straight_through: bool,
}

impl GumbelQuantizerConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> GumbelQuantizer<B> {
        GumbelQuantizer {
            codebook: Param::from_tensor(Tensor::random(
                [self.num_codes, self.codebook_dim],
                Distribution::Normal(0.0, 1.0),
                device,
            )),
            num_codes: self.num_codes,
            codebook_dim: self.codebook_dim,
            kl_weight: self.kl_weight,
            temperature: self.temperature,
            straight_through: self.straight_through,
        }
    }
}

/// Quantizer over per-position code logits: a Gumbel-softmax relaxation while
/// training, the argmax code in evaluation.
#[derive(Module, Debug)]
pub struct GumbelQuantizer<B: Backend> {
    codebook: Param<Tensor<B, 2>>,
    num_codes: usize,
    codebook_dim: usize,
    kl_weight: f32,
    temperature: f32,
    straight_through: bool,
}

impl QuantizerConfig for GumbelQuantizerConfig {
    type Model<B> = GumbelQuantizer<B> where B: Backend;

    fn input_dim(&self) -> usize {
        self.num_codes
    }

    fn codebook_dim(&self) -> usize {
        self.codebook_dim
    }
}

impl<B: Backend> Quantizer<B> for GumbelQuantizer<B> {
    type Config = GumbelQuantizerConfig;

    const NAME: &'static str = "gumbel";

    fn new(config: Self::Config, device: &B::Device) -> Self {
        config.init(device)
    }

    fn quantize(&self, latent: Tensor<B, 4>, training: bool) -> Result<Quantized<B>> {
        let [batch, _, height, width] = check_latent(&latent, self.num_codes)?;
        let positions = batch * height * width;

        let logits = flatten_grid(latent);
        let probs = softmax(logits.clone(), 1);

        let (assignment, perplexity) = match training {
            true => self.forward_train(logits, probs.clone()),
            false => self.forward_eval(logits),
        };

        let indices = argmax(assignment.clone()).reshape([positions]);
        let quantized = assignment.clone().matmul(self.codebook.val());

        let kl = (probs.clone() * (probs * self.num_codes as f32 + 1e-10).log())
            .sum_dim(1)
            .mean();

        Ok(Quantized {
            quantized: unflatten_grid(quantized, [batch, height, width]),
            loss: kl * self.kl_weight,
            info: QuantizeInfo {
                indices,
                grid: [batch, height, width],
                perplexity: Some(perplexity),
                encodings: Some(assignment),
            },
        })
    }

    fn dequantize(&self, _indices: Tensor<B, 1, Int>) -> Result<Tensor<B, 2>> {
        Err(VqError::UnsupportedOperation(<Self as Quantizer<B>>::NAME))
    }

    fn num_codes(&self) -> usize {
        self.num_codes
    }

    fn codebook_dim(&self) -> usize {
        self.codebook_dim
    }

    fn input_dim(&self) -> usize {
        self.num_codes
    }

    fn temperature(&self) -> Option<f32> {
        Some(self.temperature)
    }

    fn set_temperature(&mut self, temperature: f32) {
        self.temperature = temperature;
    }
}

impl<B: Backend> GumbelQuantizer<B> {
    fn forward_train(&self, logits: Tensor<B, 2>, probs: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let assignment = gumbel_softmax(logits, self.temperature, self.straight_through);
        let perplexity = perplexity(probs.detach().mean_dim(0));

        (assignment, perplexity)
    }

    fn forward_eval(&self, logits: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 1>) {
        let assignment = one_hot(argmax(logits), self.num_codes);
        let perplexity = perplexity(assignment.clone().mean_dim(0));

        (assignment, perplexity)
    }
}
