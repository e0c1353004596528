use burn::config::Config;
use burn::module::{Module, Param};
use burn::prelude::{Backend, Int, Tensor};
use burn::tensor::Distribution;

use crate::error::{Result, VqError};
use crate::model::quantizer::{
    check_latent, flatten_grid, nearest_codes, one_hot, perplexity, straight_through, unflatten_grid, QuantizeInfo,
    Quantized, Quantizer, QuantizerConfig,
};
use crate::ops::ScalarExt;

#[derive(Config, Debug)]
pub struct VectorQuantizerConfig {
    pub num_codes: usize,
    pub codebook_dim: usize,
    /// Weight of the commitment term.
    #[config(default = 0.25)]
    pub beta: f32,
}

impl VectorQuantizerConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> VectorQuantizer<B> {
        let bound = 1.0 / self.num_codes as f64;
        let codebook = Tensor::random(
            [self.num_codes, self.codebook_dim],
            Distribution::Uniform(-bound, bound),
            device,
        );

        VectorQuantizer {
            codebook: Param::from_tensor(codebook),
            num_codes: self.num_codes,
            codebook_dim: self.codebook_dim,
            beta: self.beta,
        }
    }
}

/// Nearest-neighbour quantizer with a gradient-trained codebook.
#[derive(Module, Debug)]
pub struct VectorQuantizer<B: Backend> {
    codebook: Param<Tensor<B, 2>>,
    num_codes: usize,
    codebook_dim: usize,
    beta: f32,
}

impl QuantizerConfig for VectorQuantizerConfig {
    type Model<B> = VectorQuantizer<B> where B: Backend;

    fn input_dim(&self) -> usize {
        self.codebook_dim
    }

    fn codebook_dim(&self) -> usize {
        self.codebook_dim
    }
}

impl<B: Backend> VectorQuantizer<B> {
    /// Replaces the codebook, e.g. with pretrained entries.
    pub fn with_codebook(mut self, codebook: Tensor<B, 2>) -> Result<Self> {
        let [num_codes, codebook_dim] = codebook.dims();
        if codebook_dim != self.codebook_dim {
            return Err(VqError::ChannelMismatch {
                expected: self.codebook_dim,
                got: codebook_dim,
            });
        }

        self.codebook = Param::initialized(self.codebook.id.clone(), codebook.require_grad());
        self.num_codes = num_codes;
        Ok(self)
    }

    pub fn codebook(&self) -> Tensor<B, 2> {
        self.codebook.val()
    }
}

impl<B: Backend> Quantizer<B> for VectorQuantizer<B> {
    type Config = VectorQuantizerConfig;

    const NAME: &'static str = "hard";

    fn new(config: Self::Config, device: &B::Device) -> Self {
        config.init(device)
    }

    fn quantize(&self, latent: Tensor<B, 4>, _training: bool) -> Result<Quantized<B>> {
        let [batch, _, height, width] = check_latent(&latent, self.codebook_dim)?;

        let flat = flatten_grid(latent);
        let codebook = self.codebook.val();
        let indices = nearest_codes(flat.clone(), codebook.clone());
        let quantized = codebook.select(0, indices.clone());

        let commitment = (quantized.clone().detach() - flat.clone()).powi_scalar(2).mean();
        let embedding = (quantized.clone() - flat.clone().detach()).powi_scalar(2).mean();
        let loss = commitment * self.beta + embedding;

        let encodings = one_hot(indices.clone(), self.num_codes);
        let perplexity = perplexity(encodings.clone().mean_dim(0));

        let quantized = straight_through(quantized, flat);

        Ok(Quantized {
            quantized: unflatten_grid(quantized, [batch, height, width]),
            loss,
            info: QuantizeInfo {
                indices,
                grid: [batch, height, width],
                perplexity: Some(perplexity),
                encodings: Some(encodings),
            },
        })
    }

    fn dequantize(&self, indices: Tensor<B, 1, Int>) -> Result<Tensor<B, 2>> {
        check_indices(&indices, self.num_codes)?;
        Ok(self.codebook.val().select(0, indices))
    }

    fn num_codes(&self) -> usize {
        self.num_codes
    }

    fn codebook_dim(&self) -> usize {
        self.codebook_dim
    }

    fn input_dim(&self) -> usize {
        self.codebook_dim
    }
}

pub(crate) fn check_indices<B: Backend>(indices: &Tensor<B, 1, Int>, num_codes: usize) -> Result<()> {
    if indices.dims()[0] == 0 {
        return Ok(());
    }

    let low: i64 = indices.clone().min().scalar();
    let high: i64 = indices.clone().max().scalar();
    let index = if low < 0 { low } else { high };

    if index < 0 || index >= num_codes as i64 {
        return Err(VqError::CodeOutOfRange { index, num_codes });
    }

    Ok(())
}
