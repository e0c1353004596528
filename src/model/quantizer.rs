use std::fmt;
use std::str::FromStr;

use burn::module::Module;
use burn::prelude::{Backend, Int, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VqError};

pub mod ema;
pub mod gumbel;
pub mod hard;

pub trait QuantizerConfig {
    type Model<B>: Quantizer<B, Config = Self>
    where
        B: Backend;

    /// Channels the quantizer expects from the pre-quantization projection.
    fn input_dim(&self) -> usize;

    /// Channels of the quantized grid handed to the post-quantization projection.
    fn codebook_dim(&self) -> usize;
}

pub trait Quantizer<B: Backend>: Module<B> {
    type Config: QuantizerConfig;

    const NAME: &'static str;

    fn new(config: Self::Config, device: &B::Device) -> Self;

    fn quantize(&self, latent: Tensor<B, 4>, training: bool) -> Result<Quantized<B>>;

    /// Looks up codebook rows for flat code indices.
    fn dequantize(&self, indices: Tensor<B, 1, Int>) -> Result<Tensor<B, 2>>;

    /// State update run after a training-mode forward pass.
    fn update(&mut self, _latent: Tensor<B, 4>, _info: &QuantizeInfo<B>) {}

    fn num_codes(&self) -> usize;

    fn codebook_dim(&self) -> usize;

    fn input_dim(&self) -> usize;

    fn is_gradient_trained(&self) -> bool {
        true
    }

    fn temperature(&self) -> Option<f32> {
        None
    }

    fn set_temperature(&mut self, _temperature: f32) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizerKind {
    Hard,
    Ema,
    Gumbel,
}

impl FromStr for QuantizerKind {
    type Err = VqError;

    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "hard" | "vq" | "vqgan" => Ok(Self::Hard),
            "ema" | "evqgan" => Ok(Self::Ema),
            "gumbel" | "gvqgan" => Ok(Self::Gumbel),
            _ => Err(VqError::UnsupportedVariant(name.to_string())),
        }
    }
}

impl fmt::Display for QuantizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hard => "hard",
            Self::Ema => "ema",
            Self::Gumbel => "gumbel",
        };
        f.write_str(name)
    }
}

pub struct Quantized<B: Backend> {
    /// Same shape as the latent grid that was quantized.
    pub quantized: Tensor<B, 4>,
    pub loss: Tensor<B, 1>,
    pub info: QuantizeInfo<B>,
}

pub struct QuantizeInfo<B: Backend> {
    /// Flat code indices in (batch, height, width) row-major order.
    pub indices: Tensor<B, 1, Int>,
    pub grid: [usize; 3],
    pub perplexity: Option<Tensor<B, 1>>,
    pub encodings: Option<Tensor<B, 2>>,
}

impl<B: Backend> QuantizeInfo<B> {
    pub fn index_grid(&self) -> Tensor<B, 3, Int> {
        self.indices.clone().reshape(self.grid)
    }

    /// Indices as (batch, tokens_per_image).
    pub fn tokens(&self) -> Tensor<B, 2, Int> {
        let [batch, height, width] = self.grid;
        self.indices.clone().reshape([batch, height * width])
    }
}

/// Validates the latent grid and returns its dimensions.
pub(crate) fn check_latent<B: Backend>(latent: &Tensor<B, 4>, input_dim: usize) -> Result<[usize; 4]> {
    let [batch, channels, height, width] = latent.dims();

    if batch == 0 {
        return Err(VqError::EmptyBatch);
    }
    if channels != input_dim {
        return Err(VqError::ChannelMismatch {
            expected: input_dim,
            got: channels,
        });
    }

    Ok([batch, channels, height, width])
}

/// (b, c, h, w) -> (b·h·w, c)
pub(crate) fn flatten_grid<B: Backend>(grid: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch, channels, height, width] = grid.dims();
    grid.permute([0, 2, 3, 1])
        .reshape([batch * height * width, channels])
}

/// (b·h·w, c) -> (b, c, h, w)
pub(crate) fn unflatten_grid<B: Backend>(flat: Tensor<B, 2>, [batch, height, width]: [usize; 3]) -> Tensor<B, 4> {
    let channels = flat.dims()[1];
    flat.reshape([batch, height, width, channels])
        .permute([0, 3, 1, 2])
}

/// Forward value of `value`, gradient routed unchanged into `path`.
pub fn straight_through<B: Backend, const D: usize>(value: Tensor<B, D>, path: Tensor<B, D>) -> Tensor<B, D> {
    path.clone() - path.detach() + value.detach()
}

/// Column index of the smallest entry of every row, lowest index on ties.
pub(crate) fn first_argmin<B: Backend>(scores: Tensor<B, 2>) -> Tensor<B, 1, Int> {
    let [rows, cols] = scores.dims();
    let device = scores.device();

    let min = scores.clone().min_dim(1);
    let is_min = (scores - min).equal_elem(0.0);

    let positions = Tensor::<B, 1, Int>::arange(0..cols as i64, &device)
        .reshape([1, cols])
        .expand([rows, cols]);
    let candidates = Tensor::<B, 2, Int>::full([rows, cols], cols as i64, &device).mask_where(is_min, positions);

    candidates.min_dim(1).reshape([rows])
}

/// Nearest codebook row for every latent row under squared euclidean distance.
pub(crate) fn nearest_codes<B: Backend>(flat: Tensor<B, 2>, codebook: Tensor<B, 2>) -> Tensor<B, 1, Int> {
    let flat = flat.detach();
    let codebook = codebook.detach();
    let num_codes = codebook.dims()[0];

    let latent_sq = flat.clone().powi_scalar(2).sum_dim(1);
    let code_sq = codebook.clone().powi_scalar(2).sum_dim(1).reshape([1, num_codes]);
    let cross = flat.matmul(codebook.transpose());

    let distances = latent_sq + code_sq - cross * 2.0;
    first_argmin(distances)
}

pub(crate) fn one_hot<B: Backend>(indices: Tensor<B, 1, Int>, num_classes: usize) -> Tensor<B, 2> {
    let rows = indices.dims()[0];
    let device = indices.device();

    Tensor::zeros([rows, num_classes], &device).scatter(
        1,
        indices.reshape([rows, 1]),
        Tensor::ones([rows, 1], &device),
    )
}

/// exp of the entropy of averaged code probabilities (1, K).
pub(crate) fn perplexity<B: Backend>(avg_probs: Tensor<B, 2>) -> Tensor<B, 1> {
    let entropy = (avg_probs.clone() * (avg_probs + 1e-10).log()).sum();
    entropy.neg().exp()
}

#[cfg(test)]
mod tests {
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::NdArray;

    use crate::ops::ScalarExt;

    use super::*;

    type TestBackend = NdArray;

    #[test]
    fn first_argmin_prefers_lowest_index() {
        let device = NdArrayDevice::Cpu;
        let scores = Tensor::<TestBackend, 2>::from_floats([[3.0, 1.0, 1.0], [0.5, 0.5, 0.5], [2.0, 2.0, -1.0]], &device);

        let indices = first_argmin(scores).into_data();

        assert_eq!(indices.iter::<i64>().collect::<Vec<_>>(), vec![1, 0, 2]);
    }

    #[test]
    fn nearest_codes_picks_closest_row() {
        let device = NdArrayDevice::Cpu;
        let codebook = Tensor::<TestBackend, 2>::from_floats([[0.0, 0.0], [1.0, 1.0], [-2.0, 0.0]], &device);
        let latent = Tensor::<TestBackend, 2>::from_floats([[0.9, 1.2], [-1.5, 0.1], [0.1, -0.1]], &device);

        let indices = nearest_codes(latent, codebook).into_data();

        assert_eq!(indices.iter::<i64>().collect::<Vec<_>>(), vec![1, 2, 0]);
    }

    #[test]
    fn grid_flattening_is_row_major() {
        let device = NdArrayDevice::Cpu;
        let grid = Tensor::<TestBackend, 1, Int>::arange(0..24, &device)
            .reshape([2, 3, 2, 2])
            .float();

        let flat = flatten_grid(grid.clone());
        // position (b=0, h=0, w=1) holds channel values 1, 5, 9
        let row: Vec<f32> = flat.clone().slice([1..2, 0..3]).into_data().iter::<f32>().collect();
        assert_eq!(row, vec![1.0, 5.0, 9.0]);

        let restored = unflatten_grid(flat, [2, 2, 2]);
        assert_eq!(
            restored.into_data().iter::<f32>().collect::<Vec<_>>(),
            grid.into_data().iter::<f32>().collect::<Vec<_>>()
        );
    }

    #[test]
    fn uniform_usage_has_full_perplexity() {
        let device = NdArrayDevice::Cpu;
        let indices = Tensor::<TestBackend, 1, Int>::from_ints([0, 1, 2, 3], &device);

        let encodings = one_hot(indices, 4);
        let value: f32 = perplexity(encodings.mean_dim(0)).scalar();

        assert!((value - 4.0).abs() < 1e-4);
    }

    #[test]
    fn variant_names_parse() {
        assert_eq!("vqgan".parse::<QuantizerKind>().unwrap(), QuantizerKind::Hard);
        assert_eq!("EMA".parse::<QuantizerKind>().unwrap(), QuantizerKind::Ema);
        assert_eq!("gumbel".parse::<QuantizerKind>().unwrap(), QuantizerKind::Gumbel);
        assert!(matches!(
            "rq".parse::<QuantizerKind>(),
            Err(VqError::UnsupportedVariant(name)) if name == "rq"
        ));
    }
}
