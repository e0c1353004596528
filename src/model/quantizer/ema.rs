use burn::config::Config;
use burn::module::{Module, Param};
use burn::prelude::{Backend, Int, Tensor};
use burn::tensor::Distribution;

use crate::error::Result;
use crate::model::quantizer::hard::check_indices;
use crate::model::quantizer::{
    check_latent, flatten_grid, nearest_codes, one_hot, perplexity, straight_through, unflatten_grid, QuantizeInfo,
    Quantized, Quantizer, QuantizerConfig,
};
use crate::ops::ScalarExt;

/// Floor of the smoothing constant; a zero constant divides unused codes by zero.
pub const MIN_EPS: f32 = f32::EPSILON;

#[derive(Config, Debug)]
pub struct EmaQuantizerConfig {
    pub num_codes: usize,
    pub codebook_dim: usize,
    #[config(default = 0.25)]
    pub beta: f32,
    #[config(default = 0.99)]
    pub decay: f32,
    /// Laplace smoothing constant for the cluster sizes, floored at [`MIN_EPS`].
    #[config(default = 1e-5)]
    pub eps: f32,
}

impl EmaQuantizerConfig {
    pub fn init<B: Backend>(self, device: &B::Device) -> EmaQuantizer<B> {
        let codebook: Tensor<B, 2> = Tensor::random(
            [self.num_codes, self.codebook_dim],
            Distribution::Normal(0.0, 1.0),
            device,
        );

        EmaQuantizer {
            codebook: Param::from_tensor(codebook.clone()),
            cluster_size: Param::from_tensor(Tensor::zeros([self.num_codes], device)),
            cluster_sum: Param::from_tensor(codebook),
            num_codes: self.num_codes,
            codebook_dim: self.codebook_dim,
            beta: self.beta,
            decay: self.decay,
            eps: self.eps.max(MIN_EPS),
        }
    }
}

/// Nearest-neighbour quantizer whose codebook follows an exponential moving
/// average of the latents assigned to each entry instead of receiving gradients.
#[derive(Module, Debug)]
pub struct EmaQuantizer<B: Backend> {
    codebook: Param<Tensor<B, 2>>,
    cluster_size: Param<Tensor<B, 1>>,
    cluster_sum: Param<Tensor<B, 2>>,
    num_codes: usize,
    codebook_dim: usize,
    beta: f32,
    decay: f32,
    eps: f32,
}

impl QuantizerConfig for EmaQuantizerConfig {
    type Model<B> = EmaQuantizer<B> where B: Backend;

    fn input_dim(&self) -> usize {
        self.codebook_dim
    }

    fn codebook_dim(&self) -> usize {
        self.codebook_dim
    }
}

impl<B: Backend> EmaQuantizer<B> {
    pub fn codebook(&self) -> Tensor<B, 2> {
        self.codebook.val().detach()
    }

    pub fn cluster_size(&self) -> Tensor<B, 1> {
        self.cluster_size.val().detach()
    }
}

impl<B: Backend> Quantizer<B> for EmaQuantizer<B> {
    type Config = EmaQuantizerConfig;

    const NAME: &'static str = "ema";

    fn new(config: Self::Config, device: &B::Device) -> Self {
        config.init(device)
    }

    fn quantize(&self, latent: Tensor<B, 4>, _training: bool) -> Result<Quantized<B>> {
        let [batch, _, height, width] = check_latent(&latent, self.codebook_dim)?;

        let flat = flatten_grid(latent);
        let codebook = self.codebook();
        let indices = nearest_codes(flat.clone(), codebook.clone());
        let quantized = codebook.select(0, indices.clone());

        let loss = (quantized.clone() - flat.clone()).powi_scalar(2).mean() * self.beta;

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
        Ok(self.codebook().select(0, indices))
    }

    fn update(&mut self, latent: Tensor<B, 4>, info: &QuantizeInfo<B>) {
        let flat = flatten_grid(latent).detach();
        let encodings = match &info.encodings {
            Some(encodings) => encodings.clone().detach(),
            None => one_hot(info.indices.clone(), self.num_codes),
        };

        let counts = encodings.clone().sum_dim(0).reshape([self.num_codes]);
        let sums = encodings.transpose().matmul(flat);

        let decay = self.decay;
        let cluster_size = self.cluster_size() * decay + counts * (1.0 - decay);
        let cluster_sum = self.cluster_sum.val().detach() * decay + sums * (1.0 - decay);

        let total: f32 = cluster_size.clone().sum().scalar();
        if total > 0.0 {
            let scale = total / (total + self.num_codes as f32 * self.eps);
            let smoothed = (cluster_size.clone() + self.eps) * scale;
            let codebook = cluster_sum.clone() / smoothed.reshape([self.num_codes, 1]);
            self.codebook = Param::initialized(self.codebook.id.clone(), codebook);
        }

        self.cluster_size = Param::initialized(self.cluster_size.id.clone(), cluster_size);
        self.cluster_sum = Param::initialized(self.cluster_sum.id.clone(), cluster_sum);
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

    fn is_gradient_trained(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::{Autodiff, NdArray};

    use super::*;

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    fn values<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
        tensor.into_data().iter::<f32>().collect()
    }

    #[test]
    fn training_updates_move_the_codebook() {
        TestBackend::seed(3);
        let device = NdArrayDevice::Cpu;
        let mut quantizer = EmaQuantizerConfig::new(8, 4).init::<TestBackend>(&device);
        let before = values(quantizer.codebook());

        for _ in 0..3 {
            let latent = Tensor::random([2, 4, 3, 3], Distribution::Normal(2.0, 1.0), &device);
            let output = quantizer.quantize(latent.clone(), true).unwrap();
            quantizer.update(latent, &output.info);
        }

        assert_ne!(values(quantizer.codebook()), before);
        let seen: f32 = quantizer.cluster_size().sum().scalar();
        assert!(seen > 0.0);
    }

    #[test]
    fn evaluation_passes_leave_state_untouched() {
        TestBackend::seed(4);
        let device = NdArrayDevice::Cpu;
        let quantizer = EmaQuantizerConfig::new(8, 4).init::<TestBackend>(&device);
        let before = values(quantizer.codebook());

        for _ in 0..3 {
            let latent = Tensor::random([2, 4, 3, 3], Distribution::Normal(0.0, 1.0), &device);
            quantizer.quantize(latent, false).unwrap();
        }

        assert_eq!(values(quantizer.codebook()), before);
    }

    #[test]
    fn single_assignment_pulls_code_towards_latent() {
        TestBackend::seed(6);
        let device = NdArrayDevice::Cpu;
        let mut quantizer = EmaQuantizerConfig::new(2, 2)
            .with_decay(0.5)
            .init::<TestBackend>(&device);
        let latent = Tensor::<TestBackend, 4>::from_floats([[[[10.0]], [[10.0]]]], &device);

        let output = quantizer.quantize(latent.clone(), true).unwrap();
        let index: i64 = output.info.indices.clone().scalar();
        quantizer.update(latent, &output.info);

        let row = values(quantizer.codebook().select(0, Tensor::from_ints([index as i32], &device)));
        let sizes = values(quantizer.cluster_size());
        assert_eq!(sizes[index as usize], 0.5);
        // total size 0.5 is almost all on one code, so the code becomes about (0.5·old + 0.5·10) / 0.5
        assert!(row.iter().all(|value| *value > 5.0));
        assert!(values(quantizer.codebook()).iter().all(|value| value.is_finite()));
    }

    #[test]
    fn zero_eps_is_floored_and_unused_codes_stay_finite() {
        TestBackend::seed(7);
        let device = NdArrayDevice::Cpu;
        let mut quantizer = EmaQuantizerConfig::new(4, 2)
            .with_eps(0.0)
            .init::<TestBackend>(&device);
        assert_eq!(quantizer.eps, MIN_EPS);

        let latent = Tensor::<TestBackend, 4>::from_floats([[[[3.0]], [[-1.0]]]], &device);
        let output = quantizer.quantize(latent.clone(), true).unwrap();
        quantizer.update(latent, &output.info);

        assert!(values(quantizer.codebook()).iter().all(|value| value.is_finite()));
    }

    #[test]
    fn loss_is_the_commitment_term_only() {
        let device = NdArrayDevice::Cpu;
        let mut quantizer = EmaQuantizerConfig::new(2, 2).init::<TestAutodiffBackend>(&device);
        quantizer.codebook = Param::from_tensor(Tensor::from_floats([[0.0, 0.0], [1.0, 1.0]], &device));

        // positions (0.2, 0.1) -> code 0 and (0.9, 1.4) -> code 1
        let latent = Tensor::<TestAutodiffBackend, 4>::from_floats([[[[0.2, 0.9]], [[0.1, 1.4]]]], &device)
            .require_grad();
        let output = quantizer.quantize(latent.clone(), true).unwrap();

        // 0.25 · (0.04 + 0.01 + 0.01 + 0.16) / 4
        let loss: f32 = output.loss.clone().scalar();
        assert!((loss - 0.013_75).abs() < 1e-6);

        let grads = output.loss.backward();
        assert!(quantizer.codebook.val().grad(&grads).is_none());
        // d/dz of 0.25 · mean((z - q)^2) over four elements is 0.125 · (z - q)
        let latent_grad: Vec<f32> = latent.grad(&grads).unwrap().into_data().iter::<f32>().collect();
        let expected = [0.025, -0.0125, 0.0125, 0.05];
        for (got, want) in latent_grad.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn dequantize_reproduces_quantized_grid() {
        TestBackend::seed(5);
        let device = NdArrayDevice::Cpu;
        let quantizer = EmaQuantizerConfig::new(8, 3).init::<TestBackend>(&device);
        let latent = Tensor::random([2, 3, 4, 4], Distribution::Normal(0.0, 1.0), &device);

        let output = quantizer.quantize(latent, false).unwrap();
        let rows = quantizer.dequantize(output.info.indices.clone()).unwrap();

        assert_eq!(values(unflatten_grid(rows, output.info.grid)), values(output.quantized));
    }
}
