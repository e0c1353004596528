use std::fmt;
use std::marker::PhantomData;

use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::relu;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VqError};
use crate::loss::discriminator::{Discriminator, DiscriminatorConfig};
use crate::loss::perceptual::PerceptualLoss;
use crate::model::LastLayerGradient;
use crate::ops::ScalarExt;

pub mod discriminator;
pub mod perceptual;

/// Which optimizer the current loss computation feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptimizerPhase {
    Autoencoder,
    Discriminator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Val,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => f.write_str("train"),
            Split::Val => f.write_str("val"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscLoss {
    #[default]
    Hinge,
    Vanilla,
}

/// Pixel distance between an image and its reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconstructionLoss {
    #[default]
    L1,
    Mse,
    /// Squared below a distance of one, absolute above it.
    SmoothL1,
}

impl ReconstructionLoss {
    pub fn mean<B: Backend>(&self, original: Tensor<B, 4>, reconstruction: Tensor<B, 4>) -> Tensor<B, 1> {
        let diff = original - reconstruction;

        match self {
            ReconstructionLoss::L1 => diff.abs().mean(),
            ReconstructionLoss::Mse => diff.powi_scalar(2).mean(),
            ReconstructionLoss::SmoothL1 => {
                let abs = diff.abs();
                let linear = abs.clone().greater_equal_elem(1.0);
                (abs.clone().powi_scalar(2) * 0.5)
                    .mask_where(linear, abs - 0.5)
                    .mean()
            }
        }
    }
}

#[derive(Config, Debug)]
pub struct CompositeLossConfig {
    /// First global step at which the adversarial terms are active.
    #[config(default = 10000)]
    pub disc_start: u64,
    #[config(default = 0.8)]
    pub disc_weight: f32,
    #[config(default = 1.0)]
    pub disc_factor: f32,
    #[config(default = 1.0)]
    pub perceptual_weight: f32,
    #[config(default = "DiscLoss::Hinge")]
    pub disc_loss: DiscLoss,
    #[config(default = "ReconstructionLoss::L1")]
    pub reconstruction: ReconstructionLoss,
}

impl CompositeLossConfig {
    pub fn init<B: Backend, DC: DiscriminatorConfig, P: PerceptualLoss<B>>(
        self,
        discriminator_config: DC,
        perceptual: P,
        device: &B::Device,
    ) -> CompositeLoss<B, DC::Model<B>, P> {
        CompositeLoss {
            discriminator: <DC::Model<B> as Discriminator<B>>::new(discriminator_config, device),
            perceptual,
            disc_start: self.disc_start,
            disc_weight: self.disc_weight,
            disc_factor: self.disc_factor,
            perceptual_weight: self.perceptual_weight,
            disc_loss: Ignored(self.disc_loss),
            reconstruction: Ignored(self.reconstruction),
            backend: PhantomData,
        }
    }
}

/// Reconstruction, perceptual and adversarial losses for both optimizer phases.
#[derive(Module, Debug)]
pub struct CompositeLoss<B: Backend, C, P> {
    pub discriminator: C,
    pub perceptual: P,
    disc_start: u64,
    disc_weight: f32,
    disc_factor: f32,
    perceptual_weight: f32,
    disc_loss: Ignored<DiscLoss>,
    reconstruction: Ignored<ReconstructionLoss>,
    backend: PhantomData<B>,
}

pub struct LossOutput<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub components: LossComponents,
}

/// Detached scalar values of every term, for logging.
#[derive(Debug, Clone, PartialEq)]
pub struct LossComponents {
    pub split: Split,
    pub phase: OptimizerPhase,
    pub total: f32,
    pub quant: f32,
    pub rec: f32,
    pub perceptual: f32,
    pub nll: f32,
    pub generator: f32,
    pub d_weight: f32,
    pub disc_factor: f32,
    pub logits_real: f32,
    pub logits_fake: f32,
}

impl LossComponents {
    fn new(split: Split, phase: OptimizerPhase, quant: f32, disc_factor: f32) -> Self {
        Self {
            split,
            phase,
            total: 0.0,
            quant,
            rec: 0.0,
            perceptual: 0.0,
            nll: 0.0,
            generator: 0.0,
            d_weight: 0.0,
            disc_factor,
            logits_real: 0.0,
            logits_fake: 0.0,
        }
    }

    /// Metric names prefixed by the split, e.g. `train/l1_loss`. The
    /// trainer owns `rec_loss`, `embed_loss` and `total_loss`.
    pub fn entries(&self) -> Vec<(String, f32)> {
        let named: Vec<(&str, f32)> = match self.phase {
            OptimizerPhase::Autoencoder => vec![
                ("ae_loss", self.total),
                ("quant_loss", self.quant),
                ("nll_loss", self.nll),
                ("pixel_loss", self.rec),
                ("p_loss", self.perceptual),
                ("d_weight", self.d_weight),
                ("disc_factor", self.disc_factor),
                ("g_loss", self.generator),
            ],
            OptimizerPhase::Discriminator => vec![
                ("disc_loss", self.total),
                ("logits_real", self.logits_real),
                ("logits_fake", self.logits_fake),
            ],
        };

        named
            .into_iter()
            .map(|(name, value)| (format!("{}/{}", self.split, name), value))
            .collect()
    }
}

fn softplus<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Tensor<B, D> {
    relu(tensor.clone()) + tensor.abs().neg().exp().log1p()
}

pub fn hinge_d_loss<B: Backend>(logits_real: Tensor<B, 4>, logits_fake: Tensor<B, 4>) -> Tensor<B, 1> {
    let loss_real = relu(logits_real.neg() + 1.0).mean();
    let loss_fake = relu(logits_fake + 1.0).mean();
    (loss_real + loss_fake) * 0.5
}

pub fn vanilla_d_loss<B: Backend>(logits_real: Tensor<B, 4>, logits_fake: Tensor<B, 4>) -> Tensor<B, 1> {
    let loss_real = softplus(logits_real.neg()).mean();
    let loss_fake = softplus(logits_fake).mean();
    (loss_real + loss_fake) * 0.5
}

impl<B, C, P> CompositeLoss<B, C, P>
where
    B: Backend,
    C: Discriminator<B>,
    P: PerceptualLoss<B>,
{
    /// Adversarial weight at `global_step`: zero until `disc_start`.
    pub fn disc_factor_at(&self, global_step: u64) -> f32 {
        match global_step < self.disc_start {
            true => 0.0,
            false => self.disc_factor,
        }
    }

    /// Loss for one optimizer phase. `last_layer` enables the adaptive
    /// adversarial weight; without it the weight is zero.
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        &self,
        quant_loss: Tensor<B, 1>,
        original: Tensor<B, 4>,
        reconstruction: Tensor<B, 4>,
        phase: OptimizerPhase,
        global_step: u64,
        last_layer: Option<&dyn LastLayerGradient<B>>,
        split: Split,
    ) -> Result<LossOutput<B>> {
        if original.dims() != reconstruction.dims() {
            return Err(VqError::ShapeMismatch {
                expected: original.dims().to_vec(),
                got: reconstruction.dims().to_vec(),
            });
        }

        let disc_factor = self.disc_factor_at(global_step);
        let components = LossComponents::new(split, phase, quant_loss.scalar(), disc_factor);

        let output = match phase {
            OptimizerPhase::Autoencoder => self.autoencoder_loss(original, reconstruction, last_layer, components),
            OptimizerPhase::Discriminator => self.discriminator_loss(original, reconstruction, components),
        };

        Ok(output)
    }

    fn nll_terms(&self, perceptual: &P, original: Tensor<B, 4>, reconstruction: Tensor<B, 4>) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let rec = self.reconstruction.0.mean(original.clone(), reconstruction.clone());
        let p_loss = perceptual.forward(original, reconstruction).mean();
        (rec, p_loss)
    }

    fn autoencoder_loss(
        &self,
        original: Tensor<B, 4>,
        reconstruction: Tensor<B, 4>,
        last_layer: Option<&dyn LastLayerGradient<B>>,
        mut components: LossComponents,
    ) -> LossOutput<B> {
        let perceptual = self.perceptual.clone().no_grad();
        let (rec, p_loss) = self.nll_terms(&perceptual, original.clone(), reconstruction.clone());
        let nll = rec.clone() + p_loss.clone() * self.perceptual_weight;

        components.rec = rec.scalar();
        components.perceptual = p_loss.scalar();
        components.nll = nll.scalar();

        if components.disc_factor == 0.0 {
            components.total = components.nll;
            return LossOutput { loss: nll, components };
        }

        let discriminator = self.discriminator.clone().no_grad();
        let generator = discriminator.forward(reconstruction).mean().neg();

        let d_weight = match last_layer {
            Some(last_layer) => {
                let nll_norm = last_layer.grad_norm(&|reconstruction| {
                    let (rec, p_loss) = self.nll_terms(&perceptual, original.clone(), reconstruction);
                    rec + p_loss * self.perceptual_weight
                });
                let generator_norm =
                    last_layer.grad_norm(&|reconstruction| discriminator.forward(reconstruction).mean().neg());

                (nll_norm / (generator_norm + 1e-4)).clamp(0.0, 1e4) * self.disc_weight
            }
            None => 0.0,
        };

        let loss = nll + generator.clone() * (d_weight * components.disc_factor);

        components.generator = generator.scalar();
        components.d_weight = d_weight;
        components.total = loss.scalar();

        LossOutput { loss, components }
    }

    fn discriminator_loss(
        &self,
        original: Tensor<B, 4>,
        reconstruction: Tensor<B, 4>,
        mut components: LossComponents,
    ) -> LossOutput<B> {
        if components.disc_factor == 0.0 {
            return LossOutput {
                loss: Tensor::zeros([1], &original.device()),
                components,
            };
        }

        let logits_real = self.discriminator.forward(original.detach());
        let logits_fake = self.discriminator.forward(reconstruction.detach());

        components.logits_real = logits_real.clone().mean().scalar();
        components.logits_fake = logits_fake.clone().mean().scalar();

        let d_loss = match self.disc_loss.0 {
            DiscLoss::Hinge => hinge_d_loss(logits_real, logits_fake),
            DiscLoss::Vanilla => vanilla_d_loss(logits_real, logits_fake),
        };
        let loss = d_loss * components.disc_factor;
        components.total = loss.scalar();

        LossOutput { loss, components }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    use crate::loss::discriminator::{PatchDiscriminator, PatchDiscriminatorConfig};
    use crate::loss::perceptual::NoPerceptual;
    use crate::model::block::conv1x1;
    use crate::model::LastLayer;

    use super::*;

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    fn loss<B: Backend>(device: &B::Device) -> CompositeLoss<B, PatchDiscriminator<B>, NoPerceptual> {
        CompositeLossConfig::new().with_disc_start(100).init(
            PatchDiscriminatorConfig::new().with_ndf(8).with_num_layers(2),
            NoPerceptual,
            device,
        )
    }

    #[test]
    fn adversarial_terms_are_gated_by_disc_start() {
        TestAutodiffBackend::seed(0);
        let device = NdArrayDevice::Cpu;
        let loss = loss::<TestAutodiffBackend>(&device);

        let hidden = Tensor::random([2, 4, 16, 16], Distribution::Normal(0.0, 1.0), &device);
        let head = conv1x1::<TestAutodiffBackend>(4, 3, &device);
        let reconstruction = head.forward(hidden.clone());
        let last_layer = LastLayer::new(hidden, head);
        let original = Tensor::random([2, 3, 16, 16], Distribution::Uniform(-1.0, 1.0), &device);
        let quant_loss = Tensor::from_floats([0.5], &device);

        let compute = |phase, step| {
            loss.compute(
                quant_loss.clone(),
                original.clone(),
                reconstruction.clone(),
                phase,
                step,
                Some(&last_layer),
                Split::Train,
            )
            .unwrap()
            .components
        };

        let before = compute(OptimizerPhase::Autoencoder, 99);
        assert_eq!(before.disc_factor, 0.0);
        assert_eq!(before.total, before.nll);
        assert_eq!(before.quant, 0.5);

        let after = compute(OptimizerPhase::Autoencoder, 100);
        assert!(after.d_weight > 0.0);
        assert_ne!(after.total, after.nll);

        assert_eq!(compute(OptimizerPhase::Discriminator, 99).total, 0.0);
        assert!(compute(OptimizerPhase::Discriminator, 100).total > 0.0);
    }

    #[test]
    fn validation_without_gradients_has_no_adaptive_weight() {
        TestBackend::seed(1);
        let device = NdArrayDevice::Cpu;
        let loss = loss::<TestBackend>(&device);
        let original = Tensor::random([1, 3, 16, 16], Distribution::Uniform(-1.0, 1.0), &device);
        let reconstruction = Tensor::random([1, 3, 16, 16], Distribution::Uniform(-1.0, 1.0), &device);

        let output = loss
            .compute(
                Tensor::zeros([1], &device),
                original,
                reconstruction,
                OptimizerPhase::Autoencoder,
                1000,
                None,
                Split::Val,
            )
            .unwrap();

        assert_eq!(output.components.d_weight, 0.0);
        assert_eq!(output.components.total, output.components.nll);
        assert_eq!(output.components.entries()[0].0, "val/ae_loss");
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let device = NdArrayDevice::Cpu;
        let loss = loss::<TestBackend>(&device);

        let result = loss.compute(
            Tensor::zeros([1], &device),
            Tensor::zeros([1, 3, 16, 16], &device),
            Tensor::zeros([1, 3, 8, 8], &device),
            OptimizerPhase::Autoencoder,
            0,
            None,
            Split::Train,
        );

        assert!(matches!(result, Err(VqError::ShapeMismatch { .. })));
    }

    #[test]
    fn discriminator_losses_match_reference_values() {
        let device = NdArrayDevice::Cpu;
        let real = Tensor::<TestBackend, 4>::from_floats([[[[2.0, 0.0]]]], &device);
        let fake = Tensor::<TestBackend, 4>::from_floats([[[[-2.0, 0.0]]]], &device);

        // relu(1 - real) = [0, 1], relu(1 + fake) = [0, 1]
        let hinge: f32 = hinge_d_loss(real.clone(), fake.clone()).scalar();
        assert!((hinge - 0.5).abs() < 1e-6);

        // softplus(-2) = 0.126928, softplus(0) = ln 2
        let vanilla: f32 = vanilla_d_loss(real, fake).scalar();
        let expected = 0.5 * (0.126_928 + std::f32::consts::LN_2);
        assert!((vanilla - expected).abs() < 1e-5);
    }

    #[test]
    fn reconstruction_losses_match_reference_values() {
        let device = NdArrayDevice::Cpu;
        let original = Tensor::<TestBackend, 4>::zeros([1, 1, 1, 2], &device);
        let reconstruction = Tensor::<TestBackend, 4>::from_floats([[[[0.5, 3.0]]]], &device);
        let mean = |kind: ReconstructionLoss| -> f32 { kind.mean(original.clone(), reconstruction.clone()).scalar() };

        assert!((mean(ReconstructionLoss::L1) - 1.75).abs() < 1e-6);
        assert!((mean(ReconstructionLoss::Mse) - 4.625).abs() < 1e-6);
        // 0.5 * 0.5^2 below one, 3 - 0.5 above
        assert!((mean(ReconstructionLoss::SmoothL1) - 1.3125).abs() < 1e-6);
    }

    #[test]
    fn mse_objective_drives_the_pixel_term() {
        let device = NdArrayDevice::Cpu;
        let loss = CompositeLossConfig::new()
            .with_disc_start(u64::MAX)
            .with_reconstruction(ReconstructionLoss::Mse)
            .init::<TestBackend, _, _>(PatchDiscriminatorConfig::new().with_ndf(8).with_num_layers(2), NoPerceptual, &device);
        let original = Tensor::<TestBackend, 4>::zeros([1, 3, 16, 16], &device);
        let reconstruction = Tensor::<TestBackend, 4>::ones([1, 3, 16, 16], &device) * 2.0;

        let components = loss
            .compute(
                Tensor::zeros([1], &device),
                original,
                reconstruction,
                OptimizerPhase::Autoencoder,
                u64::MAX - 1,
                None,
                Split::Train,
            )
            .unwrap()
            .components;

        assert_eq!(components.disc_factor, 0.0);
        assert!((components.rec - 4.0).abs() < 1e-6);
        assert_eq!(components.total, components.rec);
    }
}
