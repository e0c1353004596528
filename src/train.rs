use burn::config::Config;
use burn::module::{AutodiffModule, Module};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::{Backend, Tensor};
use burn::tensor::backend::AutodiffBackend;
use burn::LearningRate;
use serde::Serialize;

use crate::error::{Result, VqError};
use crate::loss::discriminator::{Discriminator, DiscriminatorConfig};
use crate::loss::perceptual::PerceptualLoss;
use crate::loss::{CompositeLoss, CompositeLossConfig, LossComponents, OptimizerPhase, Split};
use crate::metric::EpochMetrics;
use crate::model::decoder::{Decoder, DecoderConfig};
use crate::model::encoder::{Encoder, EncoderConfig};
use crate::model::quantizer::{Quantizer, QuantizerConfig};
use crate::model::{Autoencoder, AutoencoderConfig, AutoencoderOutput};
use crate::ops::{EpochScheduler, ExponentialLr, GradientNorm, PlateauConfig, ReduceLrOnPlateau, ScalarExt};

/// Metric driving the autoencoder learning rate schedule.
pub const AUTOENCODER_MONITOR: &str = "val/total_loss";
/// Metric driving the discriminator learning rate schedule.
pub const DISCRIMINATOR_MONITOR: &str = "val/disc_loss";

pub type AdamOptimizer<M, B> = OptimizerAdaptor<Adam<<B as AutodiffBackend>::InnerBackend>, M, B>;

/// Exponential decay of the Gumbel temperature, floored at `min`.
#[derive(Config, Debug)]
pub struct TemperatureScheduleConfig {
    #[config(default = 1.0)]
    pub initial: f32,
    #[config(default = 1e-6)]
    pub anneal_rate: f64,
    #[config(default = 0.0625)]
    pub min: f32,
}

impl TemperatureScheduleConfig {
    pub fn at(&self, global_step: u64) -> f32 {
        let decayed = self.initial as f64 * (-self.anneal_rate * global_step as f64).exp();
        f64::max(decayed, self.min as f64) as f32
    }
}

#[derive(Config, Debug)]
pub struct TrainerConfig {
    #[config(default = 4.5e-6)]
    pub learning_rate: f64,
    #[config(default = 0.5)]
    pub beta_1: f32,
    #[config(default = 0.9)]
    pub beta_2: f32,
    /// Scale of the quantizer loss in the autoencoder objective.
    #[config(default = 1.0)]
    pub codebook_weight: f32,
    #[config(default = false)]
    pub lr_decay: bool,
    /// Per-epoch exponential decay factor; replaces the plateau schedule when set.
    pub lr_decay_rate: Option<f64>,
    #[config(default = "PlateauConfig::new()")]
    pub plateau: PlateauConfig,
    #[config(default = "TemperatureScheduleConfig::new()")]
    pub temperature: TemperatureScheduleConfig,
    #[config(default = 1.0)]
    pub eval_temperature: f32,
}

/// Configurations of every part needed to assemble a trainer.
pub struct ConfigBundle<EC, DC, QC, DiscC> {
    pub autoencoder_config: AutoencoderConfig,
    pub encoder_config: EC,
    pub decoder_config: DC,
    pub quantizer_config: QC,
    pub loss_config: CompositeLossConfig,
    pub discriminator_config: DiscC,
    pub trainer_config: TrainerConfig,
}

impl<EC: EncoderConfig, DC: DecoderConfig, QC: QuantizerConfig, DiscC: DiscriminatorConfig> ConfigBundle<EC, DC, QC, DiscC> {
    pub fn init<B: Backend, P: PerceptualLoss<B>>(
        self,
        perceptual: P,
        device: &B::Device,
    ) -> (
        Autoencoder<B, EC::Model<B>, DC::Model<B>, QC::Model<B>>,
        CompositeLoss<B, DiscC::Model<B>, P>,
        TrainerConfig,
    ) {
        let autoencoder = self.autoencoder_config.init(
            self.encoder_config,
            self.decoder_config,
            self.quantizer_config,
            device,
        );
        let loss = self
            .loss_config
            .init(self.discriminator_config, perceptual, device);

        (autoencoder, loss, self.trainer_config)
    }
}

/// One autoencoder forward pass shared by both optimizer phases of a step.
pub struct SharedForward<B: Backend> {
    pub original: Tensor<B, 4>,
    pub output: AutoencoderOutput<B>,
    pub global_step: u64,
    next_phase: Option<OptimizerPhase>,
}

impl<B: Backend> SharedForward<B> {
    pub fn next_phase(&self) -> Option<OptimizerPhase> {
        self.next_phase
    }
}

#[derive(Debug, Clone)]
pub struct PhaseOutput {
    pub phase: OptimizerPhase,
    /// Value minimized by this phase's optimizer.
    pub loss: f32,
    pub components: LossComponents,
    pub grad_norm: Option<f32>,
    /// False when the phase had nothing to optimize (discriminator before its start step).
    pub stepped: bool,
}

#[derive(Debug, Clone)]
pub struct ValidationOutput {
    pub total_loss: f32,
    pub autoencoder: LossComponents,
    pub discriminator: LossComponents,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpochSummary {
    pub metrics: Vec<(String, f64)>,
    pub autoencoder_lr: LearningRate,
    pub discriminator_lr: LearningRate,
}

/// Alternates autoencoder and discriminator updates over shared forward passes.
pub struct Trainer<B, E, D, Q, C, P>
where
    B: AutodiffBackend,
    Autoencoder<B, E, D, Q>: AutodiffModule<B>,
    CompositeLoss<B, C, P>: AutodiffModule<B>,
{
    pub autoencoder: Autoencoder<B, E, D, Q>,
    pub loss: CompositeLoss<B, C, P>,
    autoencoder_optimizer: AdamOptimizer<Autoencoder<B, E, D, Q>, B>,
    discriminator_optimizer: AdamOptimizer<CompositeLoss<B, C, P>, B>,
    autoencoder_scheduler: Option<EpochScheduler>,
    discriminator_scheduler: Option<EpochScheduler>,
    metrics: EpochMetrics,
    config: TrainerConfig,
}

impl<B, E, D, Q, C, P> Trainer<B, E, D, Q, C, P>
where
    B: AutodiffBackend,
    E: Encoder<B>,
    D: Decoder<B>,
    Q: Quantizer<B>,
    C: Discriminator<B>,
    P: PerceptualLoss<B>,
    Autoencoder<B, E, D, Q>: AutodiffModule<B>,
    CompositeLoss<B, C, P>: AutodiffModule<B>,
{
    pub fn new(autoencoder: Autoencoder<B, E, D, Q>, loss: CompositeLoss<B, C, P>, config: TrainerConfig) -> Self {
        let adam = AdamConfig::new()
            .with_beta_1(config.beta_1)
            .with_beta_2(config.beta_2);

        let scheduler = || match config.lr_decay_rate {
            Some(gamma) => EpochScheduler::Exponential(ExponentialLr::new(gamma, config.learning_rate)),
            None => EpochScheduler::Plateau(ReduceLrOnPlateau::new(&config.plateau, config.learning_rate)),
        };
        let schedulers = config.lr_decay.then(|| (scheduler(), scheduler()));
        let (autoencoder_scheduler, discriminator_scheduler) = schedulers.unzip();

        tracing::info!(
            quantizer = Q::NAME,
            codebook_trained_by_gradient = autoencoder.quantizer.is_gradient_trained(),
            autoencoder_params = autoencoder.num_params(),
            discriminator_params = loss.num_params(),
            lr = config.learning_rate,
            lr_decay = config.lr_decay,
            lr_decay_rate = config.lr_decay_rate,
            "trainer ready"
        );

        Self {
            autoencoder,
            loss,
            autoencoder_optimizer: adam.init(),
            discriminator_optimizer: adam.init(),
            autoencoder_scheduler,
            discriminator_scheduler,
            metrics: EpochMetrics::default(),
            config,
        }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &EpochMetrics {
        &self.metrics
    }

    pub fn learning_rate(&self, phase: OptimizerPhase) -> LearningRate {
        let scheduler = match phase {
            OptimizerPhase::Autoencoder => &self.autoencoder_scheduler,
            OptimizerPhase::Discriminator => &self.discriminator_scheduler,
        };

        scheduler
            .as_ref()
            .map(EpochScheduler::lr)
            .unwrap_or(self.config.learning_rate)
    }

    /// Anneals the temperature for `global_step`, then runs the autoencoder once.
    pub fn forward(&mut self, image: Tensor<B, 4>, global_step: u64) -> Result<SharedForward<B>> {
        let temperature = self.config.temperature.at(global_step);
        self.autoencoder.quantizer.set_temperature(temperature);
        if let Some(temperature) = self.autoencoder.quantizer.temperature() {
            tracing::trace!(global_step, temperature, "train/temperature");
        }

        let output = self.autoencoder.forward_step(image.clone(), true)?;

        Ok(SharedForward {
            original: image,
            output,
            global_step,
            next_phase: Some(OptimizerPhase::Autoencoder),
        })
    }

    /// Runs one optimizer phase on a shared forward pass. Phases must come in
    /// order: autoencoder first, then discriminator, each once.
    pub fn step(&mut self, shared: &mut SharedForward<B>, phase: OptimizerPhase) -> Result<PhaseOutput> {
        if shared.next_phase != Some(phase) {
            return Err(VqError::PhaseOrder {
                expected: shared.next_phase,
                got: phase,
            });
        }

        let output = match phase {
            OptimizerPhase::Autoencoder => {
                shared.next_phase = Some(OptimizerPhase::Discriminator);
                self.autoencoder_step(shared)?
            }
            OptimizerPhase::Discriminator => {
                shared.next_phase = None;
                self.discriminator_step(shared)?
            }
        };

        tracing::debug!(
            global_step = shared.global_step,
            phase = ?output.phase,
            loss = output.loss,
            grad_norm = output.grad_norm,
            stepped = output.stepped,
            "optimizer phase"
        );
        for (name, value) in output.components.entries() {
            tracing::trace!(global_step = shared.global_step, value, "{name}");
        }

        Ok(output)
    }

    fn autoencoder_step(&mut self, shared: &SharedForward<B>) -> Result<PhaseOutput> {
        let quant_loss = shared.output.quant_loss.clone();
        let output = self.loss.compute(
            quant_loss.clone(),
            shared.original.clone(),
            shared.output.reconstruction.clone(),
            OptimizerPhase::Autoencoder,
            shared.global_step,
            Some(&shared.output.last_layer),
            Split::Train,
        )?;

        let total = output.loss + quant_loss * self.config.codebook_weight;
        let loss = total.clone().scalar();

        let grads = total.backward();
        let mut grad_norm = GradientNorm::<B>::new(&grads);
        self.autoencoder.visit(&mut grad_norm);
        let grad_norm = grad_norm.norm();

        let grads = GradientsParams::from_grads(grads, &self.autoencoder);
        let lr = self.learning_rate(OptimizerPhase::Autoencoder);
        self.autoencoder = self
            .autoencoder_optimizer
            .step(lr, self.autoencoder.clone(), grads);

        Ok(PhaseOutput {
            phase: OptimizerPhase::Autoencoder,
            loss,
            components: output.components,
            grad_norm: Some(grad_norm),
            stepped: true,
        })
    }

    fn discriminator_step(&mut self, shared: &SharedForward<B>) -> Result<PhaseOutput> {
        let output = self.loss.compute(
            shared.output.quant_loss.clone(),
            shared.original.clone(),
            shared.output.reconstruction.clone(),
            OptimizerPhase::Discriminator,
            shared.global_step,
            None,
            Split::Train,
        )?;
        let loss = output.components.total;

        if output.components.disc_factor == 0.0 {
            return Ok(PhaseOutput {
                phase: OptimizerPhase::Discriminator,
                loss,
                components: output.components,
                grad_norm: None,
                stepped: false,
            });
        }

        let grads = output.loss.backward();
        let mut grad_norm = GradientNorm::<B>::new(&grads);
        self.loss.visit(&mut grad_norm);
        let grad_norm = grad_norm.norm();

        let grads = GradientsParams::from_grads(grads, &self.loss);
        let lr = self.learning_rate(OptimizerPhase::Discriminator);
        self.loss = self.discriminator_optimizer.step(lr, self.loss.clone(), grads);

        Ok(PhaseOutput {
            phase: OptimizerPhase::Discriminator,
            loss,
            components: output.components,
            grad_norm: Some(grad_norm),
            stepped: true,
        })
    }

    /// Forward pass plus both optimizer phases.
    pub fn train_batch(&mut self, image: Tensor<B, 4>, global_step: u64) -> Result<[PhaseOutput; 2]> {
        let mut shared = self.forward(image, global_step)?;
        let autoencoder = self.step(&mut shared, OptimizerPhase::Autoencoder)?;
        let discriminator = self.step(&mut shared, OptimizerPhase::Discriminator)?;

        Ok([autoencoder, discriminator])
    }

    /// Evaluation-mode pass at the evaluation temperature; accumulates the
    /// validation metrics without touching any parameter.
    pub fn validate(&mut self, image: Tensor<B, 4>, global_step: u64) -> Result<ValidationOutput> {
        let batch_size = image.dims()[0];
        let image = image.detach();

        self.autoencoder
            .quantizer
            .set_temperature(self.config.eval_temperature);
        let output = self.autoencoder.forward_step(image.clone(), false)?;
        let reconstruction = output.reconstruction.detach();
        let quant_loss = output.quant_loss.detach();

        let autoencoder = self.loss.compute(
            quant_loss.clone(),
            image.clone(),
            reconstruction.clone(),
            OptimizerPhase::Autoencoder,
            global_step,
            None,
            Split::Val,
        )?;
        let discriminator = self.loss.compute(
            quant_loss.clone(),
            image,
            reconstruction,
            OptimizerPhase::Discriminator,
            global_step,
            None,
            Split::Val,
        )?;

        let total_loss = autoencoder.components.total + autoencoder.components.quant * self.config.codebook_weight;

        for (name, value) in autoencoder
            .components
            .entries()
            .into_iter()
            .chain(discriminator.components.entries())
        {
            self.metrics.update(&name, value as f64, batch_size);
        }
        self.metrics
            .update("val/rec_loss", autoencoder.components.total as f64, batch_size);
        self.metrics
            .update("val/embed_loss", autoencoder.components.quant as f64, batch_size);
        self.metrics.update(AUTOENCODER_MONITOR, total_loss as f64, batch_size);

        if let Some(perplexity) = output.info.perplexity {
            self.metrics
                .update("val/perplexity", perplexity.scalar::<f32>() as f64, batch_size);
        }

        Ok(ValidationOutput {
            total_loss,
            autoencoder: autoencoder.components,
            discriminator: discriminator.components,
        })
    }

    /// Advances the learning rate schedules (plateau schedules see their
    /// monitored validation metric) and resets the epoch accumulators.
    pub fn end_validation_epoch(&mut self) -> EpochSummary {
        let metrics = self.metrics.summary();

        for (scheduler, monitor) in [
            (&mut self.autoencoder_scheduler, AUTOENCODER_MONITOR),
            (&mut self.discriminator_scheduler, DISCRIMINATOR_MONITOR),
        ] {
            if let Some(scheduler) = scheduler.as_mut() {
                scheduler.step(self.metrics.value(monitor));
            }
        }

        self.metrics.clear();

        let summary = EpochSummary {
            metrics,
            autoencoder_lr: self.learning_rate(OptimizerPhase::Autoencoder),
            discriminator_lr: self.learning_rate(OptimizerPhase::Discriminator),
        };
        tracing::info!(
            autoencoder_lr = summary.autoencoder_lr,
            discriminator_lr = summary.discriminator_lr,
            "validation epoch finished"
        );

        summary
    }
}
