use burn::config::Config;

use crate::error::{Result, VqError};
use crate::loss::discriminator::PatchDiscriminatorConfig;
use crate::loss::{CompositeLossConfig, DiscLoss, ReconstructionLoss};
use crate::model::decoder::conv::ConvDecoderConfig;
use crate::model::encoder::conv::ConvEncoderConfig;
use crate::model::init::InitPolicy;
use crate::model::quantizer::ema::EmaQuantizerConfig;
use crate::model::quantizer::gumbel::GumbelQuantizerConfig;
use crate::model::quantizer::hard::VectorQuantizerConfig;
use crate::model::quantizer::{QuantizerConfig, QuantizerKind};
use crate::model::AutoencoderConfig;
use crate::ops::PlateauConfig;
use crate::train::{ConfigBundle, TemperatureScheduleConfig, TrainerConfig};

pub mod f16;
pub mod tiny;
pub mod vqvae;

pub type ConvBundle<QC> = ConfigBundle<ConvEncoderConfig, ConvDecoderConfig, QC, PatchDiscriminatorConfig>;

/// Every hyperparameter of a run, persisted next to the checkpoints as `config.json`.
#[derive(Config, Debug)]
pub struct VqganConfig {
    #[config(default = 256)]
    pub resolution: usize,
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = 3)]
    pub out_channels: usize,
    #[config(default = 128)]
    pub hidden_dim: usize,
    #[config(default = "vec![1, 1, 2, 2, 4]")]
    pub ch_mult: Vec<usize>,
    #[config(default = 2)]
    pub num_res_blocks: usize,
    #[config(default = "vec![16]")]
    pub attn_resolutions: Vec<usize>,
    #[config(default = 0.0)]
    pub dropout: f64,
    #[config(default = 256)]
    pub z_channels: usize,
    #[config(default = false)]
    pub double_z: bool,

    #[config(default = "QuantizerKind::Hard")]
    pub quantizer: QuantizerKind,
    #[config(default = 1024)]
    pub num_codes: usize,
    #[config(default = 256)]
    pub codebook_dim: usize,
    #[config(default = 0.25)]
    pub quant_beta: f32,
    #[config(default = 0.99)]
    pub ema_decay: f32,
    #[config(default = 1e-5)]
    pub ema_eps: f32,
    #[config(default = 1.0)]
    pub starting_temp: f32,
    #[config(default = 0.0625)]
    pub temp_min: f32,
    #[config(default = 1e-6)]
    pub anneal_rate: f64,
    #[config(default = 5e-4)]
    pub kl_weight: f32,
    #[config(default = true)]
    pub straight_through: bool,

    #[config(default = 10000)]
    pub disc_start: u64,
    #[config(default = 0.8)]
    pub disc_weight: f32,
    #[config(default = 1.0)]
    pub disc_factor: f32,
    #[config(default = 1.0)]
    pub codebook_weight: f32,
    #[config(default = 1.0)]
    pub perceptual_weight: f32,
    #[config(default = 3)]
    pub disc_in_channels: usize,
    #[config(default = 64)]
    pub disc_ndf: usize,
    #[config(default = 3)]
    pub disc_num_layers: usize,
    #[config(default = "DiscLoss::Hinge")]
    pub disc_loss: DiscLoss,
    #[config(default = "ReconstructionLoss::L1")]
    pub reconstruction_loss: ReconstructionLoss,

    #[config(default = 4.5e-6)]
    pub learning_rate: f64,
    #[config(default = false)]
    pub lr_decay: bool,
    /// Exponential per-epoch decay used instead of the plateau schedule when set.
    pub lr_decay_rate: Option<f64>,
    #[config(default = 8)]
    pub batch_size: usize,
    /// Whether the driver logs codebook usage of a held-out batch after each validation epoch.
    #[config(default = false)]
    pub log_images: bool,
    #[config(default = "InitPolicy::NameMatch")]
    pub init_policy: InitPolicy,
}

impl VqganConfig {
    /// Rejects combinations that cannot build a working model.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(VqError::InvalidConfig(message));

        if self.ch_mult.is_empty() {
            return invalid("ch_mult must name at least one level".into());
        }
        let downsampling = 1usize << (self.ch_mult.len() - 1);
        if self.resolution == 0 || self.resolution % downsampling != 0 {
            return invalid(format!(
                "resolution {} is not divisible by the encoder downsampling factor {downsampling}",
                self.resolution
            ));
        }
        if self.num_codes == 0 || self.codebook_dim == 0 {
            return invalid("codebook must have at least one code of positive dimension".into());
        }
        if self.in_channels != self.disc_in_channels {
            return Err(VqError::ChannelMismatch {
                expected: self.in_channels,
                got: self.disc_in_channels,
            });
        }
        if self.in_channels != self.out_channels {
            return Err(VqError::ChannelMismatch {
                expected: self.in_channels,
                got: self.out_channels,
            });
        }
        if !(0.0..1.0).contains(&self.ema_decay) {
            return invalid(format!("ema_decay {} must lie in [0, 1)", self.ema_decay));
        }
        if self.ema_eps.is_nan() || self.ema_eps <= 0.0 {
            return invalid(format!("ema_eps {} must be positive", self.ema_eps));
        }
        if self.starting_temp <= 0.0 || self.temp_min <= 0.0 {
            return invalid("gumbel temperatures must be positive".into());
        }
        if let Some(rate) = self.lr_decay_rate {
            if rate.is_nan() || rate <= 0.0 || rate > 1.0 {
                return invalid(format!("lr_decay_rate {rate} must lie in (0, 1]"));
            }
        }
        if self.batch_size == 0 {
            return Err(VqError::EmptyBatch);
        }

        Ok(())
    }

    /// Side of the latent grid.
    pub fn latent_resolution(&self) -> usize {
        self.resolution >> self.ch_mult.len().saturating_sub(1)
    }

    pub fn tokens_per_image(&self) -> usize {
        self.latent_resolution().pow(2)
    }

    pub fn encoder_config(&self) -> ConvEncoderConfig {
        ConvEncoderConfig::new(
            self.in_channels,
            self.hidden_dim,
            self.ch_mult.clone(),
            self.num_res_blocks,
            self.attn_resolutions.clone(),
            self.resolution,
            self.z_channels,
        )
        .with_dropout(self.dropout)
        .with_double_z(self.double_z)
    }

    pub fn decoder_config(&self) -> ConvDecoderConfig {
        ConvDecoderConfig::new(
            self.out_channels,
            self.hidden_dim,
            self.ch_mult.clone(),
            self.num_res_blocks,
            self.attn_resolutions.clone(),
            self.resolution,
            self.z_channels,
        )
        .with_dropout(self.dropout)
    }

    pub fn hard_quantizer_config(&self) -> VectorQuantizerConfig {
        VectorQuantizerConfig::new(self.num_codes, self.codebook_dim).with_beta(self.quant_beta)
    }

    pub fn ema_quantizer_config(&self) -> EmaQuantizerConfig {
        EmaQuantizerConfig::new(self.num_codes, self.codebook_dim)
            .with_beta(self.quant_beta)
            .with_decay(self.ema_decay)
            .with_eps(self.ema_eps)
    }

    pub fn gumbel_quantizer_config(&self) -> GumbelQuantizerConfig {
        GumbelQuantizerConfig::new(self.num_codes, self.codebook_dim)
            .with_kl_weight(self.kl_weight)
            .with_temperature(self.starting_temp)
            .with_straight_through(self.straight_through)
    }

    pub fn discriminator_config(&self) -> PatchDiscriminatorConfig {
        PatchDiscriminatorConfig::new()
            .with_in_channels(self.disc_in_channels)
            .with_ndf(self.disc_ndf)
            .with_num_layers(self.disc_num_layers)
    }

    pub fn loss_config(&self) -> CompositeLossConfig {
        CompositeLossConfig::new()
            .with_disc_start(self.disc_start)
            .with_disc_weight(self.disc_weight)
            .with_disc_factor(self.disc_factor)
            .with_perceptual_weight(self.perceptual_weight)
            .with_disc_loss(self.disc_loss)
            .with_reconstruction(self.reconstruction_loss)
    }

    pub fn trainer_config(&self) -> TrainerConfig {
        TrainerConfig::new()
            .with_learning_rate(self.learning_rate)
            .with_codebook_weight(self.codebook_weight)
            .with_lr_decay(self.lr_decay)
            .with_lr_decay_rate(self.lr_decay_rate)
            .with_plateau(PlateauConfig::new())
            .with_temperature(
                TemperatureScheduleConfig::new()
                    .with_initial(self.starting_temp)
                    .with_anneal_rate(self.anneal_rate)
                    .with_min(self.temp_min),
            )
    }

    pub fn autoencoder_config(&self) -> AutoencoderConfig {
        AutoencoderConfig::new().with_init_policy(self.init_policy)
    }

    /// Validated configurations for every part, around the given quantizer.
    pub fn bundle<QC: QuantizerConfig>(&self, quantizer_config: QC) -> Result<ConvBundle<QC>> {
        self.validate()?;

        if quantizer_config.codebook_dim() != self.codebook_dim {
            return Err(VqError::ChannelMismatch {
                expected: self.codebook_dim,
                got: quantizer_config.codebook_dim(),
            });
        }

        Ok(ConfigBundle {
            autoencoder_config: self.autoencoder_config(),
            encoder_config: self.encoder_config(),
            decoder_config: self.decoder_config(),
            quantizer_config,
            loss_config: self.loss_config(),
            discriminator_config: self.discriminator_config(),
            trainer_config: self.trainer_config(),
        })
    }
}
