use crate::config::VqganConfig;
use crate::loss::ReconstructionLoss;

/// Reconstruction-only variant of `base`: no discriminator step and no
/// perceptual term, MSE (or smooth L1) pixels, learning rate decayed by
/// `lr_decay_rate` every epoch.
pub fn vqvae_config(base: VqganConfig, smooth_l1: bool, lr_decay_rate: f64) -> VqganConfig {
    let reconstruction = match smooth_l1 {
        true => ReconstructionLoss::SmoothL1,
        false => ReconstructionLoss::Mse,
    };

    base.with_disc_start(u64::MAX)
        .with_disc_factor(0.0)
        .with_perceptual_weight(0.0)
        .with_reconstruction_loss(reconstruction)
        .with_lr_decay(true)
        .with_lr_decay_rate(Some(lr_decay_rate))
}
