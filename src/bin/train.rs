use std::collections::HashSet;
use std::env;

use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, Wgpu};
use burn::module::AutodiffModule;
use burn::prelude::{Backend, Tensor};
use burn::tensor::TensorData;
use color_eyre::eyre::eyre;
use rand::Rng;
use tracing_subscriber::EnvFilter;

use vqgan::checkpoint::Checkpoints;
use vqgan::config::tiny::tiny_config;
use vqgan::config::vqvae::vqvae_config;
use vqgan::config::VqganConfig;
use vqgan::loss::discriminator::PatchDiscriminator;
use vqgan::loss::perceptual::NoPerceptual;
use vqgan::loss::CompositeLoss;
use vqgan::model::decoder::conv::ConvDecoder;
use vqgan::model::encoder::conv::ConvEncoder;
use vqgan::model::quantizer::{QuantizerConfig, QuantizerKind};
use vqgan::model::Autoencoder;
use vqgan::train::Trainer;

type B = Autodiff<Wgpu>;

const STEPS_PER_EPOCH: u64 = 50;
const VALID_BATCHES: usize = 4;

/// Batch of smooth random colour gradients in [-1, 1], standing in for an image dataset.
fn synthetic_batch(config: &VqganConfig, device: &WgpuDevice) -> Tensor<B, 4> {
    let mut rng = rand::thread_rng();
    let [batch, channels, size] = [config.batch_size, config.in_channels, config.resolution];

    let mut pixels = Vec::with_capacity(batch * channels * size * size);
    for _ in 0..batch * channels {
        let (fx, fy) = (rng.gen_range(0.5..4.0f32), rng.gen_range(0.5..4.0f32));
        let phase = rng.gen_range(0.0..std::f32::consts::TAU);
        for y in 0..size {
            for x in 0..size {
                let (u, v) = (x as f32 / size as f32, y as f32 / size as f32);
                pixels.push((fx * u * std::f32::consts::TAU + fy * v * std::f32::consts::TAU + phase).sin());
            }
        }
    }

    Tensor::from_data(TensorData::new(pixels, [batch, channels, size, size]), device)
}

fn run<QC>(config: &VqganConfig, quantizer_config: QC, checkpoints: &Checkpoints, epochs: usize) -> color_eyre::Result<()>
where
    QC: QuantizerConfig,
    Autoencoder<B, ConvEncoder<B>, ConvDecoder<B>, QC::Model<B>>: AutodiffModule<B>,
    CompositeLoss<B, PatchDiscriminator<B>, NoPerceptual>: AutodiffModule<B>,
{
    let device = WgpuDevice::default();
    let (autoencoder, loss, trainer_config) = config.bundle(quantizer_config)?.init::<B, _>(NoPerceptual, &device);
    let mut trainer = Trainer::new(autoencoder, loss, trainer_config);

    let mut global_step = 0;
    for epoch in 0..epochs {
        for _ in 0..STEPS_PER_EPOCH {
            let [autoencoder, discriminator] = trainer.train_batch(synthetic_batch(config, &device), global_step)?;
            if global_step % 10 == 0 {
                tracing::info!(
                    epoch,
                    global_step,
                    ae_loss = autoencoder.loss,
                    rec_loss = autoencoder.components.rec,
                    disc_loss = discriminator.loss,
                    "train"
                );
            }
            global_step += 1;
        }

        for _ in 0..VALID_BATCHES {
            trainer.validate(synthetic_batch(config, &device), global_step)?;
        }

        if config.log_images {
            let image = (synthetic_batch(config, &device) + 1.0) / 2.0;
            let tokens: Vec<i64> = trainer
                .autoencoder
                .get_codebook_indices(image)?
                .into_data()
                .iter::<i64>()
                .collect();
            let used = tokens.iter().collect::<HashSet<_>>().len();
            tracing::info!(epoch, used, num_codes = config.num_codes, "codebook usage");
        }

        let summary = trainer.end_validation_epoch();
        for (name, value) in &summary.metrics {
            tracing::info!(epoch, value, "{name}");
        }

        checkpoints.save_summary(epoch, &summary)?;
        checkpoints.save_module::<B, _>("autoencoder", epoch, trainer.autoencoder.clone())?;
        checkpoints.save_module::<B, _>("loss", epoch, trainer.loss.clone())?;
    }

    Ok(())
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vqgan=info,train=info")))
        .init();

    let (flags, args): (Vec<String>, Vec<String>) = env::args().skip(1).partition(|arg| arg.starts_with("--"));
    let reconstruction_only = flags.iter().any(|flag| flag == "--vqvae");
    let mut args = args.into_iter();
    let kind: QuantizerKind = args.next().as_deref().unwrap_or("hard").parse()?;
    let epochs: usize = match args.next() {
        Some(epochs) => epochs.parse().map_err(|_| eyre!("epochs must be a number, got {epochs}"))?,
        None => 2,
    };

    B::seed(42);
    let config = match reconstruction_only {
        true => vqvae_config(tiny_config(kind), false, 0.99),
        false => tiny_config(kind),
    };
    let checkpoints = Checkpoints::new(".out")?;
    checkpoints.save_config(&config)?;

    match kind {
        QuantizerKind::Hard => run(&config, config.hard_quantizer_config(), &checkpoints, epochs),
        QuantizerKind::Ema => run(&config, config.ema_quantizer_config(), &checkpoints, epochs),
        QuantizerKind::Gumbel => run(&config, config.gumbel_quantizer_config(), &checkpoints, epochs),
    }
}
