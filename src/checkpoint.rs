use std::fs;
use std::path::{Path, PathBuf};

use burn::config::Config;
use burn::module::Module;
use burn::prelude::Backend;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};

use crate::config::VqganConfig;
use crate::error::Result;
use crate::train::EpochSummary;

pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Directory holding `config.json` and one autoencoder and loss record per epoch.
#[derive(Debug, Clone)]
pub struct Checkpoints {
    root: PathBuf,
}

impl Checkpoints {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Record path without extension; the recorder appends `.mpk`.
    fn record_path(&self, name: &str, epoch: usize) -> PathBuf {
        self.root.join(format!("{name}-{epoch}"))
    }

    pub fn save_config(&self, config: &VqganConfig) -> Result<()> {
        config.save(self.config_path())?;
        Ok(())
    }

    pub fn load_config(&self) -> Result<VqganConfig> {
        let config = VqganConfig::load(self.config_path())?;
        config.validate()?;

        Ok(config)
    }

    /// Writes the parameter record of `module` (codebook and EMA statistics included).
    pub fn save_module<B: Backend, M: Module<B>>(&self, name: &str, epoch: usize, module: M) -> Result<()> {
        let path = self.record_path(name, epoch);
        module.save_file(path.clone(), &CheckpointRecorder::new())?;
        tracing::info!(path = %path.display(), epoch, "saved {name} record");

        Ok(())
    }

    /// Loads a record into a freshly initialized module of the same configuration.
    pub fn load_module<B: Backend, M: Module<B>>(
        &self,
        name: &str,
        epoch: usize,
        module: M,
        device: &B::Device,
    ) -> Result<M> {
        let path = self.record_path(name, epoch);
        let module = module.load_file(path.clone(), &CheckpointRecorder::new(), device)?;
        tracing::info!(path = %path.display(), epoch, "loaded {name} record");

        Ok(module)
    }

    pub fn save_summary(&self, epoch: usize, summary: &EpochSummary) -> Result<()> {
        let path = self.root.join(format!("metrics-{epoch}.json"));
        let file = fs::File::create(&path)?;
        serde_json::to_writer_pretty(file, summary).map_err(std::io::Error::from)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::NdArray;
    use burn::prelude::Tensor;
    use burn::tensor::Distribution;

    use crate::config::tiny::tiny_config;
    use crate::model::quantizer::ema::EmaQuantizerConfig;
    use crate::model::quantizer::{Quantizer, QuantizerKind};

    use super::*;

    type TestBackend = NdArray;

    fn scratch_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vqgan-{name}-{}", std::process::id()))
    }

    fn values<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
        tensor.into_data().iter::<f32>().collect()
    }

    #[test]
    fn config_survives_a_round_trip() {
        let checkpoints = Checkpoints::new(scratch_dir("config")).unwrap();
        let config = tiny_config(QuantizerKind::Ema).with_disc_start(3);

        checkpoints.save_config(&config).unwrap();
        let restored = checkpoints.load_config().unwrap();

        assert_eq!(restored.quantizer, QuantizerKind::Ema);
        assert_eq!(restored.disc_start, 3);
        fs::remove_dir_all(checkpoints.root()).unwrap();
    }

    #[test]
    fn ema_statistics_are_part_of_the_record() {
        let device = NdArrayDevice::Cpu;
        let checkpoints = Checkpoints::new(scratch_dir("ema")).unwrap();
        let config = EmaQuantizerConfig::new(8, 4);

        TestBackend::seed(0);
        let mut quantizer = config.clone().init::<TestBackend>(&device);
        let latent = Tensor::random([2, 4, 3, 3], Distribution::Normal(0.0, 1.0), &device);
        let quantized = quantizer.quantize(latent.clone(), true).unwrap();
        quantizer.update(latent, &quantized.info);
        checkpoints.save_module("quantizer", 1, quantizer.clone()).unwrap();

        TestBackend::seed(1);
        let fresh = config.init::<TestBackend>(&device);
        let restored = checkpoints.load_module("quantizer", 1, fresh, &device).unwrap();

        assert_eq!(values(restored.codebook()), values(quantizer.codebook()));
        assert_eq!(values(restored.cluster_size()), values(quantizer.cluster_size()));
        fs::remove_dir_all(checkpoints.root()).unwrap();
    }
}
