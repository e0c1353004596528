use burn::config::Config;
use burn::module::{ModuleVisitor, ParamId};
use burn::prelude::{Backend, ElementConversion, Int, Tensor};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Element;
use burn::LearningRate;
use serde::{Deserialize, Serialize};

pub fn l2<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Tensor<B, 1> {
    let tensor = tensor.flatten::<1>(0, D - 1);
    let squared = tensor.powi_scalar(2);
    let summed = squared.sum();
    let norm = summed.sqrt();
    norm
}

pub trait ScalarExt<B: Backend> {
    fn scalar<E: Element>(&self) -> E;
}

impl<B: Backend> ScalarExt<B> for Tensor<B, 1> {
    fn scalar<E: Element>(&self) -> E {
        debug_assert_eq!(self.dims()[0], 1);
        self.clone().into_scalar().elem()
    }
}

impl<B: Backend> ScalarExt<B> for Tensor<B, 1, Int> {
    fn scalar<E: Element>(&self) -> E {
        debug_assert_eq!(self.dims()[0], 1);
        self.clone().into_scalar().elem()
    }
}

/// Accumulates the squared L2 norm of every parameter gradient of the visited module.
pub struct GradientNorm<'a, B: AutodiffBackend> {
    pub grads: &'a B::Gradients,
    pub total_norm: f32,
}

impl<'a, B: AutodiffBackend> GradientNorm<'a, B> {
    pub fn new(grads: &'a B::Gradients) -> Self {
        Self {
            grads,
            total_norm: 0.0,
        }
    }

    pub fn norm(&self) -> f32 {
        self.total_norm.sqrt()
    }
}

impl<'a, B: AutodiffBackend> ModuleVisitor<B> for GradientNorm<'a, B> {
    fn visit_float<const D: usize>(&mut self, _id: &ParamId, tensor: &Tensor<B, D>) {
        if let Some(grads) = tensor.grad(self.grads) {
            let param_norm: f32 = l2(grads).scalar();
            self.total_norm += param_norm * param_norm;
        }
    }
}

#[derive(Config, Debug)]
pub struct PlateauConfig {
    #[config(default = 0.5)]
    pub factor: f64,
    #[config(default = 10)]
    pub patience: usize,
    #[config(default = 10)]
    pub cooldown: usize,
    #[config(default = 1e-6)]
    pub min_lr: f64,
    /// Relative improvement a metric needs to count as better.
    #[config(default = 1e-4)]
    pub threshold: f64,
}

/// Learning rate reduction when a monitored metric stops improving (mode `min`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    cooldown: usize,
    min_lr: f64,
    threshold: f64,
    lr: LearningRate,
    best: Option<f64>,
    num_bad_epochs: usize,
    cooldown_counter: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(config: &PlateauConfig, initial_lr: LearningRate) -> Self {
        Self {
            factor: config.factor,
            patience: config.patience,
            cooldown: config.cooldown,
            min_lr: config.min_lr,
            threshold: config.threshold,
            lr: initial_lr,
            best: None,
            num_bad_epochs: 0,
            cooldown_counter: 0,
        }
    }

    pub fn lr(&self) -> LearningRate {
        self.lr
    }

    fn is_better(&self, metric: f64) -> bool {
        match self.best {
            None => true,
            Some(best) => metric < best * (1.0 - self.threshold),
        }
    }

    /// Reports the metric observed at the end of an epoch and returns the learning rate to use next.
    pub fn step(&mut self, metric: f64) -> LearningRate {
        if metric.is_nan() {
            self.num_bad_epochs += 1;
        } else if self.is_better(metric) {
            self.best = Some(metric);
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.num_bad_epochs = 0;
        }

        if self.num_bad_epochs > self.patience {
            let reduced = f64::max(self.lr * self.factor, self.min_lr);
            if self.lr - reduced > 1e-8 {
                tracing::info!(from = self.lr, to = reduced, "reducing learning rate on plateau");
                self.lr = reduced;
            }
            self.cooldown_counter = self.cooldown;
            self.num_bad_epochs = 0;
        }

        self.lr
    }
}

/// Multiplies the learning rate by `gamma` at the end of every epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialLr {
    gamma: f64,
    lr: LearningRate,
}

impl ExponentialLr {
    pub fn new(gamma: f64, initial_lr: LearningRate) -> Self {
        Self { gamma, lr: initial_lr }
    }

    pub fn lr(&self) -> LearningRate {
        self.lr
    }

    pub fn step(&mut self) -> LearningRate {
        self.lr *= self.gamma;
        self.lr
    }
}

/// Learning rate policy of one optimizer, advanced once per validation epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EpochScheduler {
    Plateau(ReduceLrOnPlateau),
    Exponential(ExponentialLr),
}

impl EpochScheduler {
    pub fn lr(&self) -> LearningRate {
        match self {
            EpochScheduler::Plateau(scheduler) => scheduler.lr(),
            EpochScheduler::Exponential(scheduler) => scheduler.lr(),
        }
    }

    /// A plateau schedule without its monitored metric keeps the current rate.
    pub fn step(&mut self, metric: Option<f64>) -> LearningRate {
        match (self, metric) {
            (EpochScheduler::Plateau(scheduler), Some(metric)) => scheduler.step(metric),
            (EpochScheduler::Plateau(scheduler), None) => scheduler.lr(),
            (EpochScheduler::Exponential(scheduler), _) => scheduler.step(),
        }
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use burn::backend::ndarray::NdArrayDevice;

    use super::*;

    #[test]
    fn l2_of_known_vector() {
        let device = NdArrayDevice::Cpu;
        let tensor = Tensor::<NdArray, 2>::from_floats([[3.0, 0.0], [0.0, 4.0]], &device);

        let norm: f32 = l2(tensor).scalar();
        assert!((norm - 5.0).abs() < 1e-6);
    }

    #[test]
    fn plateau_reduces_after_patience_then_cools_down() {
        let config = PlateauConfig::new().with_patience(2).with_cooldown(1).with_factor(0.5);
        let mut scheduler = ReduceLrOnPlateau::new(&config, 1.0);

        assert_eq!(scheduler.step(1.0), 1.0);
        // two bad epochs are tolerated
        assert_eq!(scheduler.step(1.0), 1.0);
        assert_eq!(scheduler.step(1.0), 1.0);
        // the third one triggers a reduction
        assert_eq!(scheduler.step(1.0), 0.5);
        // cooldown swallows the next bad epoch
        assert_eq!(scheduler.step(1.0), 0.5);
        assert_eq!(scheduler.step(1.0), 0.5);
        assert_eq!(scheduler.step(1.0), 0.5);
        assert_eq!(scheduler.step(1.0), 0.25);
    }

    #[test]
    fn plateau_respects_min_lr_and_improvements() {
        let config = PlateauConfig::new()
            .with_patience(0)
            .with_cooldown(0)
            .with_factor(0.1)
            .with_min_lr(0.05);
        let mut scheduler = ReduceLrOnPlateau::new(&config, 1.0);

        scheduler.step(10.0);
        assert_eq!(scheduler.step(9.0), 1.0);
        assert!((scheduler.step(9.5) - 0.1).abs() < 1e-12);
        assert!((scheduler.step(9.5) - 0.05).abs() < 1e-12);
        assert!((scheduler.step(9.5) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn exponential_decay_ignores_the_metric() {
        let mut scheduler = EpochScheduler::Exponential(ExponentialLr::new(0.5, 1e-3));

        assert_eq!(scheduler.lr(), 1e-3);
        assert!((scheduler.step(None) - 5e-4).abs() < 1e-12);
        assert!((scheduler.step(Some(0.1)) - 2.5e-4).abs() < 1e-12);
    }

    #[test]
    fn plateau_without_its_metric_keeps_the_rate() {
        let config = PlateauConfig::new().with_patience(0).with_cooldown(0);
        let mut scheduler = EpochScheduler::Plateau(ReduceLrOnPlateau::new(&config, 1.0));

        scheduler.step(Some(1.0));
        assert_eq!(scheduler.step(None), 1.0);
        assert_eq!(scheduler.step(Some(1.0)), 0.5);
    }
}
