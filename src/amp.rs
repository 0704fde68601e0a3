//! Dynamic loss scaling.
//!
//! The loss is multiplied by a large factor before backpropagation and the
//! gradients are divided back before the optimizer sees them. On overflow the
//! step is skipped and the factor shrinks; after a run of clean steps it grows
//! again.
//!
//! There is no autocast here: forward and backward run in the backend's float
//! type, f32 for the shipped backends. The scaler keeps non-finite gradients
//! away from the optimizer but does not rescue underflowing ones the way it
//! would under half precision.

use std::marker::PhantomData;

use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};

#[derive(Debug, Clone)]
pub struct LossScaler {
    enabled: bool,
    scale: f32,
    growth_factor: f32,
    backoff_factor: f32,
    growth_interval: usize,
    growth_tracker: usize,
}

impl Default for LossScaler {
    fn default() -> Self {
        Self::new(true)
    }
}

impl LossScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
        }
    }

    pub fn with_init_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_growth_interval(mut self, interval: usize) -> Self {
        self.growth_interval = interval;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Current multiplier, 1 when scaling is disabled.
    pub fn scale(&self) -> f32 {
        if self.enabled {
            self.scale
        } else {
            1.0
        }
    }

    pub fn scale_loss<B: AutodiffBackend>(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        if self.enabled {
            loss.mul_scalar(self.scale)
        } else {
            loss
        }
    }

    /// Divides every gradient of `module` by the current scale.
    ///
    /// Returns `true` when any gradient is non-finite, in which case the
    /// optimizer step must be skipped.
    pub fn unscale<B, M>(&self, module: &M, grads: &mut GradientsParams) -> bool
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        let mut unscaler = GradUnscaler::<B> {
            grads,
            inv_scale: 1.0 / self.scale(),
            found_inf: false,
            phantom: PhantomData,
        };
        module.visit(&mut unscaler);
        unscaler.found_inf
    }

    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
            tracing::debug!("Gradient overflow, loss scale reduced to {}", self.scale);
            return;
        }
        self.growth_tracker += 1;
        if self.growth_tracker >= self.growth_interval {
            self.scale *= self.growth_factor;
            self.growth_tracker = 0;
        }
    }
}

struct GradUnscaler<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    inv_scale: f32,
    found_inf: bool,
    phantom: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradUnscaler<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        let grad = if self.inv_scale == 1.0 {
            grad
        } else {
            grad.mul_scalar(self.inv_scale)
        };
        let total = grad.clone().sum().into_scalar().elem::<f32>();
        if !total.is_finite() {
            self.found_inf = true;
        }
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::{Linear, LinearConfig};

    type TestBackend = Autodiff<NdArray>;

    fn linear_grads(scaler: &LossScaler, input: f32) -> (Linear<TestBackend>, GradientsParams) {
        let device = Default::default();
        let linear = LinearConfig::new(2, 1).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 2>::ones([1, 2], &device).mul_scalar(input);
        let loss = linear.forward(x).sum();
        let grads = scaler.scale_loss(loss).backward();
        let grads = GradientsParams::from_grads(grads, &linear);
        (linear, grads)
    }

    #[test]
    fn unscaled_gradients_match_unscaled_loss() {
        let scaler = LossScaler::new(true).with_init_scale(1024.0);
        let (linear, mut grads) = linear_grads(&scaler, 3.0);

        assert!(!scaler.unscale::<TestBackend, _>(&linear, &mut grads));
        let weight_grad = grads
            .get::<NdArray, 2>(linear.weight.id)
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        for g in weight_grad {
            assert!((g - 3.0).abs() < 1e-4, "grad {g}");
        }
    }

    #[test]
    fn overflow_is_detected() {
        let scaler = LossScaler::new(true).with_init_scale(f32::MAX);
        let (linear, mut grads) = linear_grads(&scaler, f32::MAX);
        assert!(scaler.unscale::<TestBackend, _>(&linear, &mut grads));
    }

    #[test]
    fn backs_off_on_overflow_and_grows_after_interval() {
        let mut scaler = LossScaler::new(true)
            .with_init_scale(8.0)
            .with_growth_interval(3);

        scaler.update(true);
        assert_eq!(scaler.scale(), 4.0);

        scaler.update(false);
        scaler.update(false);
        assert_eq!(scaler.scale(), 4.0);
        scaler.update(false);
        assert_eq!(scaler.scale(), 8.0);

        scaler.update(false);
        scaler.update(true);
        scaler.update(false);
        scaler.update(false);
        assert_eq!(scaler.scale(), 4.0);
    }

    #[test]
    fn disabled_scaler_is_identity() {
        let mut scaler = LossScaler::new(false);
        assert_eq!(scaler.scale(), 1.0);
        scaler.update(true);
        assert_eq!(scaler.scale(), 1.0);
        let (linear, mut grads) = linear_grads(&scaler, 2.0);
        assert!(!scaler.unscale::<TestBackend, _>(&linear, &mut grads));
    }
}
