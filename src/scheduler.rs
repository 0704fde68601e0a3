//! DDPM noise scheduler.
//!
//! Holds the variance schedule on the host and materializes the per-timestep
//! coefficients on the tensor device when noising or denoising.

use burn::config::Config;
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Int, Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::error::{self, TrainError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BetaSchedule {
    /// Betas spaced linearly between `beta_start` and `beta_end`.
    #[default]
    LinearBeta,
    /// Square roots spaced linearly, then squared.
    ScaledLinearBeta,
}

#[derive(Config, Debug)]
pub struct DdpmSchedulerConfig {
    #[config(default = 1000)]
    pub num_train_timesteps: usize,
    #[config(default = "BetaSchedule::LinearBeta")]
    pub schedule: BetaSchedule,
    #[config(default = 1e-4)]
    pub beta_start: f64,
    #[config(default = 0.02)]
    pub beta_end: f64,
    /// Clamp the predicted clean sample to `[-1, 1]` when denoising.
    #[config(default = true)]
    pub clip_sample: bool,
}

impl DdpmSchedulerConfig {
    pub fn validate(&self) -> error::Result<()> {
        if self.num_train_timesteps < 2 {
            return Err(TrainError::Config(format!(
                "num_train_timesteps must be at least 2, got {}",
                self.num_train_timesteps
            )));
        }
        let valid = |b: f64| b.is_finite() && b > 0.0 && b < 1.0;
        if !valid(self.beta_start) || !valid(self.beta_end) || self.beta_start > self.beta_end {
            return Err(TrainError::Config(format!(
                "betas must satisfy 0 < beta_start <= beta_end < 1, got {} and {}",
                self.beta_start, self.beta_end
            )));
        }
        Ok(())
    }

    pub fn init(&self) -> DdpmScheduler {
        let steps = self.num_train_timesteps;
        let betas: Vec<f64> = (0..steps)
            .map(|i| {
                let frac = i as f64 / (steps - 1) as f64;
                match self.schedule {
                    BetaSchedule::LinearBeta => {
                        self.beta_start + (self.beta_end - self.beta_start) * frac
                    }
                    BetaSchedule::ScaledLinearBeta => {
                        let (start, end) = (self.beta_start.sqrt(), self.beta_end.sqrt());
                        (start + (end - start) * frac).powi(2)
                    }
                }
            })
            .collect();

        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let mut cumulative = 1.0;
        let alphas_cumprod = alphas
            .iter()
            .map(|&a| {
                cumulative *= a;
                cumulative
            })
            .collect();

        DdpmScheduler {
            num_train_timesteps: steps,
            clip_sample: self.clip_sample,
            betas,
            alphas,
            alphas_cumprod,
        }
    }
}

/// Forward and reverse process of a discrete-time DDPM.
#[derive(Debug, Clone)]
pub struct DdpmScheduler {
    num_train_timesteps: usize,
    clip_sample: bool,
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
}

impl DdpmScheduler {
    pub fn num_train_timesteps(&self) -> usize {
        self.num_train_timesteps
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    fn gather<B: Backend>(
        values: &[f64],
        timesteps: Tensor<B, 1, Int>,
        device: &B::Device,
    ) -> Tensor<B, 4> {
        let batch_size = timesteps.dims()[0];
        let values: Vec<f32> = values.iter().map(|&v| v as f32).collect();
        let len = values.len();
        Tensor::<B, 1>::from_data(TensorData::new(values, [len]), device)
            .select(0, timesteps)
            .reshape([batch_size, 1, 1, 1])
    }

    /// `sqrt(abar_t) * original + sqrt(1 - abar_t) * noise`, one `t` per sample.
    pub fn add_noise<B: Backend>(
        &self,
        original: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: Tensor<B, 1, Int>,
    ) -> Tensor<B, 4> {
        let device = original.device();
        let alpha_bar = Self::gather(&self.alphas_cumprod, timesteps, &device);

        let sqrt_alpha_bar = alpha_bar.clone().sqrt();
        let sqrt_one_minus_alpha_bar = alpha_bar.neg().add_scalar(1.0).sqrt();

        original * sqrt_alpha_bar + noise * sqrt_one_minus_alpha_bar
    }

    /// One reverse step from `t` to `t - 1` given the predicted noise.
    pub fn step<B: Backend>(
        &self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        sample: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let alpha_bar = self.alphas_cumprod[timestep];
        let alpha_bar_prev = if timestep > 0 {
            self.alphas_cumprod[timestep - 1]
        } else {
            1.0
        };
        let beta_bar = 1.0 - alpha_bar;
        let beta_bar_prev = 1.0 - alpha_bar_prev;
        let current_alpha = self.alphas[timestep];
        let current_beta = self.betas[timestep];

        let mut pred_original = (sample.clone() - model_output.mul_scalar(beta_bar.sqrt() as f32))
            .div_scalar(alpha_bar.sqrt() as f32);
        if self.clip_sample {
            pred_original = pred_original.clamp(-1.0, 1.0);
        }

        let original_coeff = alpha_bar_prev.sqrt() * current_beta / beta_bar;
        let sample_coeff = current_alpha.sqrt() * beta_bar_prev / beta_bar;
        let mean = pred_original.mul_scalar(original_coeff as f32)
            + sample.mul_scalar(sample_coeff as f32);

        if timestep == 0 {
            return mean;
        }

        let variance = (beta_bar_prev / beta_bar * current_beta).max(1e-20);
        let noise = mean.random_like(Distribution::Normal(0.0, 1.0));
        mean + noise.mul_scalar(variance.sqrt() as f32)
    }
}
