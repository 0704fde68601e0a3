use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Int, Tensor, TensorData};

use crate::error::{Result, TrainError};
use crate::model::{Denoiser, LatentDecoder, LatentEncoder};
use crate::scheduler::DdpmScheduler;

/// Runs diffusion in the latent space of an autoencoder.
///
/// Latents are multiplied by `scale_factor` after encoding and divided by it
/// before decoding, so the noise schedule sees roughly unit-variance inputs.
#[derive(Debug, Clone)]
pub struct LatentDiffusionInferer {
    scheduler: DdpmScheduler,
    scale_factor: f32,
}

impl LatentDiffusionInferer {
    pub fn new(scheduler: DdpmScheduler, scale_factor: f32) -> Self {
        Self {
            scheduler,
            scale_factor,
        }
    }

    pub fn scheduler(&self) -> &DdpmScheduler {
        &self.scheduler
    }

    pub fn scale_factor(&self) -> f32 {
        self.scale_factor
    }

    pub fn encode_latents<B: Backend, E: LatentEncoder<B>>(
        &self,
        encoder: &E,
        images: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        encoder
            .encode_to_latent(images)
            .mul_scalar(self.scale_factor)
    }

    /// Noises already-scaled latents at `timesteps` and predicts that noise.
    pub fn predict_noise<B: Backend, D: Denoiser<B>>(
        &self,
        denoiser: &D,
        latents: Tensor<B, 4>,
        noise: Tensor<B, 4>,
        timesteps: Tensor<B, 1, Int>,
    ) -> Tensor<B, 4> {
        let noisy = self.scheduler.add_noise(latents, noise, timesteps.clone());
        denoiser.predict(noisy, timesteps)
    }

    /// Encode, scale, noise and predict in one call.
    pub fn forward<B, E, D>(
        &self,
        images: Tensor<B, 4>,
        encoder: &E,
        denoiser: &D,
        noise: Tensor<B, 4>,
        timesteps: Tensor<B, 1, Int>,
    ) -> Tensor<B, 4>
    where
        B: Backend,
        E: LatentEncoder<B>,
        D: Denoiser<B>,
    {
        let latents = self.encode_latents(encoder, images);
        self.predict_noise(denoiser, latents, noise, timesteps)
    }

    /// Full reverse chain from Gaussian latents of `latent_shape`, decoded to images.
    pub fn sample<B, D, A>(
        &self,
        denoiser: &D,
        decoder: &A,
        latent_shape: [usize; 4],
        device: &B::Device,
    ) -> Tensor<B, 4>
    where
        B: Backend,
        D: Denoiser<B>,
        A: LatentDecoder<B>,
    {
        let batch_size = latent_shape[0];
        let num_steps = self.scheduler.num_train_timesteps();
        let mut z = Tensor::random(latent_shape, Distribution::Normal(0.0, 1.0), device);

        for t in (0..num_steps).rev() {
            let timesteps = Tensor::<B, 1, Int>::from_data(
                TensorData::new(vec![t as i32; batch_size], [batch_size]),
                device,
            );
            let noise_pred = denoiser.predict(z.clone(), timesteps);
            z = self.scheduler.step(noise_pred, t, z);

            if t % 100 == 0 {
                tracing::debug!("Denoising step {}/{}", num_steps - t, num_steps);
            }
        }

        decoder.decode(z.div_scalar(self.scale_factor))
    }
}

/// `1 / std(latents)` with the unbiased estimator.
pub fn scale_factor_from_latents<B: Backend>(latents: Tensor<B, 4>) -> Result<f32> {
    let values = latents
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TrainError::ScaleFactor(format!("{e:?}")))?;

    let n = values.len();
    if n < 2 {
        return Err(TrainError::ScaleFactor(format!(
            "need at least two latent values, got {n}"
        )));
    }

    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let var = values
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / (n - 1) as f64;
    let std = var.sqrt();

    if !std.is_finite() || std == 0.0 {
        return Err(TrainError::ScaleFactor(format!(
            "latent standard deviation is {std}"
        )));
    }
    Ok((1.0 / std) as f32)
}

/// Encodes one reference batch and derives the latent scale factor from it.
pub fn calibrate_scale_factor<B: Backend, E: LatentEncoder<B>>(
    encoder: &E,
    images: Tensor<B, 4>,
) -> Result<f32> {
    let latents = encoder.encode_to_latent(images);
    let scale_factor = scale_factor_from_latents(latents)?;
    tracing::info!("Latent scale factor: {scale_factor:.6}");
    Ok(scale_factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoencoder::AutoencoderKlConfig;
    use crate::scheduler::DdpmSchedulerConfig;
    use crate::unet::DiffusionUnetConfig;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn scale_factor_is_reciprocal_sample_std() {
        let device = Default::default();
        let values = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let latents =
            Tensor::<TestBackend, 4>::from_data(TensorData::new(values.clone(), [2, 1, 2, 2]), &device);

        let mean = 4.5f64;
        let sigma = (values
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / 7.0)
            .sqrt();

        let factor = scale_factor_from_latents(latents).unwrap();
        assert!((factor as f64 - 1.0 / sigma).abs() < 1e-6);
    }

    #[test]
    fn constant_latents_cannot_be_calibrated() {
        let device = Default::default();
        let latents = Tensor::<TestBackend, 4>::ones([2, 1, 2, 2], &device);
        assert!(matches!(
            scale_factor_from_latents(latents),
            Err(TrainError::ScaleFactor(_))
        ));
    }

    #[test]
    fn calibrated_latents_have_unit_std() {
        let device = Default::default();
        let autoencoder = AutoencoderKlConfig::new()
            .with_num_channels(vec![8, 8])
            .with_norm_num_groups(4)
            .init::<TestBackend>(&device);
        let images =
            Tensor::<TestBackend, 4>::random([4, 1, 8, 8], Distribution::Default, &device);

        let factor = calibrate_scale_factor(&autoencoder, images.clone()).unwrap();
        assert!(factor.is_finite() && factor > 0.0);

        let inferer = LatentDiffusionInferer::new(DdpmSchedulerConfig::new().init(), factor);
        let scaled = inferer.encode_latents(&autoencoder, images);
        let std = 1.0 / scale_factor_from_latents(scaled).unwrap();
        // a fresh latent draw, so only approximately one
        assert!((std - 1.0).abs() < 0.5, "std {std}");
    }

    #[test]
    fn forward_and_sample_shapes() {
        let device = Default::default();
        let autoencoder = AutoencoderKlConfig::new()
            .with_num_channels(vec![8, 8])
            .with_norm_num_groups(4)
            .init::<TestBackend>(&device);
        let unet = DiffusionUnetConfig::new()
            .with_num_channels(vec![8, 8])
            .with_attention_levels(vec![false, true])
            .with_num_head_channels(vec![0, 4])
            .with_norm_num_groups(4)
            .init::<TestBackend>(&device);
        let scheduler = DdpmSchedulerConfig::new().with_num_train_timesteps(10).init();
        let inferer = LatentDiffusionInferer::new(scheduler, 0.5);

        let images = Tensor::<TestBackend, 4>::random([2, 1, 8, 8], Distribution::Default, &device);
        let noise = Tensor::<TestBackend, 4>::random([2, 1, 4, 4], Distribution::Normal(0.0, 1.0), &device);
        let timesteps = Tensor::<TestBackend, 1, Int>::from_ints([3, 9], &device);
        let pred = inferer.forward(images, &autoencoder, &unet, noise, timesteps);
        assert_eq!(pred.dims(), [2, 1, 4, 4]);

        let samples = inferer.sample(&unet, &autoencoder, [2, 1, 4, 4], &device);
        assert_eq!(samples.dims(), [2, 1, 8, 8]);
    }
}
