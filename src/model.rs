//! Capabilities the training loop needs from its two networks.
//!
//! The loop only ever reads from the encoder and only ever optimizes the
//! denoiser, so tests can plug in tiny configurations of either.

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

/// Read-only image-to-latent mapping of a frozen variational autoencoder.
pub trait LatentEncoder<B: Backend> {
    /// Latent mean and log-variance for a `[batch, C, H, W]` image batch.
    fn encode(&self, images: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>);

    /// Reparameterized draw from `N(mean, exp(log_var))`.
    fn sample(&self, mean: Tensor<B, 4>, log_var: Tensor<B, 4>) -> Tensor<B, 4>;

    fn encode_to_latent(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let (mean, log_var) = self.encode(images);
        self.sample(mean, log_var)
    }
}

pub trait LatentDecoder<B: Backend> {
    fn decode(&self, latents: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Trainable noise predictor. Its parameters are whatever its [`Module`]
/// implementation exposes.
pub trait Denoiser<B: Backend>: Module<B> {
    /// Predicts the noise in `noisy_latents` at the given per-sample timesteps.
    fn predict(&self, noisy_latents: Tensor<B, 4>, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 4>;
}
