//! KL-regularized convolutional autoencoder.
//!
//! Only its encoder half is used during denoiser training; the decoder is
//! kept so full checkpoints load and so sampled latents can be turned back
//! into images.

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, ConvTranspose2d};
use burn::nn::GroupNorm;
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::{Distribution, Tensor};

use crate::blocks::{conv2d, downsample, upsample, MidBlock, NormParams, ResidualBlock};
use crate::error::{self, TrainError};
use crate::model::{LatentDecoder, LatentEncoder};

#[derive(Config, Debug)]
pub struct AutoencoderKlConfig {
    #[config(default = 1)]
    pub in_channels: usize,
    #[config(default = 1)]
    pub out_channels: usize,
    /// Channel width of each resolution level, finest first.
    #[config(default = "vec![128, 128, 256, 512]")]
    pub num_channels: Vec<usize>,
    #[config(default = 1)]
    pub latent_channels: usize,
    #[config(default = 1)]
    pub num_res_blocks: usize,
    #[config(default = 32)]
    pub norm_num_groups: usize,
    #[config(default = 1e-6)]
    pub norm_eps: f64,
}

impl AutoencoderKlConfig {
    pub fn validate(&self) -> error::Result<()> {
        if self.num_channels.is_empty() {
            return Err(TrainError::Config(
                "autoencoder num_channels must not be empty".into(),
            ));
        }
        if self.in_channels == 0 || self.out_channels == 0 || self.latent_channels == 0 {
            return Err(TrainError::Config(
                "autoencoder channel counts must be positive".into(),
            ));
        }
        if self.num_res_blocks == 0 || self.norm_num_groups == 0 {
            return Err(TrainError::Config(
                "autoencoder num_res_blocks and norm_num_groups must be positive".into(),
            ));
        }
        if let Some(ch) = self
            .num_channels
            .iter()
            .find(|&&ch| ch == 0 || ch % self.norm_num_groups != 0)
        {
            return Err(TrainError::Config(format!(
                "autoencoder channels {ch} not divisible by norm_num_groups {}",
                self.norm_num_groups
            )));
        }
        Ok(())
    }

    /// Ratio between image and latent spatial size.
    pub fn downsample_factor(&self) -> usize {
        1 << self.num_channels.len().saturating_sub(1)
    }

    fn norm(&self) -> NormParams {
        NormParams {
            groups: self.norm_num_groups,
            eps: self.norm_eps,
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> AutoencoderKl<B> {
        let latent = self.latent_channels;
        AutoencoderKl {
            encoder: Encoder::new(self, device),
            quant_conv_mu: conv2d([latent, latent], 1, 1, device),
            quant_conv_log_var: conv2d([latent, latent], 1, 1, device),
            post_quant_conv: conv2d([latent, latent], 1, 1, device),
            decoder: Decoder::new(self, device),
        }
    }
}

#[derive(Module, Debug)]
pub struct EncoderLevel<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
    downsample: Option<Conv2d<B>>,
}

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    conv_in: Conv2d<B>,
    levels: Vec<EncoderLevel<B>>,
    mid: MidBlock<B>,
    norm_out: GroupNorm<B>,
    conv_out: Conv2d<B>,
}

impl<B: Backend> Encoder<B> {
    fn new(config: &AutoencoderKlConfig, device: &B::Device) -> Self {
        let norm = config.norm();
        let channels = &config.num_channels;
        let last = channels.len() - 1;

        let mut levels = Vec::with_capacity(channels.len());
        let mut prev = channels[0];
        for (i, &ch) in channels.iter().enumerate() {
            let blocks = (0..config.num_res_blocks)
                .map(|b| {
                    let in_ch = if b == 0 { prev } else { ch };
                    ResidualBlock::new(device, in_ch, ch, None, norm)
                })
                .collect();
            levels.push(EncoderLevel {
                blocks,
                downsample: (i < last).then(|| downsample(ch, device)),
            });
            prev = ch;
        }

        Self {
            conv_in: conv2d([config.in_channels, channels[0]], 3, 1, device),
            levels,
            mid: MidBlock::new(device, channels[last], 0, None, norm),
            norm_out: norm.init(channels[last], device),
            conv_out: conv2d([channels[last], config.latent_channels], 3, 1, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut h = self.conv_in.forward(x);
        for level in &self.levels {
            for block in &level.blocks {
                h = block.forward(h, None);
            }
            if let Some(down) = &level.downsample {
                h = down.forward(h);
            }
        }
        let h = self.mid.forward(h, None);
        let h = activation::silu(self.norm_out.forward(h));
        self.conv_out.forward(h)
    }
}

#[derive(Module, Debug)]
pub struct DecoderLevel<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
    upsample: Option<ConvTranspose2d<B>>,
}

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    conv_in: Conv2d<B>,
    mid: MidBlock<B>,
    levels: Vec<DecoderLevel<B>>,
    norm_out: GroupNorm<B>,
    conv_out: Conv2d<B>,
}

impl<B: Backend> Decoder<B> {
    fn new(config: &AutoencoderKlConfig, device: &B::Device) -> Self {
        let norm = config.norm();
        let channels = &config.num_channels;
        let last = channels.len() - 1;

        let mut levels = Vec::with_capacity(channels.len());
        let mut prev = channels[last];
        for i in (0..channels.len()).rev() {
            let ch = channels[i];
            let blocks = (0..config.num_res_blocks)
                .map(|b| {
                    let in_ch = if b == 0 { prev } else { ch };
                    ResidualBlock::new(device, in_ch, ch, None, norm)
                })
                .collect();
            levels.push(DecoderLevel {
                blocks,
                upsample: (i > 0).then(|| upsample(ch, device)),
            });
            prev = ch;
        }

        Self {
            conv_in: conv2d([config.latent_channels, channels[last]], 3, 1, device),
            mid: MidBlock::new(device, channels[last], 0, None, norm),
            levels,
            norm_out: norm.init(channels[0], device),
            conv_out: conv2d([channels[0], config.out_channels], 3, 1, device),
        }
    }

    pub fn forward(&self, z: Tensor<B, 4>) -> Tensor<B, 4> {
        let h = self.conv_in.forward(z);
        let mut h = self.mid.forward(h, None);
        for level in &self.levels {
            for block in &level.blocks {
                h = block.forward(h, None);
            }
            if let Some(up) = &level.upsample {
                h = up.forward(h);
            }
        }
        let h = activation::silu(self.norm_out.forward(h));
        self.conv_out.forward(h)
    }
}

#[derive(Module, Debug)]
pub struct AutoencoderKl<B: Backend> {
    encoder: Encoder<B>,
    quant_conv_mu: Conv2d<B>,
    quant_conv_log_var: Conv2d<B>,
    post_quant_conv: Conv2d<B>,
    decoder: Decoder<B>,
}

impl<B: Backend> AutoencoderKl<B> {
    /// Latent mean and clamped log-variance.
    pub fn encode(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let h = self.encoder.forward(x);
        let mean = self.quant_conv_mu.forward(h.clone());
        let log_var = self.quant_conv_log_var.forward(h).clamp(-30.0, 20.0);
        (mean, log_var)
    }

    pub fn sample(&self, mean: Tensor<B, 4>, log_var: Tensor<B, 4>) -> Tensor<B, 4> {
        let std = log_var.mul_scalar(0.5).exp();
        let noise = std.random_like(Distribution::Normal(0.0, 1.0));
        mean + noise * std
    }

    pub fn decode(&self, z: Tensor<B, 4>) -> Tensor<B, 4> {
        self.decoder.forward(self.post_quant_conv.forward(z))
    }

    /// Reconstruction together with the latent statistics it came from.
    pub fn reconstruct(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>) {
        let (mean, log_var) = self.encode(x);
        let z = self.sample(mean.clone(), log_var.clone());
        (self.decode(z), mean, log_var)
    }
}

impl<B: Backend> LatentEncoder<B> for AutoencoderKl<B> {
    fn encode(&self, images: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        AutoencoderKl::encode(self, images)
    }

    fn sample(&self, mean: Tensor<B, 4>, log_var: Tensor<B, 4>) -> Tensor<B, 4> {
        AutoencoderKl::sample(self, mean, log_var)
    }
}

impl<B: Backend> LatentDecoder<B> for AutoencoderKl<B> {
    fn decode(&self, latents: Tensor<B, 4>) -> Tensor<B, 4> {
        AutoencoderKl::decode(self, latents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn tiny() -> AutoencoderKlConfig {
        AutoencoderKlConfig::new()
            .with_num_channels(vec![8, 8, 16])
            .with_norm_num_groups(4)
    }

    #[test]
    fn reference_config_downsamples_by_eight() {
        let config = AutoencoderKlConfig::new();
        config.validate().unwrap();
        assert_eq!(config.downsample_factor(), 8);
    }

    #[test]
    fn rejects_channels_not_divisible_by_groups() {
        let config = tiny().with_num_channels(vec![8, 10]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn encode_sample_decode_shapes() {
        let device = Default::default();
        let config = tiny();
        let model = config.init::<TestBackend>(&device);

        let x = Tensor::<TestBackend, 4>::random([2, 1, 16, 16], Distribution::Default, &device);
        let (mean, log_var) = model.encode(x.clone());
        assert_eq!(mean.dims(), [2, 1, 4, 4]);
        assert_eq!(log_var.dims(), [2, 1, 4, 4]);

        let z = model.sample(mean, log_var);
        assert_eq!(model.decode(z).dims(), [2, 1, 16, 16]);

        let (recon, _, _) = model.reconstruct(x);
        assert_eq!(recon.dims(), [2, 1, 16, 16]);
    }

    #[test]
    fn log_variance_is_clamped() {
        let device = Default::default();
        let model = tiny().init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::ones([1, 1, 8, 8], &device).mul_scalar(1e6);
        let (_, log_var) = model.encode(x);
        let max = log_var.clone().max().into_scalar();
        let min = log_var.min().into_scalar();
        assert!(max <= 20.0 && min >= -30.0);
    }

    #[test]
    fn sampling_with_tiny_variance_returns_mean() {
        let device = Default::default();
        let model = tiny().init::<TestBackend>(&device);
        let mean = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);
        let log_var = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device).mul_scalar(-30.0);
        let z = LatentEncoder::sample(&model, mean.clone(), log_var);
        let diff = (z - mean).abs().max().into_scalar();
        assert!(diff < 1e-3);
    }
}
