use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, ConvTranspose2d};
use burn::nn::{GroupNorm, Linear, LinearConfig};
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use crate::blocks::{
    conv2d, downsample, timestep_embedding, upsample, Attention, MidBlock, NormParams, ResidualBlock,
};
use crate::error::{self, TrainError};
use crate::model::Denoiser;

#[derive(Config, Debug)]
pub struct DiffusionUnetConfig {
    #[config(default = 1)]
    pub in_channels: usize,
    #[config(default = 1)]
    pub out_channels: usize,
    #[config(default = 1)]
    pub num_res_blocks: usize,
    /// Channel width per resolution level, finest first.
    #[config(default = "vec![128, 256, 512]")]
    pub num_channels: Vec<usize>,
    /// Whether each level carries self attention after its residual blocks.
    #[config(default = "vec![false, true, true]")]
    pub attention_levels: Vec<bool>,
    /// Channels per attention head at each level, 0 for a single head.
    #[config(default = "vec![0, 128, 256]")]
    pub num_head_channels: Vec<usize>,
    #[config(default = 32)]
    pub norm_num_groups: usize,
    #[config(default = 1e-6)]
    pub norm_eps: f64,
}

impl DiffusionUnetConfig {
    pub fn validate(&self) -> error::Result<()> {
        let levels = self.num_channels.len();
        if levels == 0 {
            return Err(TrainError::Config("unet num_channels must not be empty".into()));
        }
        if self.attention_levels.len() != levels || self.num_head_channels.len() != levels {
            return Err(TrainError::Config(format!(
                "unet attention_levels ({}) and num_head_channels ({}) must have one entry per level ({levels})",
                self.attention_levels.len(),
                self.num_head_channels.len()
            )));
        }
        if self.in_channels == 0 || self.out_channels == 0 || self.num_res_blocks == 0 {
            return Err(TrainError::Config(
                "unet channel counts and num_res_blocks must be positive".into(),
            ));
        }
        if self.norm_num_groups == 0 {
            return Err(TrainError::Config("unet norm_num_groups must be positive".into()));
        }

        for (i, &ch) in self.num_channels.iter().enumerate() {
            if ch == 0 || ch % self.norm_num_groups != 0 {
                return Err(TrainError::Config(format!(
                    "unet channels {ch} not divisible by norm_num_groups {}",
                    self.norm_num_groups
                )));
            }
            // the middle block always attends with the last level's heads
            let attends = self.attention_levels[i] || i == levels - 1;
            let head = self.num_head_channels[i];
            if attends && head != 0 && ch % head != 0 {
                return Err(TrainError::Config(format!(
                    "unet level {i}: {ch} channels not divisible by {head} head channels"
                )));
            }
        }
        Ok(())
    }

    pub fn downsample_factor(&self) -> usize {
        1 << self.num_channels.len().saturating_sub(1)
    }

    /// Width of the timestep embedding fed to every residual block.
    pub fn time_embed_dim(&self) -> usize {
        self.num_channels[0] * 4
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> DiffusionUnet<B> {
        let norm = NormParams {
            groups: self.norm_num_groups,
            eps: self.norm_eps,
        };
        let channels = &self.num_channels;
        let levels = channels.len();
        let last = levels - 1;
        let time_dim = channels[0];
        let temb_dim = self.time_embed_dim();

        let attentions = |i: usize, count: usize| -> Vec<Attention<B>> {
            if self.attention_levels[i] {
                (0..count)
                    .map(|_| Attention::new(device, channels[i], self.num_head_channels[i], norm))
                    .collect()
            } else {
                Vec::new()
            }
        };

        let mut down = Vec::with_capacity(levels);
        let mut prev = channels[0];
        for (i, &ch) in channels.iter().enumerate() {
            let blocks = (0..self.num_res_blocks)
                .map(|b| {
                    let in_ch = if b == 0 { prev } else { ch };
                    ResidualBlock::new(device, in_ch, ch, Some(temb_dim), norm)
                })
                .collect();
            down.push(DownLevel {
                blocks,
                attentions: attentions(i, self.num_res_blocks),
                downsample: (i < last).then(|| downsample(ch, device)),
            });
            prev = ch;
        }

        let mut up = Vec::with_capacity(levels);
        for i in (0..levels).rev() {
            let ch = channels[i];
            let blocks = (0..self.num_res_blocks)
                .map(|b| {
                    let in_ch = if b == 0 { prev + ch } else { ch };
                    ResidualBlock::new(device, in_ch, ch, Some(temb_dim), norm)
                })
                .collect();
            up.push(UpLevel {
                upsample: (i < last).then(|| upsample(prev, device)),
                blocks,
                attentions: attentions(i, self.num_res_blocks),
            });
            prev = ch;
        }

        DiffusionUnet {
            time_embed: TimeEmbedding::new(time_dim, temb_dim, device),
            conv_in: conv2d([self.in_channels, channels[0]], 3, 1, device),
            down,
            mid: MidBlock::new(
                device,
                channels[last],
                self.num_head_channels[last],
                Some(temb_dim),
                norm,
            ),
            up,
            norm_out: norm.init(channels[0], device),
            conv_out: conv2d([channels[0], self.out_channels], 3, 1, device),
            time_dim,
        }
    }
}

/// MLP lifting the sinusoidal timestep features.
#[derive(Module, Debug)]
pub struct TimeEmbedding<B: Backend> {
    linear1: Linear<B>,
    linear2: Linear<B>,
}

impl<B: Backend> TimeEmbedding<B> {
    pub fn new(dim: usize, embed_dim: usize, device: &B::Device) -> Self {
        Self {
            linear1: LinearConfig::new(dim, embed_dim).init(device),
            linear2: LinearConfig::new(embed_dim, embed_dim).init(device),
        }
    }

    pub fn forward(&self, t: Tensor<B, 2>) -> Tensor<B, 2> {
        let z = self.linear1.forward(t);
        let z = activation::silu(z);
        self.linear2.forward(z)
    }
}

#[derive(Module, Debug)]
pub struct DownLevel<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
    attentions: Vec<Attention<B>>,
    downsample: Option<Conv2d<B>>,
}

#[derive(Module, Debug)]
pub struct UpLevel<B: Backend> {
    upsample: Option<ConvTranspose2d<B>>,
    blocks: Vec<ResidualBlock<B>>,
    attentions: Vec<Attention<B>>,
}

/// Timestep-conditioned U-Net predicting the noise of a latent.
#[derive(Module, Debug)]
pub struct DiffusionUnet<B: Backend> {
    time_embed: TimeEmbedding<B>,
    conv_in: Conv2d<B>,
    down: Vec<DownLevel<B>>,
    mid: MidBlock<B>,
    up: Vec<UpLevel<B>>,
    norm_out: GroupNorm<B>,
    conv_out: Conv2d<B>,
    time_dim: usize,
}

impl<B: Backend> DiffusionUnet<B> {
    /// Spatial size of `x` must be divisible by the config's downsample factor.
    pub fn forward(&self, x: Tensor<B, 4>, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 4> {
        let t_emb = self
            .time_embed
            .forward(timestep_embedding(timesteps, self.time_dim));

        let mut h = self.conv_in.forward(x);
        let mut skips = Vec::with_capacity(self.down.len());
        for level in &self.down {
            for (i, block) in level.blocks.iter().enumerate() {
                h = block.forward(h, Some(t_emb.clone()));
                if let Some(attention) = level.attentions.get(i) {
                    h = attention.forward(h);
                }
            }
            skips.push(h.clone());
            if let Some(down) = &level.downsample {
                h = down.forward(h);
            }
        }

        h = self.mid.forward(h, Some(t_emb.clone()));

        for level in &self.up {
            if let Some(up) = &level.upsample {
                h = up.forward(h);
            }
            if let Some(skip) = skips.pop() {
                h = Tensor::cat(vec![h, skip], 1);
            }
            for (i, block) in level.blocks.iter().enumerate() {
                h = block.forward(h, Some(t_emb.clone()));
                if let Some(attention) = level.attentions.get(i) {
                    h = attention.forward(h);
                }
            }
        }

        let h = activation::silu(self.norm_out.forward(h));
        self.conv_out.forward(h)
    }
}

impl<B: Backend> Denoiser<B> for DiffusionUnet<B> {
    fn predict(&self, noisy_latents: Tensor<B, 4>, timesteps: Tensor<B, 1, Int>) -> Tensor<B, 4> {
        self.forward(noisy_latents, timesteps)
    }
}
