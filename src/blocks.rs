//! Layers shared by the autoencoder and the diffusion U-Net.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, Initializer, Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

/// Group normalization settings used by every block of a network.
#[derive(Debug, Clone, Copy)]
pub struct NormParams {
    pub groups: usize,
    pub eps: f64,
}

impl NormParams {
    pub fn init<B: Backend>(&self, channels: usize, device: &B::Device) -> GroupNorm<B> {
        GroupNormConfig::new(self.groups, channels)
            .with_epsilon(self.eps)
            .init(device)
    }
}

fn initializer() -> Initializer {
    Initializer::KaimingUniform {
        gain: 0.1,
        fan_out_only: false,
    }
}

/// Square convolution with "same" padding for odd kernels.
pub fn conv2d<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    device: &B::Device,
) -> Conv2d<B> {
    let pad = kernel / 2;
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(pad, pad))
        .with_initializer(initializer())
        .init(device)
}

/// Stride-2 3x3 convolution halving the spatial size.
pub fn downsample<B: Backend>(channels: usize, device: &B::Device) -> Conv2d<B> {
    conv2d([channels, channels], 3, 2, device)
}

/// Transposed convolution doubling the spatial size.
pub fn upsample<B: Backend>(channels: usize, device: &B::Device) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([channels, channels], [4, 4])
        .with_stride([2, 2])
        .with_padding([1, 1])
        .with_initializer(initializer())
        .init(device)
}

#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    norm1: GroupNorm<B>,
    conv1: Conv2d<B>,
    time: Option<Linear<B>>,
    norm2: GroupNorm<B>,
    conv2: Conv2d<B>,
    skip: Option<Conv2d<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    /// `time_emb_dim` is `None` for blocks that are not timestep conditioned.
    pub fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        time_emb_dim: Option<usize>,
        norm: NormParams,
    ) -> Self {
        Self {
            norm1: norm.init(in_channels, device),
            conv1: conv2d([in_channels, out_channels], 3, 1, device),
            time: time_emb_dim.map(|dim| LinearConfig::new(dim, out_channels).init(device)),
            norm2: norm.init(out_channels, device),
            conv2: conv2d([out_channels, out_channels], 3, 1, device),
            skip: (in_channels != out_channels)
                .then(|| conv2d([in_channels, out_channels], 1, 1, device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, t_emb: Option<Tensor<B, 2>>) -> Tensor<B, 4> {
        let h = activation::silu(self.norm1.forward(x.clone()));
        let mut h = self.conv1.forward(h);

        if let (Some(time), Some(t_emb)) = (&self.time, t_emb) {
            let t = time.forward(activation::silu(t_emb));
            let [batch_size, channels] = t.dims();
            h = h + t.reshape([batch_size, channels, 1, 1]);
        }

        let h = activation::silu(self.norm2.forward(h));
        let h = self.conv2.forward(h);

        let residual = match &self.skip {
            Some(conv) => conv.forward(x),
            None => x,
        };
        residual + h
    }
}

/// Multi-head self attention over the spatial positions of a feature map.
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    norm: GroupNorm<B>,
    query: Linear<B>,
    key: Linear<B>,
    val: Linear<B>,
    out: Linear<B>,
    heads: usize,
}

impl<B: Backend> Attention<B> {
    /// `head_channels == 0` means a single head spanning all channels.
    pub fn new(device: &B::Device, channels: usize, head_channels: usize, norm: NormParams) -> Self {
        let heads = if head_channels == 0 {
            1
        } else {
            channels / head_channels
        };
        Self {
            norm: norm.init(channels, device),
            query: LinearConfig::new(channels, channels).init(device),
            key: LinearConfig::new(channels, channels).init(device),
            val: LinearConfig::new(channels, channels).init(device),
            out: LinearConfig::new(channels, channels).init(device),
            heads,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch_size, channels, height, width] = x.dims();
        let positions = height * width;
        let head_dim = channels / self.heads;

        let seq = self
            .norm
            .forward(x.clone())
            .reshape([batch_size, channels, positions])
            .swap_dims(1, 2);

        let split_heads = |t: Tensor<B, 3>| {
            t.reshape([batch_size, positions, self.heads, head_dim])
                .swap_dims(1, 2)
        };
        let q = split_heads(self.query.forward(seq.clone()));
        let k = split_heads(self.key.forward(seq.clone()));
        let v = split_heads(self.val.forward(seq));

        let scaling = (head_dim as f32).sqrt();
        let score = q.matmul(k.swap_dims(2, 3)).div_scalar(scaling);
        let attn_weights = activation::softmax(score, 3);

        let attn_output = attn_weights
            .matmul(v)
            .swap_dims(1, 2)
            .reshape([batch_size, positions, channels]);
        let attn_output = self
            .out
            .forward(attn_output)
            .swap_dims(1, 2)
            .reshape([batch_size, channels, height, width]);

        attn_output + x
    }
}

/// Residual, attention, residual at the lowest resolution.
#[derive(Module, Debug)]
pub struct MidBlock<B: Backend> {
    res1: ResidualBlock<B>,
    attention: Attention<B>,
    res2: ResidualBlock<B>,
}

impl<B: Backend> MidBlock<B> {
    pub fn new(
        device: &B::Device,
        channels: usize,
        head_channels: usize,
        time_emb_dim: Option<usize>,
        norm: NormParams,
    ) -> Self {
        Self {
            res1: ResidualBlock::new(device, channels, channels, time_emb_dim, norm),
            attention: Attention::new(device, channels, head_channels, norm),
            res2: ResidualBlock::new(device, channels, channels, time_emb_dim, norm),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, t_emb: Option<Tensor<B, 2>>) -> Tensor<B, 4> {
        let h = self.res1.forward(x, t_emb.clone());
        let h = self.attention.forward(h);
        self.res2.forward(h, t_emb)
    }
}

/// Sinusoidal embedding of integer timesteps, `[batch, dim]`.
pub fn timestep_embedding<B: Backend>(timesteps: Tensor<B, 1, Int>, dim: usize) -> Tensor<B, 2> {
    let device = timesteps.device();
    let batch_size = timesteps.dims()[0];
    let half_dim = dim / 2;

    let frequencies: Vec<f32> = (0..half_dim)
        .map(|i| {
            let exp = (i as f32) * 4.0 * std::f32::consts::LN_10 / (half_dim as f32);
            (-exp).exp()
        })
        .collect();
    let freqs = Tensor::<B, 2>::from_data(TensorData::new(frequencies, [1, half_dim]), &device);

    let arg = timesteps.float().reshape([batch_size, 1]) * freqs;
    let mut parts = vec![arg.clone().sin(), arg.cos()];
    if dim % 2 == 1 {
        parts.push(Tensor::zeros([batch_size, 1], &device));
    }
    Tensor::cat(parts, 1)
}
