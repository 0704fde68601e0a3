use std::path::{Path, PathBuf};

use burn::config::Config;

use crate::autoencoder::AutoencoderKlConfig;
use crate::error::{self, TrainError};
use crate::scheduler::DdpmSchedulerConfig;
use crate::unet::DiffusionUnetConfig;

/// Everything a latent diffusion training run needs, from dataset location
/// to optimizer settings. Serialized next to the checkpoints so that a run
/// can be sampled from later.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Directory holding the training images.
    pub data_dir: PathBuf,
    /// Pre-trained autoencoder weights.
    pub autoencoder_checkpoint: PathBuf,
    /// Where denoiser checkpoints, `config.json` and `history.json` go.
    pub checkpoint_dir: PathBuf,
    #[config(default = "AutoencoderKlConfig::new()")]
    pub autoencoder: AutoencoderKlConfig,
    #[config(default = "DiffusionUnetConfig::new()")]
    pub unet: DiffusionUnetConfig,
    #[config(default = "DdpmSchedulerConfig::new()")]
    pub scheduler: DdpmSchedulerConfig,
    /// Expected image height and width.
    #[config(default = 64)]
    pub image_size: usize,
    /// Only the first `max_images` files of the directory are used.
    #[config(default = 4000)]
    pub max_images: usize,
    #[config(default = 0.7)]
    pub train_split: f64,
    #[config(default = 0.2)]
    pub val_split: f64,
    #[config(default = 16)]
    pub batch_size: usize,
    #[config(default = 200)]
    pub n_epochs: usize,
    #[config(default = 5)]
    pub val_interval: usize,
    #[config(default = 10)]
    pub checkpoint_interval: usize,
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    /// Enables dynamic loss scaling.
    #[config(default = true)]
    pub mixed_precision: bool,
    #[config(default = 42)]
    pub seed: u64,
    /// Filled in once calibration has run.
    #[config(default = "None")]
    pub scale_factor: Option<f32>,
}

impl TrainingConfig {
    /// Reads a JSON config written by [`TrainingConfig::save`].
    pub fn from_file(path: &Path) -> error::Result<Self> {
        Self::load(path).map_err(|e| TrainError::ConfigFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn test_split(&self) -> f64 {
        1.0 - self.train_split - self.val_split
    }

    /// Rejects configurations that would fail later in a less obvious way.
    pub fn validate(&self) -> error::Result<()> {
        positive("batch_size", self.batch_size)?;
        positive("n_epochs", self.n_epochs)?;
        positive("val_interval", self.val_interval)?;
        positive("checkpoint_interval", self.checkpoint_interval)?;
        positive("image_size", self.image_size)?;
        positive("max_images", self.max_images)?;

        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TrainError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.train_split) || self.train_split == 0.0 {
            return Err(TrainError::Config(format!(
                "train_split must be in (0, 1], got {}",
                self.train_split
            )));
        }
        if !(0.0..=1.0).contains(&self.val_split) {
            return Err(TrainError::Config(format!(
                "val_split must be in [0, 1], got {}",
                self.val_split
            )));
        }
        if self.test_split() < -1e-9 {
            return Err(TrainError::Config(format!(
                "train_split + val_split exceeds 1 ({} + {})",
                self.train_split, self.val_split
            )));
        }

        self.autoencoder.validate()?;
        self.unet.validate()?;
        self.scheduler.validate()?;

        let latent_channels = self.autoencoder.latent_channels;
        if self.unet.in_channels != latent_channels || self.unet.out_channels != latent_channels {
            return Err(TrainError::Config(format!(
                "unet channels ({} in, {} out) must match autoencoder latent_channels {}",
                self.unet.in_channels, self.unet.out_channels, latent_channels
            )));
        }

        let ae_factor = self.autoencoder.downsample_factor();
        if self.image_size % ae_factor != 0 {
            return Err(TrainError::Config(format!(
                "image_size {} is not divisible by the autoencoder downsampling factor {}",
                self.image_size, ae_factor
            )));
        }
        let latent_size = self.latent_size();
        let unet_factor = self.unet.downsample_factor();
        if latent_size % unet_factor != 0 {
            return Err(TrainError::Config(format!(
                "latent size {} is not divisible by the unet downsampling factor {}",
                latent_size, unet_factor
            )));
        }

        Ok(())
    }

    /// Spatial size of the latent produced for an `image_size` input.
    pub fn latent_size(&self) -> usize {
        self.image_size / self.autoencoder.downsample_factor()
    }
}

fn positive(name: &str, value: usize) -> error::Result<()> {
    if value == 0 {
        return Err(TrainError::Config(format!("{name} must be greater than zero")));
    }
    Ok(())
}
