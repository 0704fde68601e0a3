//! Latent diffusion training: a timestep-conditioned U-Net learns to predict
//! noise in the latent space of a frozen, pre-trained KL autoencoder.

pub mod amp;
pub mod autoencoder;
pub mod blocks;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod inferer;
pub mod model;
pub mod scheduler;
pub mod training;
pub mod unet;

pub use config::TrainingConfig;
pub use error::{Result, TrainError};
pub use inferer::LatentDiffusionInferer;
pub use model::{Denoiser, LatentDecoder, LatentEncoder};
pub use training::{DiffusionTrainer, TrainingHistory, TrainingSchedule};
