//! Where run artifacts live and how modules are written to and read from disk.

use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::record::{CompactRecorder, FileRecorder, Recorder};
use burn::tensor::backend::Backend;

use crate::autoencoder::{AutoencoderKl, AutoencoderKlConfig};
use crate::error::{Result, TrainError};
use crate::unet::{DiffusionUnet, DiffusionUnetConfig};

pub const RUN_CONFIG_FILE: &str = "config.json";
pub const HISTORY_FILE: &str = "history.json";

/// Path stem of the denoiser checkpoint written after `epoch` (one-based).
/// The recorder appends its own extension.
pub fn checkpoint_path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(format!("unet_epoch_{epoch}"))
}

/// The file a stem returned by [`checkpoint_path`] ends up as.
pub fn checkpoint_file<B: Backend>(stem: &Path) -> PathBuf {
    let mut file = stem.to_path_buf();
    file.set_extension(<CompactRecorder as FileRecorder<B>>::file_extension());
    file
}

pub fn save_module<B: Backend, M: Module<B>>(module: &M, path: &Path) -> Result<PathBuf> {
    let recorder = CompactRecorder::new();
    recorder
        .record(module.clone().into_record(), path.to_path_buf())
        .map_err(|source| TrainError::Checkpoint {
            path: path.to_path_buf(),
            source,
        })?;

    let written = checkpoint_file::<B>(path);
    tracing::info!("Model saved to {}", written.display());
    Ok(written)
}

/// Loads weights from `path` into an already initialized `module`.
pub fn load_module<B: Backend, M: Module<B>>(module: M, path: &Path, device: &B::Device) -> Result<M> {
    let recorder = CompactRecorder::new();
    let record = recorder
        .load(path.to_path_buf(), device)
        .map_err(|source| TrainError::Checkpoint {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(module.load_record(record))
}

pub fn load_autoencoder<B: Backend>(
    config: &AutoencoderKlConfig,
    path: &Path,
    device: &B::Device,
) -> Result<AutoencoderKl<B>> {
    let autoencoder = load_module(config.init::<B>(device), path, device)?;
    tracing::info!("Loaded autoencoder from {}", path.display());
    Ok(autoencoder)
}

pub fn load_unet<B: Backend>(
    config: &DiffusionUnetConfig,
    path: &Path,
    device: &B::Device,
) -> Result<DiffusionUnet<B>> {
    load_module(config.init::<B>(device), path, device)
}
