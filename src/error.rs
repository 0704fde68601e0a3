use std::path::PathBuf;

use burn::record::RecorderError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("No images found in directory: {0}")]
    NoImages(PathBuf),

    #[error("Failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Image {path} is {actual:?}, expected {expected:?}")]
    ImageShape {
        path: PathBuf,
        expected: [usize; 2],
        actual: [usize; 2],
    },

    #[error("Image {path} has {actual} channels, expected {expected}")]
    ImageChannels {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Checkpoint error at {path}: {source}")]
    Checkpoint {
        path: PathBuf,
        #[source]
        source: RecorderError,
    },

    #[error("Failed to load config {path}: {reason}")]
    ConfigFile { path: PathBuf, reason: String },

    #[error("Cannot calibrate scale factor: {0}")]
    ScaleFactor(String),

    #[error("Loader for the {0} split yielded no batches")]
    EmptyLoader(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrainError>;
