use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use burn::backend::Autodiff;
use burn::config::Config;
use burn::optim::AdamConfig;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use clap::{Args, Parser, Subcommand};
use image::{ImageBuffer, Luma, Rgb};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::EnvFilter;

use latent_unet::amp::LossScaler;
use latent_unet::checkpoint::{load_autoencoder, load_unet, HISTORY_FILE, RUN_CONFIG_FILE};
use latent_unet::data::{list_images, partition, DataLoader, ImageDataset, ImageTransform};
use latent_unet::inferer::calibrate_scale_factor;
use latent_unet::unet::DiffusionUnet;
use latent_unet::{
    DiffusionTrainer, LatentDiffusionInferer, TrainError, TrainingConfig, TrainingSchedule,
};

#[cfg(feature = "wgpu")]
type InnerBackend = burn::backend::Wgpu;
#[cfg(not(feature = "wgpu"))]
type InnerBackend = burn::backend::NdArray;

type TrainBackend = Autodiff<InnerBackend>;

#[derive(Parser)]
#[command(name = "latent-unet")]
#[command(about = "Train a diffusion U-Net on the latents of a pre-trained autoencoder")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the denoiser
    Train(TrainArgs),
    /// Generate images with a trained denoiser
    Sample(SampleArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// JSON training config; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory of training images
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Pre-trained autoencoder checkpoint
    #[arg(long)]
    autoencoder: Option<PathBuf>,

    /// Output directory for checkpoints, config and history
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    max_images: Option<usize>,

    /// Disable dynamic loss scaling
    #[arg(long)]
    no_loss_scaling: bool,
}

#[derive(Args)]
struct SampleArgs {
    /// Training output directory holding `config.json`
    #[arg(long)]
    run_dir: PathBuf,

    /// Denoiser checkpoint, e.g. `trained_unet/unet_epoch_200`
    #[arg(long)]
    checkpoint: PathBuf,

    /// Autoencoder checkpoint, defaults to the one the run was trained with
    #[arg(long)]
    autoencoder: Option<PathBuf>,

    /// Number of images to generate
    #[arg(long, default_value = "4")]
    count: usize,

    /// Directory the PNG files are written to
    #[arg(short, long, default_value = "samples")]
    output: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let device: <InnerBackend as Backend>::Device = Default::default();
    tracing::info!("Using device: {:?}", device);

    match cli.command {
        Commands::Train(args) => train::<TrainBackend>(args, device),
        Commands::Sample(args) => sample::<InnerBackend>(args, device),
    }
}

fn resolve_config(args: &TrainArgs) -> Result<TrainingConfig> {
    let mut config = match &args.config {
        Some(path) => TrainingConfig::from_file(path)?,
        None => {
            let (Some(data_dir), Some(autoencoder), Some(checkpoint_dir)) =
                (&args.data_dir, &args.autoencoder, &args.checkpoint_dir)
            else {
                bail!("--data-dir, --autoencoder and --checkpoint-dir are required without --config");
            };
            TrainingConfig::new(data_dir.clone(), autoencoder.clone(), checkpoint_dir.clone())
        }
    };

    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(path) = &args.autoencoder {
        config.autoencoder_checkpoint = path.clone();
    }
    if let Some(dir) = &args.checkpoint_dir {
        config.checkpoint_dir = dir.clone();
    }
    if let Some(epochs) = args.epochs {
        config.n_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(lr) = args.learning_rate {
        config.learning_rate = lr;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(max_images) = args.max_images {
        config.max_images = max_images;
    }
    if args.no_loss_scaling {
        config.mixed_precision = false;
    }

    config.validate()?;
    Ok(config)
}

fn train<B: AutodiffBackend>(args: TrainArgs, device: B::Device) -> Result<()> {
    let mut config = resolve_config(&args)?;
    B::seed(config.seed);
    fs::create_dir_all(&config.checkpoint_dir)
        .with_context(|| format!("failed to create {}", config.checkpoint_dir.display()))?;

    let image_paths = list_images(&config.data_dir, config.max_images)?;
    let split = partition(&image_paths, config.train_split, config.val_split);
    tracing::info!(
        "Split: {} train, {} validation, {} test",
        split.train.len(),
        split.val.len(),
        split.test.len()
    );

    let transform = ImageTransform::new(config.autoencoder.in_channels, config.image_size);
    let train_loader = DataLoader::new(
        ImageDataset::new(split.train, transform.clone()),
        config.batch_size,
        true,
    );
    let val_loader = DataLoader::new(ImageDataset::new(split.val, transform), config.batch_size, true);

    let autoencoder = load_autoencoder::<B::InnerBackend>(
        &config.autoencoder,
        &config.autoencoder_checkpoint,
        &device,
    )?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let check_batch = train_loader
        .first::<B::InnerBackend, _>(&mut rng, &device)?
        .ok_or(TrainError::EmptyLoader("train"))?;
    let scale_factor = calibrate_scale_factor(&autoencoder, check_batch)?;
    config.scale_factor = Some(scale_factor);

    let config_path = config.checkpoint_dir.join(RUN_CONFIG_FILE);
    config
        .save(&config_path)
        .with_context(|| format!("failed to write {}", config_path.display()))?;

    let inferer = LatentDiffusionInferer::new(config.scheduler.init(), scale_factor);
    let unet = config.unet.init::<B>(&device);
    let optimizer = AdamConfig::new().init::<B, DiffusionUnet<B>>();

    let mut trainer = DiffusionTrainer::new(
        autoencoder,
        unet,
        optimizer,
        inferer,
        config.learning_rate,
        device,
    )
    .with_loss_scaler(LossScaler::new(config.mixed_precision))
    .with_seed(config.seed);

    let history = trainer.fit(&train_loader, &val_loader, &TrainingSchedule::from_config(&config))?;
    history.save(&config.checkpoint_dir.join(HISTORY_FILE))?;

    tracing::info!("Training complete, outputs in {}", config.checkpoint_dir.display());
    Ok(())
}

fn sample<B: Backend>(args: SampleArgs, device: B::Device) -> Result<()> {
    let config = TrainingConfig::from_file(&args.run_dir.join(RUN_CONFIG_FILE))?;
    let scale_factor = config
        .scale_factor
        .ok_or_else(|| anyhow!("run config has no calibrated scale_factor"))?;
    B::seed(config.seed);

    let autoencoder_path = args
        .autoencoder
        .unwrap_or_else(|| config.autoencoder_checkpoint.clone());
    let autoencoder = load_autoencoder::<B>(&config.autoencoder, &autoencoder_path, &device)?;
    let unet = load_unet::<B>(&config.unet, &args.checkpoint, &device)?;

    let latent_size = config.latent_size();
    let shape = [
        args.count,
        config.autoencoder.latent_channels,
        latent_size,
        latent_size,
    ];
    let inferer = LatentDiffusionInferer::new(config.scheduler.init(), scale_factor);
    tracing::info!("Generating {} images", args.count);
    let images = inferer.sample(&unet, &autoencoder, shape, &device);

    fs::create_dir_all(&args.output)
        .with_context(|| format!("failed to create {}", args.output.display()))?;
    for i in 0..args.count {
        let path = args.output.join(format!("sample_{i}.png"));
        save_tensor_as_image(images.clone().slice([i..i + 1]), &path)?;
        tracing::info!("Saved {}", path.display());
    }
    Ok(())
}

/// Writes the first image of a `[batch, C, H, W]` tensor in `[0, 1]` as PNG.
fn save_tensor_as_image<B: Backend>(tensor: Tensor<B, 4>, path: &Path) -> Result<()> {
    let [_, channels, height, width] = tensor.dims();
    let values = tensor
        .slice([0..1])
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("failed to read image tensor: {e:?}"))?;

    let pixels: Vec<u8> = values
        .iter()
        .map(|&x| (x * 255.0).round().clamp(0.0, 255.0) as u8)
        .collect();
    let plane = height * width;

    match channels {
        1 => {
            let img = ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
                Luma([pixels[y as usize * width + x as usize]])
            });
            img.save(path)?;
        }
        3 => {
            let img = ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
                let idx = y as usize * width + x as usize;
                Rgb([pixels[idx], pixels[plane + idx], pixels[2 * plane + idx]])
            });
            img.save(path)?;
        }
        other => bail!("cannot write an image with {other} channels"),
    }
    Ok(())
}
