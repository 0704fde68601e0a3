//! Denoiser training in the latent space of a frozen autoencoder.
//!
//! The autoencoder lives on the inner (non-autodiff) backend, so its weights
//! are never part of the autodiff graph and cannot receive gradients. The
//! denoiser is the only module handed to the optimizer.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::AutodiffModule;
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Distribution, ElementConversion, Int, Tensor, TensorData};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::amp::LossScaler;
use crate::checkpoint::{checkpoint_path, save_module};
use crate::config::TrainingConfig;
use crate::data::DataLoader;
use crate::error::{Result, TrainError};
use crate::inferer::LatentDiffusionInferer;
use crate::model::{Denoiser, LatentEncoder};

/// Per-epoch record of a run, written as `history.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Mean training loss of every epoch, in order.
    pub epoch_losses: Vec<f32>,
    /// `(completed epochs, mean validation loss)` for each validation pass.
    pub val_losses: Vec<(usize, f32)>,
    /// Epoch numbers a denoiser checkpoint was written after.
    pub checkpoints: Vec<usize>,
}

impl TrainingHistory {
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// `epoch` is zero-based, so an interval of 10 fires after the 10th, 20th, ... epoch.
pub fn should_checkpoint(epoch: usize, interval: usize) -> bool {
    (epoch + 1) % interval == 0
}

pub fn should_validate(epoch: usize, interval: usize) -> bool {
    (epoch + 1) % interval == 0
}

/// Epoch-level settings of a run.
#[derive(Debug, Clone)]
pub struct TrainingSchedule {
    pub n_epochs: usize,
    pub val_interval: usize,
    pub checkpoint_interval: usize,
    pub checkpoint_dir: PathBuf,
}

impl TrainingSchedule {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            n_epochs: config.n_epochs,
            val_interval: config.val_interval,
            checkpoint_interval: config.checkpoint_interval,
            checkpoint_dir: config.checkpoint_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    /// Unscaled batch loss.
    pub loss: f32,
    /// The optimizer step was skipped because of a gradient overflow.
    pub skipped: bool,
}

pub struct DiffusionTrainer<B, E, D, O>
where
    B: AutodiffBackend,
    E: LatentEncoder<B::InnerBackend>,
    D: Denoiser<B> + AutodiffModule<B>,
    D::InnerModule: Denoiser<B::InnerBackend>,
    O: Optimizer<D, B>,
{
    encoder: E,
    denoiser: D,
    optimizer: O,
    inferer: LatentDiffusionInferer,
    scaler: LossScaler,
    learning_rate: f64,
    rng: StdRng,
    device: B::Device,
}

impl<B, E, D, O> DiffusionTrainer<B, E, D, O>
where
    B: AutodiffBackend,
    E: LatentEncoder<B::InnerBackend>,
    D: Denoiser<B> + AutodiffModule<B>,
    D::InnerModule: Denoiser<B::InnerBackend>,
    O: Optimizer<D, B>,
{
    pub fn new(
        encoder: E,
        denoiser: D,
        optimizer: O,
        inferer: LatentDiffusionInferer,
        learning_rate: f64,
        device: B::Device,
    ) -> Self {
        Self {
            encoder,
            denoiser,
            optimizer,
            inferer,
            scaler: LossScaler::default(),
            learning_rate,
            rng: StdRng::seed_from_u64(0),
            device,
        }
    }

    pub fn with_loss_scaler(mut self, scaler: LossScaler) -> Self {
        self.scaler = scaler;
        self
    }

    /// Seeds the generator used for shuffling and timestep draws.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn denoiser(&self) -> &D {
        &self.denoiser
    }

    pub fn into_denoiser(self) -> D {
        self.denoiser
    }

    pub fn loss_scaler(&self) -> &LossScaler {
        &self.scaler
    }

    /// One timestep per sample, uniform over the scheduler's range.
    fn sample_timesteps<BT: Backend>(&mut self, batch_size: usize, device: &BT::Device) -> Tensor<BT, 1, Int> {
        let num_steps = self.inferer.scheduler().num_train_timesteps();
        let timesteps: Vec<i32> = (0..batch_size)
            .map(|_| self.rng.gen_range(0..num_steps) as i32)
            .collect();
        Tensor::from_data(TensorData::new(timesteps, [batch_size]), device)
    }

    /// Noise-prediction loss of `images` on the autodiff graph.
    fn loss(&mut self, images: Tensor<B::InnerBackend, 4>) -> Tensor<B, 1> {
        let latents = self.inferer.encode_latents(&self.encoder, images);
        let latents = Tensor::<B, 4>::from_inner(latents);

        let timesteps = self.sample_timesteps::<B>(latents.dims()[0], &self.device.clone());
        let noise = latents.random_like(Distribution::Normal(0.0, 1.0));
        let noise_pred = self
            .inferer
            .predict_noise(&self.denoiser, latents, noise.clone(), timesteps);

        MseLoss::new().forward(noise_pred, noise, Reduction::Mean)
    }

    /// Backpropagates the scaled loss of one batch.
    ///
    /// Returns the unscaled loss and the still scaled gradients of the
    /// denoiser's parameters.
    pub fn gradients(&mut self, images: Tensor<B::InnerBackend, 4>) -> (f32, GradientsParams) {
        let loss = self.loss(images);
        let loss_value = loss.clone().into_scalar().elem::<f32>();

        let grads = self.scaler.scale_loss(loss).backward();
        let grads = GradientsParams::from_grads(grads, &self.denoiser);
        (loss_value, grads)
    }

    pub fn train_step(&mut self, images: Tensor<B::InnerBackend, 4>) -> StepOutput {
        let (loss, mut grads) = self.gradients(images);

        let skipped = self.scaler.unscale::<B, D>(&self.denoiser, &mut grads);
        if !skipped {
            self.denoiser = self
                .optimizer
                .step(self.learning_rate, self.denoiser.clone(), grads);
        }
        self.scaler.update(skipped);

        StepOutput { loss, skipped }
    }

    /// One shuffled pass over `loader`; returns the mean batch loss.
    pub fn train_epoch(&mut self, loader: &DataLoader, epoch: usize) -> Result<f32> {
        let plan = loader.epoch_plan(&mut self.rng);

        let progress = ProgressBar::new(plan.len() as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        progress.set_prefix(format!("Epoch {epoch}"));

        let mut total_loss = 0.0f32;
        let mut steps = 0usize;
        for indices in &plan {
            let images = loader.load::<B::InnerBackend>(indices, &self.device)?;
            let output = self.train_step(images);

            total_loss += output.loss;
            steps += 1;
            progress.set_message(format!("loss: {:.4}", total_loss / steps as f32));
            progress.inc(1);
        }
        progress.finish();

        if steps == 0 {
            return Err(TrainError::EmptyLoader("train"));
        }
        Ok(total_loss / steps as f32)
    }

    /// Mean noise-prediction loss over `loader` without gradient tracking.
    pub fn validate(&mut self, loader: &DataLoader) -> Result<f32> {
        let denoiser = self.denoiser.valid();
        let plan = loader.epoch_plan(&mut self.rng);

        let mut total_loss = 0.0f32;
        let mut steps = 0usize;
        for indices in &plan {
            let images = loader.load::<B::InnerBackend>(indices, &self.device)?;
            let latents = self.inferer.encode_latents(&self.encoder, images);

            let timesteps =
                self.sample_timesteps::<B::InnerBackend>(latents.dims()[0], &self.device.clone());
            let noise = latents.random_like(Distribution::Normal(0.0, 1.0));
            let noise_pred = self
                .inferer
                .predict_noise(&denoiser, latents, noise.clone(), timesteps);

            let loss = MseLoss::new().forward(noise_pred, noise, Reduction::Mean);
            total_loss += loss.into_scalar().elem::<f32>();
            steps += 1;
        }

        if steps == 0 {
            return Err(TrainError::EmptyLoader("validation"));
        }
        Ok(total_loss / steps as f32)
    }

    /// Runs every epoch of `schedule`, checkpointing and validating on their intervals.
    pub fn fit(
        &mut self,
        train_loader: &DataLoader,
        val_loader: &DataLoader,
        schedule: &TrainingSchedule,
    ) -> Result<TrainingHistory> {
        fs::create_dir_all(&schedule.checkpoint_dir)?;
        let mut history = TrainingHistory::default();

        for epoch in 0..schedule.n_epochs {
            let epoch_loss = self.train_epoch(train_loader, epoch)?;
            history.epoch_losses.push(epoch_loss);
            tracing::info!("Epoch {epoch} train loss: {epoch_loss:.4}");

            if should_checkpoint(epoch, schedule.checkpoint_interval) {
                let path = checkpoint_path(&schedule.checkpoint_dir, epoch + 1);
                save_module(&self.denoiser, &path)?;
                history.checkpoints.push(epoch + 1);
            }

            if should_validate(epoch, schedule.val_interval) {
                let val_loss = self.validate(val_loader)?;
                tracing::info!("Epoch {epoch} val loss: {val_loss:.4}");
                history.val_losses.push((epoch + 1, val_loss));
            }
        }

        if self.scaler.is_enabled() {
            tracing::debug!("Final loss scale: {}", self.scaler.scale());
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoencoder::{AutoencoderKl, AutoencoderKlConfig};
    use crate::scheduler::DdpmSchedulerConfig;
    use crate::unet::{DiffusionUnet, DiffusionUnetConfig};
    use burn::backend::{Autodiff, NdArray};
    use burn::module::{Module, ModuleVisitor, ParamId};
    use burn::optim::AdamConfig;

    type Inner = NdArray;
    type TestBackend = Autodiff<NdArray>;

    fn tiny_autoencoder() -> AutoencoderKl<Inner> {
        AutoencoderKlConfig::new()
            .with_num_channels(vec![4, 4])
            .with_norm_num_groups(2)
            .init(&Default::default())
    }

    fn tiny_unet() -> DiffusionUnet<TestBackend> {
        DiffusionUnetConfig::new()
            .with_num_channels(vec![4, 8])
            .with_attention_levels(vec![false, true])
            .with_num_head_channels(vec![0, 4])
            .with_norm_num_groups(2)
            .init(&Default::default())
    }

    fn trainer(
        learning_rate: f64,
    ) -> DiffusionTrainer<
        TestBackend,
        AutoencoderKl<Inner>,
        DiffusionUnet<TestBackend>,
        impl Optimizer<DiffusionUnet<TestBackend>, TestBackend>,
    > {
        let inferer = LatentDiffusionInferer::new(DdpmSchedulerConfig::new().init(), 1.0);
        DiffusionTrainer::new(
            tiny_autoencoder(),
            tiny_unet(),
            AdamConfig::new().init::<TestBackend, DiffusionUnet<TestBackend>>(),
            inferer,
            learning_rate,
            Default::default(),
        )
        .with_seed(42)
    }

    fn uniform_batch() -> Tensor<Inner, 4> {
        Tensor::random([8, 1, 16, 16], Distribution::Uniform(0.0, 1.0), &Default::default())
    }

    struct ParamIds(Vec<ParamId>);

    impl<B: Backend> ModuleVisitor<B> for ParamIds {
        fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
            self.0.push(id);
        }
    }

    struct GradPresence<'a> {
        grads: &'a GradientsParams,
        present: usize,
        missing: usize,
    }

    impl<B: AutodiffBackend> ModuleVisitor<B> for GradPresence<'_> {
        fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
            if self.grads.get::<B::InnerBackend, D>(id).is_some() {
                self.present += 1;
            } else {
                self.missing += 1;
            }
        }
    }

    #[test]
    fn step_on_uniform_noise_has_finite_loss() {
        let mut trainer = trainer(1e-4);
        let output = trainer.train_step(uniform_batch());
        assert!(output.loss.is_finite() && output.loss > 0.0);
        assert!(!output.skipped);
    }

    #[test]
    fn overflowing_step_leaves_denoiser_untouched() {
        let mut trainer =
            trainer(1e-2).with_loss_scaler(LossScaler::new(true).with_init_scale(f32::MAX));
        let device = Default::default();
        let x = Tensor::<Inner, 4>::random([2, 1, 8, 8], Distribution::Normal(0.0, 1.0), &device);
        let t = Tensor::<Inner, 1, Int>::from_ints([10, 500], &device);
        let before = trainer.denoiser().valid().forward(x.clone(), t.clone());

        let output = trainer.train_step(uniform_batch());
        assert!(output.skipped);
        assert!(output.loss.is_finite());

        let after = trainer.denoiser().valid().forward(x, t);
        let diff = (before - after).abs().max().into_scalar();
        assert_eq!(diff, 0.0);
        assert_eq!(trainer.loss_scaler().scale(), f32::MAX * 0.5);
    }

    #[test]
    fn repeated_steps_on_one_batch_reduce_loss() {
        let mut trainer = trainer(3e-3).with_loss_scaler(LossScaler::new(false));
        let images = uniform_batch();

        let losses: Vec<f32> = (0..60)
            .map(|_| trainer.train_step(images.clone()).loss)
            .collect();
        // per-step timesteps and noise are random, compare windows
        let early: f32 = losses[..5].iter().sum::<f32>() / 5.0;
        let late: f32 = losses[50..].iter().sum::<f32>() / 10.0;
        assert!(late < early, "early {early}, late {late}");
    }

    #[test]
    fn only_denoiser_parameters_receive_gradients() {
        let mut trainer = trainer(1e-4);

        let mut encoder_ids = ParamIds(Vec::new());
        trainer.encoder.visit(&mut encoder_ids);
        assert!(!encoder_ids.0.is_empty());

        let (_, grads) = trainer.gradients(uniform_batch());
        for id in &encoder_ids.0 {
            assert!(grads.get::<Inner, 4>(*id).is_none());
            assert!(grads.get::<Inner, 1>(*id).is_none());
        }

        let mut presence = GradPresence {
            grads: &grads,
            present: 0,
            missing: 0,
        };
        trainer.denoiser().visit(&mut presence);
        assert_eq!(presence.missing, 0);
        assert!(presence.present > 0);
        assert_eq!(grads.len(), presence.present);
    }

    #[test]
    fn interval_predicates_fire_on_completed_epochs() {
        let checkpoints: Vec<usize> = (0..25).filter(|&e| should_checkpoint(e, 10)).collect();
        assert_eq!(checkpoints, [9, 19]);
        let validations: Vec<usize> = (0..12).filter(|&e| should_validate(e, 5)).collect();
        assert_eq!(validations, [4, 9]);
    }

    #[test]
    fn history_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let history = TrainingHistory {
            epoch_losses: vec![0.9, 0.5],
            val_losses: vec![(2, 0.6)],
            checkpoints: vec![],
        };
        history.save(&path).unwrap();
        assert_eq!(TrainingHistory::load(&path).unwrap(), history);
    }
}
