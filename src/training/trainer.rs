//! Meta-training loop
//!
//! One video per step. The last frame is held out as the target, the
//! remaining frames are embedded and averaged, and the generator renders the
//! target's landmarks in that identity. Embedder, generator and discriminator
//! are updated jointly, then the discriminator once more on a detached
//! regeneration.

use chrono::Local;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tch::{nn, Device, Kind, Tensor};
use tracing::{debug, info, warn};

use super::loss::{LossD, LossEG, LossWeights};
use super::metrics::{BatchRecord, TrainingMetrics};
use crate::data::{Sample, VoxCelebDataset};
use crate::error::Result;
use crate::model::TalkingHeads;
use crate::utils::{checkpoint_id, save_image, save_networks, step_checkpoint_id, CheckpointMeta, Config};

/// Training configuration
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Number of training epochs
    pub epochs: usize,
    /// Learning rate for embedder and generator
    pub lr_e_g: f64,
    /// Learning rate for discriminator
    pub lr_d: f64,
    /// Weights of the `LossEG` terms
    pub weights: LossWeights,
    /// Leave out the embedding match term
    pub feed_forward: bool,
    /// Log progress every N batches
    pub log_every: usize,
    /// Export sample images every N batches
    pub sample_every: usize,
    /// Save a timestamped checkpoint every N batches
    pub checkpoint_every: usize,
    /// Directory to save checkpoints and metrics
    pub models_dir: String,
    /// Directory to save sample images
    pub generated_dir: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl TrainingConfig {
    /// Training settings of a loaded configuration
    pub fn from_config(config: &Config) -> Self {
        let training = &config.training;
        Self {
            epochs: training.epochs,
            lr_e_g: training.lr_e_g,
            lr_d: training.lr_d,
            weights: LossWeights {
                vgg19: training.loss_vgg19_weight,
                vgg_face: training.loss_vgg_face_weight,
                mch: training.loss_mch_weight,
                fm: training.loss_fm_weight,
            },
            feed_forward: training.feed_forward,
            log_every: training.log_every,
            sample_every: training.sample_every,
            checkpoint_every: training.checkpoint_every,
            models_dir: config.paths.models_dir.clone(),
            generated_dir: config.paths.generated_dir.clone(),
        }
    }
}

/// Values of one meta-training step
#[derive(Debug)]
pub struct StepOutput {
    pub loss_e_g: f64,
    pub loss_d: f64,
    pub r_x: f64,
    pub r_x_hat: f64,
    /// Target frame
    pub x: Tensor,
    /// Detached regeneration of the target frame
    pub x_hat: Tensor,
}

/// Meta-trainer
pub struct MetaTrainer {
    config: TrainingConfig,
    device: Device,
    loss_e_g: LossEG,
    loss_d: LossD,
    metrics: TrainingMetrics,
}

impl MetaTrainer {
    /// Create a new trainer
    pub fn new(config: TrainingConfig, loss_e_g: LossEG, device: Device) -> Self {
        Self {
            config,
            device,
            loss_e_g,
            loss_d: LossD::new(),
            metrics: TrainingMetrics::new(),
        }
    }

    /// Get training metrics
    pub fn metrics(&self) -> &TrainingMetrics {
        &self.metrics
    }

    /// Get configuration
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Stack the frames and sketches of `samples` into two `[N, 3, S, S]` batches
    fn stack(&self, samples: &[Sample]) -> (Tensor, Tensor) {
        let frames: Vec<&Tensor> = samples.iter().map(|s| &s.frame).collect();
        let sketches: Vec<&Tensor> = samples.iter().map(|s| &s.landmarks).collect();
        (
            Tensor::cat(&frames, 0).to_device(self.device),
            Tensor::cat(&sketches, 0).to_device(self.device),
        )
    }

    /// One meta-training step on a single video
    ///
    /// # Arguments
    ///
    /// * `model` - Networks being trained
    /// * `opt_e_g` - Optimizer over embedder and generator
    /// * `opt_d` - Optimizer over the discriminator
    /// * `video` - Dataset index of the video, selecting the discriminator column
    /// * `samples` - At least two frames; the last one is the target
    pub fn step(
        &self,
        model: &TalkingHeads,
        opt_e_g: &mut nn::Optimizer,
        opt_d: &mut nn::Optimizer,
        video: usize,
        mut samples: Vec<Sample>,
    ) -> Result<StepOutput> {
        let i = video as i64;
        model.discriminator.check_index(i)?;

        // Put frame t aside
        let t = match samples.pop() {
            Some(t) if !samples.is_empty() => t,
            _ => {
                return Err(crate::error::Error::Dataset(format!(
                    "video {} needs at least two frames",
                    video
                )))
            }
        };
        let x_t = t.frame.to_device(self.device);
        let y_t = t.landmarks.to_device(self.device);

        // Average embedding of the remaining frames
        let (x_k, y_k) = self.stack(&samples);
        let e_hat = model.embedder.embed_average(&x_k, &y_k, true);

        let x_hat = model.generator.forward_t(&y_t, &e_hat, true);

        // Optimize E, G and D
        let (r_x_hat, d_act_hat) = model.discriminator.forward_t(&x_hat, &y_t, i, true);
        let (r_x, d_act) = model.discriminator.forward_t(&x_t, &y_t, i, true);

        opt_e_g.zero_grad();
        opt_d.zero_grad();

        let w_i = model.discriminator.w_column(i);
        let loss_e_g = self
            .loss_e_g
            .forward(&x_t, &x_hat, &r_x_hat, &e_hat, &w_i, &d_act, &d_act_hat);
        let loss_d = self.loss_d.forward(&r_x, &r_x_hat);
        (&loss_e_g + &loss_d).backward();

        opt_e_g.step();
        opt_d.step();

        // Optimize D again on a detached regeneration
        let x_hat = tch::no_grad(|| model.generator.forward_t(&y_t, &e_hat.detach(), true));
        let (r_x_hat, _) = model.discriminator.forward_t(&x_hat, &y_t, i, true);
        let (r_x, _) = model.discriminator.forward_t(&x_t, &y_t, i, true);

        opt_d.zero_grad();
        let loss_d = self.loss_d.forward(&r_x, &r_x_hat);
        loss_d.backward();
        opt_d.step();

        Ok(StepOutput {
            loss_e_g: loss_e_g.double_value(&[]),
            loss_d: loss_d.double_value(&[]),
            r_x: r_x.mean(Kind::Float).double_value(&[]),
            r_x_hat: r_x_hat.mean(Kind::Float).double_value(&[]),
            x: x_t,
            x_hat,
        })
    }

    fn save_samples(&self, output: &StepOutput) -> Result<()> {
        let dir = Path::new(&self.config.generated_dir);
        std::fs::create_dir_all(dir)?;
        let id = checkpoint_id(Local::now());
        save_image(dir.join(format!("{}_x.png", id)), &output.x)?;
        save_image(dir.join(format!("{}_x_hat.png", id)), &output.x_hat)?;
        Ok(())
    }

    fn save_checkpoint(&self, model: &TalkingHeads, id: &str, epoch: usize, batch: usize) -> Result<Vec<PathBuf>> {
        let latest = self.metrics.latest();
        let meta = CheckpointMeta {
            epoch,
            batch,
            loss_e_g: latest.map(|r| r.loss_e_g).unwrap_or(0.0),
            loss_d: latest.map(|r| r.loss_d).unwrap_or(0.0),
            timestamp: Local::now().to_rfc3339(),
            network: *model.config(),
            num_videos: model.discriminator.num_videos(),
        };
        save_networks(model, &meta, &self.config.models_dir, id)
    }

    /// Run meta-training over `dataset`
    ///
    /// Items that cannot be loaded or hold fewer than two frames are skipped
    /// with a warning.
    pub fn train(&mut self, model: &TalkingHeads, dataset: &VoxCelebDataset) -> Result<&TrainingMetrics> {
        let run_start = checkpoint_id(Local::now());
        let mut opt_e_g = model.eg_optimizer(self.config.lr_e_g)?;
        let mut opt_d = model.d_optimizer(self.config.lr_d)?;

        let metrics_path = Path::new(&self.config.models_dir).join(format!("metrics_{}.csv", run_start));
        std::fs::create_dir_all(&self.config.models_dir)?;

        info!(
            "Starting training loop. Epochs: {} Dataset Size: {}",
            self.config.epochs,
            dataset.len()
        );

        for epoch in 1..=self.config.epochs {
            let epoch_start = Instant::now();
            self.metrics.start_epoch(epoch);

            let pb = ProgressBar::new(dataset.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                    .expect("static progress template")
                    .progress_chars("##-"),
            );

            for (batch_idx, item) in dataset.iter().enumerate() {
                let batch = batch_idx + 1;
                pb.inc(1);

                let (video, samples) = match item {
                    Ok(item) => item,
                    Err(e) => {
                        warn!("Skipping batch {}: {}", batch, e);
                        continue;
                    }
                };
                if samples.len() < 2 {
                    warn!("Skipping video {}: only {} frame(s)", video, samples.len());
                    continue;
                }

                let batch_start = Instant::now();
                let output = self.step(model, &mut opt_e_g, &mut opt_d, video, samples)?;
                self.metrics.record(BatchRecord {
                    epoch,
                    batch,
                    video,
                    loss_e_g: output.loss_e_g,
                    loss_d: output.loss_d,
                    r_x: output.r_x,
                    r_x_hat: output.r_x_hat,
                    duration_ms: batch_start.elapsed().as_secs_f64() * 1000.0,
                });

                pb.set_message(format!("E_G: {:.4}, D: {:.4}", output.loss_e_g, output.loss_d));

                // Show progress
                if batch == 1 || batch % self.config.log_every == 0 {
                    let avg_time = self.metrics.avg_batch_time().unwrap_or_default();
                    info!(
                        "Epoch {}: [{}/{}] | Avg Time: {:?} | Loss_E_G = {:.4} Loss_D {:.4}",
                        epoch,
                        batch,
                        dataset.len(),
                        avg_time,
                        output.loss_e_g,
                        output.loss_d
                    );
                    debug!("D(x) = {:.4} D(x_hat) = {:.4}", output.r_x, output.r_x_hat);
                    self.metrics.flush_csv(&metrics_path)?;
                }

                // Save images
                if batch % self.config.sample_every == 0 {
                    self.save_samples(&output)?;
                }

                if batch % self.config.checkpoint_every == 0 {
                    let id = step_checkpoint_id(Local::now(), epoch, batch);
                    self.save_checkpoint(model, &id, epoch, batch)?;
                }
            }
            pb.finish_with_message("done");

            // Save models
            self.save_checkpoint(model, &run_start, epoch, dataset.len())?;
            self.metrics.flush_csv(&metrics_path)?;

            if let Some(avg_time) = self.metrics.avg_batch_time() {
                info!(
                    "Epoch {} finished in {:?}. Average batch time: {:?}",
                    epoch,
                    epoch_start.elapsed(),
                    avg_time
                );
            }

            if self.metrics.discriminator_dominates(self.config.log_every) {
                warn!("Discriminator is dominating; consider lowering lr_d");
            }
        }

        Ok(&self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{save_video, FrameRecord, Landmarks, Transform};
    use crate::model::{NetworkConfig, VggFeatures, VggKind};
    use image::{Rgb, RgbImage};

    fn loss() -> LossEG {
        LossEG::new(
            VggFeatures::new(VggKind::Vgg19, Device::Cpu),
            VggFeatures::new(VggKind::VggFace, Device::Cpu),
            LossWeights::default(),
            false,
        )
    }

    fn sample() -> Sample {
        Sample {
            frame: Tensor::randn([1, 3, 128, 128], (Kind::Float, Device::Cpu)),
            landmarks: Tensor::randn([1, 3, 128, 128], (Kind::Float, Device::Cpu)),
        }
    }

    fn test_config(dir: &Path) -> TrainingConfig {
        TrainingConfig {
            epochs: 1,
            log_every: 1,
            sample_every: 1,
            checkpoint_every: 100,
            models_dir: dir.join("models").to_string_lossy().to_string(),
            generated_dir: dir.join("generated").to_string_lossy().to_string(),
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn test_training_config_defaults() {
        let config = TrainingConfig::default();
        assert_eq!(config.epochs, 100);
        assert_eq!(config.lr_e_g, 5e-5);
        assert_eq!(config.lr_d, 2e-4);
        assert_eq!(config.weights, LossWeights::default());
        assert_eq!(config.checkpoint_every, 2000);
    }

    #[test]
    fn test_step_updates_all_networks() {
        let dir = tempfile::tempdir().unwrap();
        let model = TalkingHeads::new(NetworkConfig::tiny(), 2, Device::Cpu);
        let trainer = MetaTrainer::new(test_config(dir.path()), loss(), Device::Cpu);
        let mut opt_e_g = model.eg_optimizer(1e-2).unwrap();
        let mut opt_d = model.d_optimizer(1e-2).unwrap();

        let before_p = model.generator.projection_weight().copy();
        let before_w = model.discriminator.w.copy();

        let output = trainer
            .step(&model, &mut opt_e_g, &mut opt_d, 1, vec![sample(), sample(), sample()])
            .unwrap();

        assert!(output.loss_e_g.is_finite());
        assert!(output.loss_d >= 0.0);
        assert_eq!(output.x_hat.size(), vec![1, 3, 128, 128]);
        assert!(!output.x_hat.requires_grad());
        assert!(!before_p.equal(&model.generator.projection_weight()));
        assert!(!before_w.equal(&model.discriminator.w));
    }

    #[test]
    fn test_step_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let model = TalkingHeads::new(NetworkConfig::tiny(), 2, Device::Cpu);
        let trainer = MetaTrainer::new(test_config(dir.path()), loss(), Device::Cpu);
        let mut opt_e_g = model.eg_optimizer(1e-3).unwrap();
        let mut opt_d = model.d_optimizer(1e-3).unwrap();

        assert!(trainer
            .step(&model, &mut opt_e_g, &mut opt_d, 5, vec![sample(), sample()])
            .is_err());
        assert!(trainer
            .step(&model, &mut opt_e_g, &mut opt_d, 0, vec![sample()])
            .is_err());
    }

    fn write_video(path: &Path, frames: u8) {
        let records: Vec<FrameRecord> = (0..frames)
            .map(|i| FrameRecord {
                frame: RgbImage::from_pixel(128, 128, Rgb([10 * i, 100, 50])),
                sketch: RgbImage::from_pixel(128, 128, Rgb([255, 255, 255])),
                landmarks: Landmarks::new([[64.0, 64.0]; 68]),
            })
            .collect();
        save_video(path, &records).unwrap();
    }

    #[test]
    fn test_periodic_checkpoints_get_their_own_ids() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        write_video(&data.join("a.vid"), 3);
        write_video(&data.join("b.vid"), 3);

        let dataset = VoxCelebDataset::new(&data, ".vid", false, true, Transform::new(128)).unwrap();
        let model = TalkingHeads::new(NetworkConfig::tiny(), dataset.len() as i64, Device::Cpu);
        let config = TrainingConfig {
            checkpoint_every: 1,
            sample_every: 100,
            ..test_config(dir.path())
        };
        let mut trainer = MetaTrainer::new(config, loss(), Device::Cpu);
        trainer.train(&model, &dataset).unwrap();

        let models = dir.path().join("models");
        let ids = crate::utils::checkpoint::list_checkpoints(&models).unwrap();
        // One per batch plus the end-of-epoch checkpoint
        assert_eq!(ids.len(), 3);
        assert_eq!(ids.iter().filter(|id| id.ends_with("_e001_b000001")).count(), 1);
        assert_eq!(ids.iter().filter(|id| id.ends_with("_e001_b000002")).count(), 1);
        for id in &ids {
            crate::utils::checkpoint::check_checkpoint(&models, &crate::model::Network::ALL, id).unwrap();
        }
        // Four files per checkpoint and the metrics CSV
        assert_eq!(std::fs::read_dir(&models).unwrap().count(), 13);

        let csv_path = std::fs::read_dir(&models)
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.extension().map(|x| x == "csv").unwrap_or(false))
            .unwrap();
        assert_eq!(TrainingMetrics::load_csv(csv_path).unwrap().len(), 2);
    }

    #[test]
    fn test_train_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();

        let record = |shade: u8| FrameRecord {
            frame: RgbImage::from_pixel(128, 128, Rgb([shade, 100, 50])),
            sketch: RgbImage::from_pixel(128, 128, Rgb([255, 255, 255])),
            landmarks: Landmarks::new([[64.0, 64.0]; 68]),
        };
        save_video(data.join("a.vid"), &[record(10), record(20), record(30)]).unwrap();
        save_video(data.join("b.vid"), &[record(40)]).unwrap();

        let dataset = VoxCelebDataset::new(&data, ".vid", false, true, Transform::new(128)).unwrap();
        let model = TalkingHeads::new(NetworkConfig::tiny(), dataset.len() as i64, Device::Cpu);
        let mut trainer = MetaTrainer::new(test_config(dir.path()), loss(), Device::Cpu);

        let metrics = trainer.train(&model, &dataset).unwrap();
        // The single-frame video is skipped
        assert_eq!(metrics.len(), 1);

        let models: Vec<_> = std::fs::read_dir(dir.path().join("models")).unwrap().collect();
        // Three networks, the metadata sidecar and the metrics CSV
        assert_eq!(models.len(), 5);
        let samples: Vec<_> = std::fs::read_dir(dir.path().join("generated")).unwrap().collect();
        assert!(!samples.is_empty());
    }
}
