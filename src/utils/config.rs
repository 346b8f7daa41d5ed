//! Configuration management
//!
//! Provides unified configuration for preprocessing, the networks and meta-training.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Filesystem locations
    pub paths: PathsConfig,
    /// Dataset configuration
    pub dataset: DatasetConfig,
    /// Network configuration
    pub model: ModelConfig,
    /// Training configuration
    pub training: TrainingConfigFile,
}

/// Filesystem locations for weights, logs and artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Pretrained VGG-Face weights (torchvision `features.N` naming)
    pub vgg_face: String,
    /// Pretrained VGG19 weights (torchvision `features.N` naming)
    pub vgg19: String,
    /// Directory for daily log files
    pub log_dir: String,
    /// Directory for network checkpoints
    pub models_dir: String,
    /// Directory for sample images written during training
    pub generated_dir: String,
}

/// Dataset-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Resolution the landmark sketches are drawn at (line width scales with it)
    pub features_dpi: u32,
    /// Number of frames used to embed an identity
    pub k: usize,
    /// Extension of processed video files
    pub extension: String,
    /// TorchScript face alignment model
    pub landmark_model: String,
    /// Square input size expected by the landmark model
    pub landmark_input_size: i64,
}

/// Network-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Channel width of the first residual block (64 gives 64/128/256/512)
    pub base_channels: i64,
}

/// Training-related configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfigFile {
    /// Side of the square crops fed to the networks
    pub image_size: i64,
    /// Number of epochs
    pub epochs: usize,
    /// Learning rate shared by embedder and generator
    pub lr_e_g: f64,
    /// Discriminator learning rate
    pub lr_d: f64,
    /// Weight of the VGG-Face perceptual term
    pub loss_vgg_face_weight: f64,
    /// Weight of the VGG19 perceptual term
    pub loss_vgg19_weight: f64,
    /// Weight of the embedding match term
    pub loss_mch_weight: f64,
    /// Weight of the discriminator feature matching term
    pub loss_fm_weight: f64,
    /// Drop the embedding match term (the meta-training default)
    pub feed_forward: bool,
    /// Visit videos in random order each epoch
    #[serde(default)]
    pub shuffle_videos: bool,
    /// Shuffle frame order every time a video is loaded
    pub shuffle_frames: bool,
    /// Log progress every N batches
    pub log_every: usize,
    /// Export sample images every N batches
    pub sample_every: usize,
    /// Save a timestamped checkpoint every N batches
    pub checkpoint_every: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            paths: PathsConfig {
                vgg_face: "models/vgg_face_dag.pt".to_string(),
                vgg19: "models/vgg19.pt".to_string(),
                log_dir: "logs".to_string(),
                models_dir: "models".to_string(),
                generated_dir: "generated_img".to_string(),
            },
            dataset: DatasetConfig {
                features_dpi: 100,
                k: 32,
                extension: ".vid".to_string(),
                landmark_model: "models/face_alignment.pt".to_string(),
                landmark_input_size: 256,
            },
            model: ModelConfig { base_channels: 64 },
            training: TrainingConfigFile {
                image_size: 224,
                epochs: 100,
                lr_e_g: 5e-5,
                lr_d: 2e-4,
                loss_vgg_face_weight: 2e-3,
                loss_vgg19_weight: 1e-2,
                loss_mch_weight: 8e1,
                loss_fm_weight: 1e1,
                feed_forward: true,
                shuffle_videos: false,
                shuffle_frames: true,
                log_every: 100,
                sample_every: 100,
                checkpoint_every: 2000,
            },
        }
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from TOML file
    pub fn from_toml(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_toml(&self, path: &str) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from JSON file
    pub fn from_json(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to JSON file
    pub fn save_json(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from `path` by extension, or fall back to defaults when it does not exist
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            return Ok(Self::default());
        }
        let config = if path.ends_with(".toml") {
            Self::from_toml(path)?
        } else {
            Self::from_json(path)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Frames stored per processed video: K embedding frames plus one target
    pub fn frames_per_video(&self) -> usize {
        self.dataset.k + 1
    }

    /// Landmark line width in pixels, 2 at the reference 100 dpi
    pub fn landmark_line_width(&self) -> u32 {
        ((2.0 * self.dataset.features_dpi as f64 / 100.0).round() as u32).max(1)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.dataset.k == 0 {
            return Err(Error::Config("K must be > 0".to_string()));
        }
        if self.dataset.features_dpi == 0 {
            return Err(Error::Config("Features dpi must be > 0".to_string()));
        }
        if self.dataset.landmark_input_size <= 0 {
            return Err(Error::Config("Landmark input size must be > 0".to_string()));
        }
        if self.model.base_channels < 1 {
            return Err(Error::Config("Base channel count must be > 0".to_string()));
        }
        // AdaIN needs at least 2x2 pixels after six stride-2 stages
        if self.training.image_size < 128 {
            return Err(Error::Config("Image size must be >= 128".to_string()));
        }
        if self.training.epochs == 0 {
            return Err(Error::Config("Number of epochs must be > 0".to_string()));
        }
        if self.training.lr_e_g <= 0.0 || self.training.lr_d <= 0.0 {
            return Err(Error::Config("Learning rates must be > 0".to_string()));
        }
        if self.training.log_every == 0
            || self.training.sample_every == 0
            || self.training.checkpoint_every == 0
        {
            return Err(Error::Config("Logging, sampling and checkpoint intervals must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Pick `Cuda(0)` when GPUs were requested and CUDA is available, CPU otherwise
pub fn select_device(ngpu: usize) -> tch::Device {
    if ngpu > 0 {
        if tch::Cuda::is_available() {
            return tch::Device::Cuda(0);
        }
        tracing::warn!("CUDA requested but not available, falling back to CPU");
    }
    tch::Device::Cpu
}
