//! # Talking Heads
//!
//! Few-shot adversarial meta-learning of realistic talking head models.
//! Given a handful of frames of a person, an embedder summarises their identity
//! and a generator re-renders them following a facial landmark sketch.
//!
//! ## Modules
//!
//! - `data`: Video decoding, landmark detection and rendering, dataset preprocessing and loading
//! - `model`: Embedder, Generator and projection Discriminator built on spectral-norm residual blocks
//! - `training`: Perceptual/adversarial losses and the meta-training loop
//! - `synthesis`: Rendering a processed video with a trained embedder and generator
//! - `utils`: Configuration, checkpoints, image export and logging

pub mod data;
pub mod error;
pub mod model;
pub mod synthesis;
pub mod training;
pub mod utils;

pub use data::{preprocess_dataset, PreprocessOptions, Sample, Transform, VoxCelebDataset};
pub use error::{Error, Result};
pub use model::{Discriminator, Embedder, Generator, Network, NetworkConfig, TalkingHeads};
pub use synthesis::generate_from_video;
pub use training::{LossD, LossEG, MetaTrainer, TrainingConfig, TrainingMetrics};
pub use utils::{load_networks, save_image, save_networks, Config};
