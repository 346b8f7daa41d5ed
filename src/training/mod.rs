//! Training module for meta-learning
//!
//! This module provides:
//! - The meta-training loop
//! - Perceptual, adversarial and embedding match losses
//! - Training configuration and metrics

mod loss;
mod metrics;
mod trainer;

pub use loss::{LossD, LossEG, LossEGParts, LossWeights, VGG_FACE_MEAN};
pub use metrics::{BatchRecord, TrainingMetrics};
pub use trainer::{MetaTrainer, StepOutput, TrainingConfig};
