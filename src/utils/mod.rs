//! Utility module with helper functions
//!
//! This module provides:
//! - Configuration handling
//! - Checkpoint save/load utilities
//! - Image conversion and sample export
//! - Logging setup

pub mod checkpoint;
mod config;
pub mod image;
mod logging;

pub use checkpoint::{checkpoint_id, load_networks, save_networks, step_checkpoint_id, CheckpointMeta};
pub use config::{select_device, Config, DatasetConfig, ModelConfig, PathsConfig, TrainingConfigFile};
pub use image::save_image;
pub use logging::{log_file_name, setup_logging};
