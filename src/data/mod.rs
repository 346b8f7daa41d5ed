//! Data module for raw video preprocessing and dataset loading
//!
//! This module provides:
//! - Frame decoding through ffmpeg
//! - Facial landmark detection and sketch rendering
//! - Conversion of the raw dataset into processed `.vid` files
//! - The meta-training dataset over processed files

pub mod dataset;
pub mod landmarks;
pub mod preprocess;
pub mod render;
pub mod video;

pub use dataset::{load_video, save_video, FrameRecord, Sample, Transform, VoxCelebDataset};
pub use landmarks::{LandmarkDetector, Landmarks, TorchScriptDetector};
pub use preprocess::{
    get_video_list, preprocess_dataset, process_video_folder, select_frames, PreprocessOptions,
    PreprocessReport, VideoFolder,
};
pub use render::plot_landmarks;
pub use video::{contains_only_videos, extract_frames, is_video_file, probe, VideoInfo};
