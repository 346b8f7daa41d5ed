//! Talking head models from a few frames
//!
//! Main entry point providing CLI interface for:
//! - Preprocessing a raw video dataset
//! - Meta-training the embedder, generator and discriminator
//! - Generating frames of a processed video
//! - Writing a default configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info};

use talking_heads::{
    data::{PreprocessOptions, TorchScriptDetector, Transform, VoxCelebDataset},
    model::{Network, NetworkConfig, TalkingHeads},
    synthesis::generate_from_video,
    training::{LossEG, MetaTrainer, TrainingConfig},
    utils::{checkpoint, load_networks, select_device, setup_logging, Config},
};

/// Few-shot adversarial meta-learning of talking head models
#[derive(Parser)]
#[command(name = "talking_heads")]
#[command(version = "0.1.0")]
#[command(about = "Preprocess videos, meta-train and generate talking heads")]
struct Cli {
    /// Path to configuration file (.toml or .json)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Verbosity level
    #[arg(short, long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract frames and landmarks from the raw dataset
    Dataset {
        /// Root of the raw video dataset
        #[arg(short, long)]
        source: PathBuf,

        /// Directory for processed video files
        #[arg(short, long)]
        output: PathBuf,

        /// Number of videos to process, 0 for all
        #[arg(long, default_value = "0")]
        size: usize,

        /// Number of GPUs to use, 0 for CPU
        #[arg(long, default_value = "0")]
        ngpu: usize,

        /// Reprocess videos that already have an output file
        #[arg(long)]
        overwrite: bool,

        /// Pick frames at random (1) or evenly spaced (0)
        #[arg(long, default_value = "1")]
        rf: u8,

        /// TorchScript face alignment model, overrides the configured one
        #[arg(long)]
        landmark_model: Option<String>,
    },

    /// Meta-train on a processed dataset
    MetaTrain {
        /// Directory of processed video files
        #[arg(short, long)]
        dataset: PathBuf,

        /// Number of GPUs to use, 0 for CPU
        #[arg(long, default_value = "0")]
        ngpu: usize,

        /// Resume from the checkpoint with this id
        #[arg(long)]
        continue_id: Option<String>,
    },

    /// Render every frame of a processed video from its first K frames
    Generate {
        /// Processed video file
        #[arg(long)]
        video: PathBuf,

        /// Checkpoint id to load the embedder and generator from
        #[arg(long)]
        continue_id: String,

        /// Output directory, defaults to the configured generated directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of GPUs to use, 0 for CPU
        #[arg(long, default_value = "0")]
        ngpu: usize,
    },

    /// Initialize default configuration file
    Init {
        /// Output configuration file path
        #[arg(short, long, default_value = "config.toml")]
        output: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { output } = &cli.command {
        return init_config(output);
    }

    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;
    let log_path = setup_logging(&cli.verbosity, &config.paths.log_dir)?;
    info!("Logging to {}", log_path.display());

    let result = match cli.command {
        Commands::Dataset {
            source,
            output,
            size,
            ngpu,
            overwrite,
            rf,
            landmark_model,
        } => preprocess(&config, source, output, size, ngpu, overwrite, rf != 0, landmark_model),
        Commands::MetaTrain {
            dataset,
            ngpu,
            continue_id,
        } => meta_train(&config, &dataset, ngpu, continue_id.as_deref()),
        Commands::Generate {
            video,
            continue_id,
            output,
            ngpu,
        } => generate(&config, &video, &continue_id, output, ngpu),
        Commands::Init { .. } => Ok(()),
    };

    if let Err(e) = &result {
        error!("Something went wrong: {:#}", e);
    }
    result
}

/// Preprocess the raw dataset into processed video files
#[allow(clippy::too_many_arguments)]
fn preprocess(
    config: &Config,
    source: PathBuf,
    output: PathBuf,
    size: usize,
    ngpu: usize,
    overwrite: bool,
    random_frames: bool,
    landmark_model: Option<String>,
) -> Result<()> {
    let device = select_device(ngpu);
    info!("Using device: {:?}", device);

    let model_path = landmark_model.unwrap_or_else(|| config.dataset.landmark_model.clone());
    let detector =
        TorchScriptDetector::new(&model_path, config.dataset.landmark_input_size, device)?;

    let options = PreprocessOptions {
        source,
        output,
        size,
        overwrite,
        random_frames,
        frames_per_video: config.frames_per_video(),
        line_width: config.landmark_line_width(),
        extension: config.dataset.extension.clone(),
    };

    let report = talking_heads::preprocess_dataset(&options, &detector)?;
    info!(
        "Pre-processing complete: {} processed, {} failed",
        report.processed, report.failed
    );
    Ok(())
}

/// Meta-train the three networks
fn meta_train(config: &Config, dataset_dir: &Path, ngpu: usize, continue_id: Option<&str>) -> Result<()> {
    info!("===== META-TRAINING =====");
    let device = select_device(ngpu);
    info!("Using device: {:?}", device);

    let transform = Transform::new(config.training.image_size as u32);
    let dataset = VoxCelebDataset::new(
        dataset_dir,
        &config.dataset.extension,
        config.training.shuffle_videos,
        config.training.shuffle_frames,
        transform,
    )?;
    if dataset.is_empty() {
        anyhow::bail!("no processed videos found in {}", dataset_dir.display());
    }
    info!("Dataset: {} videos", dataset.len());

    let mut network = NetworkConfig {
        base_channels: config.model.base_channels,
    };
    if let Some(id) = continue_id {
        network = checkpoint::checkpoint_network_config(&config.paths.models_dir, id, network)?;
    }

    let mut model = TalkingHeads::new(network, dataset.len() as i64, device);
    if let Some(id) = continue_id {
        load_networks(&mut model, &Network::ALL, &config.paths.models_dir, id)?;
        info!("Resumed from checkpoint {}", id);
    }

    let training_config = TrainingConfig::from_config(config);
    let loss_e_g = LossEG::load(
        &config.paths.vgg19,
        &config.paths.vgg_face,
        training_config.weights,
        training_config.feed_forward,
        device,
    )?;

    let mut trainer = MetaTrainer::new(training_config, loss_e_g, device);
    let metrics = trainer.train(&model, &dataset)?;

    if let Some(last) = metrics.latest() {
        info!(
            "Training complete. Final Loss_E_G: {:.4}, Loss_D: {:.4}",
            last.loss_e_g, last.loss_d
        );
    }
    Ok(())
}

/// Render a processed video with a trained embedder and generator
fn generate(
    config: &Config,
    video: &Path,
    continue_id: &str,
    output: Option<PathBuf>,
    ngpu: usize,
) -> Result<()> {
    let device = select_device(ngpu);
    let models_dir = &config.paths.models_dir;
    let networks = [Network::Embedder, Network::Generator];
    checkpoint::check_checkpoint(models_dir, &networks, continue_id)?;

    let network = checkpoint::checkpoint_network_config(
        models_dir,
        continue_id,
        NetworkConfig {
            base_channels: config.model.base_channels,
        },
    )?;
    let mut model = TalkingHeads::new(network, 1, device);
    load_networks(&mut model, &networks, models_dir, continue_id)?;

    let output = output.unwrap_or_else(|| PathBuf::from(&config.paths.generated_dir));
    let transform = Transform::new(config.training.image_size as u32);
    let written = generate_from_video(&model, video, config.dataset.k, &transform, &output)?;
    info!("Generated {} frames in {}", written.len(), output.display());
    Ok(())
}

/// Initialize default configuration file
fn init_config(output_path: &str) -> Result<()> {
    let config = Config::default();

    if output_path.ends_with(".toml") {
        config.save_toml(output_path)?;
    } else {
        config.save_json(output_path)?;
    }

    println!("Created default configuration at {}", output_path);
    Ok(())
}
