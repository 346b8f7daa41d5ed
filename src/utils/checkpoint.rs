//! Checkpoint save/load utilities
//!
//! Every network is written to `<dir>/<Network>_<id>.pt` where `id` is a
//! minute-resolution timestamp. A `meta_<id>.json` sidecar records the
//! training position and the channel layout.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::model::{Network, NetworkConfig, TalkingHeads};

/// Checkpoint metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Epoch the checkpoint was taken in (1-based)
    pub epoch: usize,
    /// Batches completed in that epoch
    pub batch: usize,
    /// Embedder/generator loss at checkpoint
    pub loss_e_g: f64,
    /// Discriminator loss at checkpoint
    pub loss_d: f64,
    /// Timestamp of checkpoint
    pub timestamp: String,
    /// Channel layout
    pub network: NetworkConfig,
    /// Discriminator columns
    pub num_videos: i64,
}

/// Checkpoint id for `time`, e.g. `20240131_0915`
pub fn checkpoint_id(time: DateTime<Local>) -> String {
    time.format("%Y%m%d_%H%M").to_string()
}

/// Id of a mid-epoch checkpoint, e.g. `20240131_0915_e001_b002000`
///
/// The training position keeps it apart from the run's rolling end-of-epoch id.
pub fn step_checkpoint_id(time: DateTime<Local>, epoch: usize, batch: usize) -> String {
    format!("{}_e{:03}_b{:06}", checkpoint_id(time), epoch, batch)
}

/// Path of one network's weights
pub fn network_path(dir: impl AsRef<Path>, network: Network, id: &str) -> PathBuf {
    dir.as_ref().join(format!("{}_{}.pt", network.name(), id))
}

fn meta_path(dir: impl AsRef<Path>, id: &str) -> PathBuf {
    dir.as_ref().join(format!("meta_{}.json", id))
}

/// Save all three networks and the metadata sidecar
///
/// # Returns
///
/// Paths of the written weight files
pub fn save_networks(
    model: &TalkingHeads,
    meta: &CheckpointMeta,
    dir: impl AsRef<Path>,
    id: &str,
) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let mut paths = Vec::with_capacity(Network::ALL.len());
    for network in Network::ALL {
        let path = network_path(dir, network, id);
        model.save_network(network, &path)?;
        tracing::info!("Model saved: {}", path.display());
        paths.push(path);
    }

    let meta_json = serde_json::to_string_pretty(meta)?;
    std::fs::write(meta_path(dir, id), meta_json)?;

    Ok(paths)
}

/// Load the given networks saved under `id`
pub fn load_networks(
    model: &mut TalkingHeads,
    networks: &[Network],
    dir: impl AsRef<Path>,
    id: &str,
) -> Result<()> {
    let dir = dir.as_ref();
    for &network in networks {
        let path = network_path(dir, network, id);
        model.load_network(network, &path)?;
        tracing::info!("Model loaded: {}", path.display());
    }
    Ok(())
}

/// Load checkpoint metadata, if the sidecar exists
pub fn load_checkpoint_meta(dir: impl AsRef<Path>, id: &str) -> Result<Option<CheckpointMeta>> {
    let path = meta_path(dir, id);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    let meta = serde_json::from_str(&content)?;
    Ok(Some(meta))
}

/// Channel layout stored with a checkpoint, falling back to `default`
pub fn checkpoint_network_config(
    dir: impl AsRef<Path>,
    id: &str,
    default: NetworkConfig,
) -> Result<NetworkConfig> {
    match load_checkpoint_meta(dir, id)? {
        Some(meta) if meta.network != default => {
            tracing::warn!(
                "Checkpoint {} uses base_channels = {}, overriding configured {}",
                id,
                meta.network.base_channels,
                default.base_channels
            );
            Ok(meta.network)
        }
        Some(meta) => Ok(meta.network),
        None => Ok(default),
    }
}

/// List checkpoint ids in `dir`, newest first
pub fn list_checkpoints(dir: impl AsRef<Path>) -> Result<Vec<String>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(vec![]);
    }

    let prefix = format!("{}_", Network::Embedder.name());
    let mut ids: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter_map(|name| {
            name.strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".pt"))
                .map(str::to_string)
        })
        .collect();

    ids.sort_by(|a, b| b.cmp(a));
    Ok(ids)
}

/// Fail early when a checkpoint id has missing network files
pub fn check_checkpoint(dir: impl AsRef<Path>, networks: &[Network], id: &str) -> Result<()> {
    let dir = dir.as_ref();
    let missing: Vec<_> = networks
        .iter()
        .filter(|&&n| !network_path(dir, n, id).exists())
        .map(|n| n.name())
        .collect();
    if !missing.is_empty() {
        return Err(Error::Checkpoint(format!(
            "checkpoint {} in {} is missing {}",
            id,
            dir.display(),
            missing.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tch::Device;

    fn meta() -> CheckpointMeta {
        CheckpointMeta {
            epoch: 1,
            batch: 2000,
            loss_e_g: 1.5,
            loss_d: 0.7,
            timestamp: "2024-01-31T09:15:00+00:00".to_string(),
            network: NetworkConfig::tiny(),
            num_videos: 2,
        }
    }

    #[test]
    fn test_checkpoint_id_format() {
        let time = Local.with_ymd_and_hms(2024, 1, 31, 9, 15, 42).unwrap();
        assert_eq!(checkpoint_id(time), "20240131_0915");
        assert_eq!(
            network_path("models", Network::Discriminator, "20240131_0915"),
            PathBuf::from("models/Discriminator_20240131_0915.pt")
        );
    }

    #[test]
    fn test_save_and_load_networks() {
        let dir = tempfile::tempdir().unwrap();
        let model = TalkingHeads::new(NetworkConfig::tiny(), 2, Device::Cpu);

        let paths = save_networks(&model, &meta(), dir.path(), "20240131_0915").unwrap();
        assert_eq!(paths.len(), 3);
        assert!(paths.iter().all(|p| p.exists()));
        check_checkpoint(dir.path(), &Network::ALL, "20240131_0915").unwrap();

        let mut other = TalkingHeads::new(NetworkConfig::tiny(), 2, Device::Cpu);
        load_networks(&mut other, &Network::ALL, dir.path(), "20240131_0915").unwrap();

        let loaded = load_checkpoint_meta(dir.path(), "20240131_0915").unwrap().unwrap();
        assert_eq!(loaded.batch, 2000);
        assert_eq!(loaded.network, NetworkConfig::tiny());
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = TalkingHeads::new(NetworkConfig::tiny(), 2, Device::Cpu);

        assert!(check_checkpoint(dir.path(), &Network::ALL, "nope").is_err());
        assert!(load_networks(&mut model, &[Network::Embedder], dir.path(), "nope").is_err());
        assert!(load_checkpoint_meta(dir.path(), "nope").unwrap().is_none());
        assert_eq!(
            checkpoint_network_config(dir.path(), "nope", NetworkConfig::default()).unwrap(),
            NetworkConfig::default()
        );
    }

    #[test]
    fn test_step_checkpoint_id() {
        let time = Local.with_ymd_and_hms(2024, 1, 31, 9, 15, 42).unwrap();
        assert_eq!(step_checkpoint_id(time, 2, 4000), "20240131_0915_e002_b004000");
        assert_ne!(step_checkpoint_id(time, 1, 1), checkpoint_id(time));
    }

    #[test]
    fn test_resume_adopts_checkpoint_layout() {
        let dir = tempfile::tempdir().unwrap();
        let model = TalkingHeads::new(NetworkConfig::tiny(), 2, Device::Cpu);
        save_networks(&model, &meta(), dir.path(), "20240131_0915").unwrap();

        let network =
            checkpoint_network_config(dir.path(), "20240131_0915", NetworkConfig::default()).unwrap();
        assert_eq!(network, NetworkConfig::tiny());

        // The adopted layout loads cleanly where the configured one would not
        let mut resumed = TalkingHeads::new(network, 2, Device::Cpu);
        load_networks(&mut resumed, &Network::ALL, dir.path(), "20240131_0915").unwrap();
        let mut mismatched = TalkingHeads::new(NetworkConfig { base_channels: 4 }, 2, Device::Cpu);
        assert!(load_networks(&mut mismatched, &Network::ALL, dir.path(), "20240131_0915").is_err());
    }

    #[test]
    fn test_list_checkpoints_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        for id in ["20240101_0000", "20240301_1200", "20240201_0800"] {
            std::fs::write(dir.path().join(format!("Embedder_{}.pt", id)), b"").unwrap();
        }
        std::fs::write(dir.path().join("Generator_20250101_0000.pt"), b"").unwrap();

        let ids = list_checkpoints(dir.path()).unwrap();
        assert_eq!(ids, vec!["20240301_1200", "20240201_0800", "20240101_0000"]);
    }
}
