//! Model module containing the talking heads architecture
//!
//! This module provides:
//! - Embedder mapping frames and landmarks to identity vectors
//! - Generator rendering landmarks in the identity of an embedding
//! - Projection discriminator with per-video columns
//! - Frozen VGG feature extractors for the perceptual loss
//! - TalkingHeads wrapper owning the variable stores

mod blocks;
mod discriminator;
mod embedder;
mod generator;
mod talking_heads;
mod vgg;

pub use blocks::{adain, AdainParams, SelfAttention, SpectralConv2d};
pub use discriminator::Discriminator;
pub use embedder::Embedder;
pub use generator::{adain_layers, AdainLayer, Generator};
pub use talking_heads::TalkingHeads;
pub use vgg::{VggFeatures, VggKind};

use serde::{Deserialize, Serialize};

/// Channel layout shared by all three networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Width of the first down-sampling block
    pub base_channels: i64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { base_channels: 64 }
    }
}

impl NetworkConfig {
    /// Narrow layout for tests and quick experiments
    pub fn tiny() -> Self {
        Self { base_channels: 2 }
    }

    /// Widths of the four channel stages
    pub fn channels(&self) -> [i64; 4] {
        let b = self.base_channels;
        [b, 2 * b, 4 * b, 8 * b]
    }

    /// Length of the identity embedding
    pub fn embedding_length(&self) -> i64 {
        8 * self.base_channels
    }
}

/// The three trainable networks, used to name checkpoint files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Embedder,
    Generator,
    Discriminator,
}

impl Network {
    /// All networks in checkpoint order
    pub const ALL: [Network; 3] = [Network::Embedder, Network::Generator, Network::Discriminator];

    /// File name stem
    pub fn name(&self) -> &'static str {
        match self {
            Network::Embedder => "Embedder",
            Network::Generator => "Generator",
            Network::Discriminator => "Discriminator",
        }
    }

    /// Variable store prefix the network's parameters live under
    pub fn prefix(&self) -> &'static str {
        match self {
            Network::Embedder => "embedder",
            Network::Generator => "generator",
            Network::Discriminator => "discriminator",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_layout() {
        let config = NetworkConfig::default();
        assert_eq!(config.channels(), [64, 128, 256, 512]);
        assert_eq!(config.embedding_length(), 512);
        assert_eq!(NetworkConfig::tiny().channels(), [2, 4, 8, 16]);
    }

    #[test]
    fn test_network_names() {
        let names: Vec<_> = Network::ALL.iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["Embedder", "Generator", "Discriminator"]);
        assert_eq!(Network::Generator.prefix(), "generator");
    }
}
