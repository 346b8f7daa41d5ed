//! Embedder network
//!
//! Maps a frame and its landmark sketch to an identity embedding. Embeddings of
//! the K frames of a video are averaged into `e_hat`.

use tch::{nn, Tensor};

use super::blocks::{ResidualBlockDown, SelfAttention};
use super::NetworkConfig;

/// Embedder network
///
/// Architecture:
/// 1. Frame and sketch concatenated into 6 channels
/// 2. Three down-sampling residual blocks, self-attention, three more blocks
/// 3. Global max pooling and ReLU
#[derive(Debug)]
pub struct Embedder {
    config: NetworkConfig,
    conv1: ResidualBlockDown,
    conv2: ResidualBlockDown,
    conv3: ResidualBlockDown,
    att: SelfAttention,
    conv4: ResidualBlockDown,
    conv5: ResidualBlockDown,
    conv6: ResidualBlockDown,
}

impl Embedder {
    /// Create a new Embedder network
    pub fn new(vs: &nn::Path, config: NetworkConfig) -> Self {
        let [c1, c2, c3, c4] = config.channels();

        Self {
            conv1: ResidualBlockDown::new(&(vs / "conv1"), 6, c1),
            conv2: ResidualBlockDown::new(&(vs / "conv2"), c1, c2),
            conv3: ResidualBlockDown::new(&(vs / "conv3"), c2, c3),
            att: SelfAttention::new(&(vs / "att"), c3),
            conv4: ResidualBlockDown::new(&(vs / "conv4"), c3, c4),
            conv5: ResidualBlockDown::new(&(vs / "conv5"), c4, c4),
            conv6: ResidualBlockDown::new(&(vs / "conv6"), c4, c4),
            config,
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Frames of shape (batch, 3, size, size)
    /// * `y` - Landmark sketches of the same shape
    ///
    /// # Returns
    ///
    /// Embeddings of shape (batch, embedding_length, 1)
    pub fn forward_t(&self, x: &Tensor, y: &Tensor, train: bool) -> Tensor {
        debug_assert_eq!(x.size(), y.size(), "frame and sketch shapes differ");

        let out = Tensor::cat(&[x, y], 1);
        let out = self.conv1.forward_t(&out, train);
        let out = self.conv2.forward_t(&out, train);
        let out = self.conv3.forward_t(&out, train);
        let out = self.att.forward(&out);
        let out = self.conv4.forward_t(&out, train);
        let out = self.conv5.forward_t(&out, train);
        let out = self.conv6.forward_t(&out, train);

        out.amax([2, 3], false)
            .relu()
            .view([-1, self.config.embedding_length(), 1])
    }

    /// Average embedding of a batch of K frames of the same video
    ///
    /// Returns `e_hat` of shape (1, embedding_length, 1).
    pub fn embed_average(&self, x: &Tensor, y: &Tensor, train: bool) -> Tensor {
        self.forward_t(x, y, train).mean_dim(Some([0i64].as_slice()), true, tch::Kind::Float)
    }

    /// Get configuration
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::VarStore, Device, Kind};

    #[test]
    fn test_embedder_output_shape() {
        let vs = VarStore::new(Device::Cpu);
        let embedder = Embedder::new(&vs.root(), NetworkConfig::tiny());

        let x = Tensor::randn([3, 3, 64, 64], (Kind::Float, Device::Cpu));
        let y = Tensor::randn([3, 3, 64, 64], (Kind::Float, Device::Cpu));
        let e = embedder.forward_t(&x, &y, true);

        assert_eq!(e.size(), vec![3, 16, 1]);
        // ReLU after pooling
        assert!(e.min().double_value(&[]) >= 0.0);
    }

    #[test]
    fn test_embed_average_matches_mean() {
        let vs = VarStore::new(Device::Cpu);
        let embedder = Embedder::new(&vs.root(), NetworkConfig::tiny());

        let x = Tensor::randn([4, 3, 64, 64], (Kind::Float, Device::Cpu));
        let y = Tensor::randn([4, 3, 64, 64], (Kind::Float, Device::Cpu));

        let e_hat = embedder.embed_average(&x, &y, false);
        let manual = embedder
            .forward_t(&x, &y, false)
            .sum_dim_intlist([0i64].as_slice(), true, Kind::Float)
            / 4.0;

        assert_eq!(e_hat.size(), vec![1, 16, 1]);
        assert!(e_hat.allclose(&manual, 1e-5, 1e-6, false));
    }
}
