//! Projection discriminator
//!
//! Scores how realistic a frame is given its landmark sketch and the index of
//! the training video it claims to come from.

use tch::{nn, Tensor};

use super::blocks::{ResidualBlock, ResidualBlockDown, SelfAttention};
use super::NetworkConfig;
use crate::error::{Error, Result};

/// Discriminator network
///
/// Architecture:
/// 1. Frame and sketch concatenated into 6 channels
/// 2. Down-sampling residual blocks with self-attention, then a plain residual block
/// 3. Global max pooling and ReLU to a feature vector v
/// 4. Realism score r = v . (W[:, i] + w_0) + b
#[derive(Debug)]
pub struct Discriminator {
    config: NetworkConfig,
    num_videos: i64,
    conv1: ResidualBlockDown,
    conv2: ResidualBlockDown,
    conv3: ResidualBlockDown,
    att: SelfAttention,
    conv4: ResidualBlockDown,
    conv5: ResidualBlockDown,
    conv6: ResidualBlockDown,
    res_block: ResidualBlock,
    /// Per-video projection columns, shape (embedding_length, num_videos)
    pub w: Tensor,
    /// Shared projection, shape (embedding_length, 1)
    pub w_0: Tensor,
    /// Bias, shape (1)
    pub b: Tensor,
}

impl Discriminator {
    /// Create a new Discriminator for a training set of `num_videos` videos
    pub fn new(vs: &nn::Path, config: NetworkConfig, num_videos: i64) -> Self {
        let [c1, c2, c3, c4] = config.channels();
        let init = nn::Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        };

        Self {
            conv1: ResidualBlockDown::new(&(vs / "conv1"), 6, c1),
            conv2: ResidualBlockDown::new(&(vs / "conv2"), c1, c2),
            conv3: ResidualBlockDown::new(&(vs / "conv3"), c2, c3),
            att: SelfAttention::new(&(vs / "att"), c3),
            conv4: ResidualBlockDown::new(&(vs / "conv4"), c3, c4),
            conv5: ResidualBlockDown::new(&(vs / "conv5"), c4, c4),
            conv6: ResidualBlockDown::new(&(vs / "conv6"), c4, c4),
            res_block: ResidualBlock::new(&(vs / "res_block"), c4),
            w: vs.var("W", &[c4, num_videos], init),
            w_0: vs.var("w_0", &[c4, 1], init),
            b: vs.var("b", &[1], init),
            num_videos,
            config,
        }
    }

    /// Number of videos the discriminator holds a column for
    pub fn num_videos(&self) -> i64 {
        self.num_videos
    }

    /// Fail when `video` has no column in `W`
    pub fn check_index(&self, video: i64) -> Result<()> {
        if video < 0 || video >= self.num_videos {
            return Err(Error::Dataset(format!(
                "video index {} out of range for a discriminator trained on {} videos",
                video, self.num_videos
            )));
        }
        Ok(())
    }

    /// Column `W[:, video]` of shape (embedding_length)
    pub fn w_column(&self, video: i64) -> Tensor {
        self.w.select(1, video)
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Frames of shape (batch, 3, size, size)
    /// * `y` - Landmark sketches of the same shape
    /// * `video` - Index of the training video, must pass [`Self::check_index`]
    ///
    /// # Returns
    ///
    /// Scores of shape (batch) and the activations of all eight stages for feature matching
    pub fn forward_t(&self, x: &Tensor, y: &Tensor, video: i64, train: bool) -> (Tensor, Vec<Tensor>) {
        let out = Tensor::cat(&[x, y], 1);
        let out_0 = self.conv1.forward_t(&out, train);
        let out_1 = self.conv2.forward_t(&out_0, train);
        let out_2 = self.conv3.forward_t(&out_1, train);
        let out_3 = self.att.forward(&out_2);
        let out_4 = self.conv4.forward_t(&out_3, train);
        let out_5 = self.conv5.forward_t(&out_4, train);
        let out_6 = self.conv6.forward_t(&out_5, train);
        let out_7 = self.res_block.forward_t(&out_6, train);

        let v = out_7.amax([2, 3], false).relu();
        let w_i = self.w.narrow(1, video, 1) + &self.w_0;
        let score = v.matmul(&w_i) + &self.b;
        let score = score.view([x.size()[0]]);

        (
            score,
            vec![out_0, out_1, out_2, out_3, out_4, out_5, out_6, out_7],
        )
    }

    /// Get configuration
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }
}
