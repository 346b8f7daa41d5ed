//! Loss functions for meta-training
//!
//! `LossEG` combines a perceptual content term, the adversarial term with
//! discriminator feature matching, and the embedding match term. `LossD` is
//! the hinge loss.

use tch::{Device, Kind, Tensor};

use crate::error::Result;
use crate::model::{VggFeatures, VggKind};
use crate::utils::image::{channel_tensor, denormalize};

/// Per-channel means VGG-Face was trained with, on a 0-255 scale
pub const VGG_FACE_MEAN: [f32; 3] = [129.186_28, 104.762_38, 93.593_96];

/// Weights of the `LossEG` terms
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossWeights {
    pub vgg19: f64,
    pub vgg_face: f64,
    pub mch: f64,
    pub fm: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            vgg19: 1e-2,
            vgg_face: 2e-3,
            mch: 8e1,
            fm: 1e1,
        }
    }
}

/// Mean absolute error
fn l1(a: &Tensor, b: &Tensor) -> Tensor {
    (a - b).abs().mean(Kind::Float)
}

/// Sum of L1 distances between paired activations
fn l1_sum(a: &[Tensor], b: &[Tensor]) -> Tensor {
    a.iter()
        .zip(b)
        .map(|(x, y)| l1(x, y))
        .fold(Tensor::zeros([], (Kind::Float, Device::Cpu)), |acc, t| {
            let device = t.device();
            t + acc.to_device(device)
        })
}

/// The individual `LossEG` terms
#[derive(Debug)]
pub struct LossEGParts {
    pub content: Tensor,
    pub adversarial: Tensor,
    pub matching: Tensor,
    pub total: Tensor,
}

/// Embedder/generator loss
#[derive(Debug)]
pub struct LossEG {
    vgg19: VggFeatures,
    vgg_face: VggFeatures,
    weights: LossWeights,
    feed_forward: bool,
}

impl LossEG {
    /// Create from prepared feature extractors
    ///
    /// In `feed_forward` mode the embedding match term is left out.
    pub fn new(vgg19: VggFeatures, vgg_face: VggFeatures, weights: LossWeights, feed_forward: bool) -> Self {
        Self {
            vgg19,
            vgg_face,
            weights,
            feed_forward,
        }
    }

    /// Load pretrained VGG19 and VGG-Face weights
    pub fn load(
        vgg19_path: &str,
        vgg_face_path: &str,
        weights: LossWeights,
        feed_forward: bool,
        device: Device,
    ) -> Result<Self> {
        let vgg19 = VggFeatures::load(VggKind::Vgg19, vgg19_path, device)?;
        let vgg_face = VggFeatures::load(VggKind::VggFace, vgg_face_path, device)?;
        Ok(Self::new(vgg19, vgg_face, weights, feed_forward))
    }

    pub fn weights(&self) -> &LossWeights {
        &self.weights
    }

    pub fn feed_forward(&self) -> bool {
        self.feed_forward
    }

    /// VGG-Face input: 0-255 RGB with the face dataset mean removed
    fn vgg_face_input(x: &Tensor) -> Tensor {
        denormalize(x) * 255.0 - channel_tensor(VGG_FACE_MEAN, x.device())
    }

    /// Perceptual distance between real and generated frames
    pub fn content(&self, x: &Tensor, x_hat: &Tensor) -> Tensor {
        let vgg19_x = self.vgg19.forward(x);
        let vgg19_x_hat = self.vgg19.forward(x_hat);
        let loss_vgg19 = l1_sum(&vgg19_x_hat, &vgg19_x);

        let face_x = self.vgg_face.forward(&Self::vgg_face_input(x));
        let face_x_hat = self.vgg_face.forward(&Self::vgg_face_input(x_hat));
        let loss_vgg_face = l1_sum(&face_x_hat, &face_x);

        loss_vgg19 * self.weights.vgg19 + loss_vgg_face * self.weights.vgg_face
    }

    /// Realism of the generated frame plus discriminator feature matching
    pub fn adversarial(&self, r_x_hat: &Tensor, d_act: &[Tensor], d_act_hat: &[Tensor]) -> Tensor {
        let loss_fm = l1_sum(d_act, d_act_hat);
        -r_x_hat.mean(Kind::Float) + loss_fm * self.weights.fm
    }

    /// Distance between the discriminator column of the video and `e_hat`
    pub fn matching(&self, e_hat: &Tensor, w_i: &Tensor) -> Tensor {
        l1(&w_i.reshape([-1]), &e_hat.reshape([-1])) * self.weights.mch
    }

    /// All terms of the loss
    ///
    /// # Arguments
    ///
    /// * `x` - Real frame
    /// * `x_hat` - Generated frame
    /// * `r_x_hat` - Discriminator score of `x_hat`
    /// * `e_hat` - Averaged embedding
    /// * `w_i` - Discriminator column of the video
    /// * `d_act` / `d_act_hat` - Discriminator activations on `x` and `x_hat`
    #[allow(clippy::too_many_arguments)]
    pub fn forward_parts(
        &self,
        x: &Tensor,
        x_hat: &Tensor,
        r_x_hat: &Tensor,
        e_hat: &Tensor,
        w_i: &Tensor,
        d_act: &[Tensor],
        d_act_hat: &[Tensor],
    ) -> LossEGParts {
        let content = self.content(x, x_hat);
        let adversarial = self.adversarial(r_x_hat, d_act, d_act_hat);
        let matching = if self.feed_forward {
            Tensor::zeros([], (Kind::Float, x.device()))
        } else {
            self.matching(e_hat, w_i)
        };
        let total = &content + &adversarial + &matching;

        LossEGParts {
            content,
            adversarial,
            matching,
            total,
        }
    }

    /// Total loss as a scalar tensor
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        x: &Tensor,
        x_hat: &Tensor,
        r_x_hat: &Tensor,
        e_hat: &Tensor,
        w_i: &Tensor,
        d_act: &[Tensor],
        d_act_hat: &[Tensor],
    ) -> Tensor {
        self.forward_parts(x, x_hat, r_x_hat, e_hat, w_i, d_act, d_act_hat)
            .total
    }
}

/// Discriminator hinge loss
#[derive(Debug, Default, Clone, Copy)]
pub struct LossD;

impl LossD {
    pub fn new() -> Self {
        Self
    }

    /// `mean(relu(1 + r_x_hat) + relu(1 - r_x))`
    pub fn forward(&self, r_x: &Tensor, r_x_hat: &Tensor) -> Tensor {
        ((r_x_hat + 1.0).relu() + (1.0f64 - r_x).relu()).mean(Kind::Float)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn loss_eg(feed_forward: bool) -> LossEG {
        LossEG::new(
            VggFeatures::new(VggKind::Vgg19, Device::Cpu),
            VggFeatures::new(VggKind::VggFace, Device::Cpu),
            LossWeights::default(),
            feed_forward,
        )
    }

    fn randn(shape: &[i64]) -> Tensor {
        Tensor::randn(shape, (Kind::Float, Device::Cpu))
    }

    #[test]
    fn test_loss_d_hinge() {
        let loss = LossD::new();

        // Confident and correct scores give zero loss
        let r_x = Tensor::from_slice(&[2.0f32]);
        let r_x_hat = Tensor::from_slice(&[-3.0f32]);
        assert_relative_eq!(loss.forward(&r_x, &r_x_hat).double_value(&[]), 0.0);

        let r_x = Tensor::from_slice(&[0.5f32]);
        let r_x_hat = Tensor::from_slice(&[0.25f32]);
        assert_relative_eq!(loss.forward(&r_x, &r_x_hat).double_value(&[]), 1.75, epsilon = 1e-6);
    }

    #[test]
    fn test_content_is_zero_for_identical_frames() {
        let loss = loss_eg(true);
        let x = randn(&[1, 3, 32, 32]);
        assert_relative_eq!(loss.content(&x, &x).double_value(&[]), 0.0);
    }

    #[test]
    fn test_adversarial_term() {
        let loss = loss_eg(true);
        let r_x_hat = Tensor::from_slice(&[0.5f32]);
        let act = vec![randn(&[1, 2, 4, 4]), randn(&[1, 4, 2, 2])];

        // Identical activations leave only -r_x_hat
        let value = loss.adversarial(&r_x_hat, &act, &act).double_value(&[]);
        assert_relative_eq!(value, -0.5, epsilon = 1e-6);

        let shifted: Vec<_> = act.iter().map(|a| a + 1.0).collect();
        let value = loss.adversarial(&r_x_hat, &act, &shifted).double_value(&[]);
        assert_relative_eq!(value, -0.5 + 2.0 * 10.0, epsilon = 1e-4);
    }

    #[test]
    fn test_matching_term_and_feed_forward() {
        let e_hat = Tensor::ones([1, 8, 1], (Kind::Float, Device::Cpu));
        let w_i = Tensor::zeros([8], (Kind::Float, Device::Cpu));
        let x = randn(&[1, 3, 32, 32]);
        let r = Tensor::from_slice(&[0.0f32]);
        let act = vec![randn(&[1, 2, 4, 4])];

        let with_match = loss_eg(false).forward_parts(&x, &x, &r, &e_hat, &w_i, &act, &act);
        assert_relative_eq!(with_match.matching.double_value(&[]), 80.0, epsilon = 1e-4);
        assert_relative_eq!(with_match.total.double_value(&[]), 80.0, epsilon = 1e-3);

        let without = loss_eg(true).forward_parts(&x, &x, &r, &e_hat, &w_i, &act, &act);
        assert_relative_eq!(without.matching.double_value(&[]), 0.0);
        assert_eq!(without.total.size(), Vec::<i64>::new());
    }

    #[test]
    fn test_loss_flows_to_generated_frame() {
        let loss = loss_eg(true);
        let x = randn(&[1, 3, 32, 32]);
        let x_hat = randn(&[1, 3, 32, 32]).set_requires_grad(true);
        let r = x_hat.mean(Kind::Float).view([1]);
        let act = vec![x.shallow_clone()];
        let act_hat = vec![x_hat.shallow_clone()];
        let e_hat = Tensor::zeros([1, 8, 1], (Kind::Float, Device::Cpu));
        let w_i = Tensor::zeros([8], (Kind::Float, Device::Cpu));

        let total = loss.forward(&x, &x_hat, &r, &e_hat, &w_i, &act, &act_hat);
        total.backward();
        assert!(x_hat.grad().abs().sum(Kind::Float).double_value(&[]) > 0.0);
    }
}
