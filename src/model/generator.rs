//! Generator network
//!
//! Translates a landmark sketch into a frame of the embedded identity. The
//! identity enters only through AdaIN parameters projected from `e_hat`.

use tch::{nn, Kind, Tensor};

use super::blocks::{
    AdainParams, AdaptiveResidualBlock, AdaptiveResidualBlockUp, InstanceNorm2d,
    ResidualBlockDown, SelfAttention,
};
use super::NetworkConfig;
use crate::utils::image::normalize;

/// One AdaIN-conditioned layer: its name, input and output channels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdainLayer {
    pub name: &'static str,
    pub in_channels: i64,
    pub out_channels: i64,
}

impl AdainLayer {
    /// Number of `psi` values the layer consumes
    pub fn psi_len(&self) -> i64 {
        2 * self.in_channels + 2 * self.out_channels
    }
}

/// AdaIN layers in the order they consume `psi`
pub fn adain_layers(config: &NetworkConfig) -> Vec<AdainLayer> {
    let [c1, c2, c3, c4] = config.channels();
    let layer = |name, in_channels, out_channels| AdainLayer {
        name,
        in_channels,
        out_channels,
    };

    vec![
        layer("res1", c4, c4),
        layer("res2", c4, c4),
        layer("res3", c4, c4),
        layer("res4", c4, c4),
        layer("res5", c4, c4),
        layer("deconv6", c4, c4),
        layer("deconv5", c4, c4),
        layer("deconv4", c4, c3),
        layer("deconv3", c3, c2),
        layer("deconv2", c2, c1),
        layer("deconv1", c1, 3),
    ]
}

/// Generator network
///
/// Architecture:
/// 1. Encoder: down-sampling residual blocks with instance norm and self-attention
/// 2. Five AdaIN residual blocks
/// 3. Decoder: AdaIN up-sampling residual blocks with instance norm and self-attention
/// 4. Sigmoid, then ImageNet normalisation so outputs share the dataset's space
#[derive(Debug)]
pub struct Generator {
    config: NetworkConfig,
    layers: Vec<AdainLayer>,
    /// Slices of psi per AdaIN layer as (start, end)
    psi_slices: Vec<(i64, i64)>,
    /// Projection matrix P of shape (psi_len, embedding_length)
    projection: Tensor,

    conv1: ResidualBlockDown,
    in1_e: InstanceNorm2d,
    conv2: ResidualBlockDown,
    in2_e: InstanceNorm2d,
    conv3: ResidualBlockDown,
    in3_e: InstanceNorm2d,
    att1: SelfAttention,
    conv4: ResidualBlockDown,
    in4_e: InstanceNorm2d,
    conv5: ResidualBlockDown,
    in5_e: InstanceNorm2d,
    conv6: ResidualBlockDown,
    in6_e: InstanceNorm2d,

    res: Vec<AdaptiveResidualBlock>,

    deconv6: AdaptiveResidualBlockUp,
    in6_d: InstanceNorm2d,
    deconv5: AdaptiveResidualBlockUp,
    in5_d: InstanceNorm2d,
    deconv4: AdaptiveResidualBlockUp,
    in4_d: InstanceNorm2d,
    deconv3: AdaptiveResidualBlockUp,
    in3_d: InstanceNorm2d,
    att2: SelfAttention,
    deconv2: AdaptiveResidualBlockUp,
    in2_d: InstanceNorm2d,
    deconv1: AdaptiveResidualBlockUp,
    in1_d: InstanceNorm2d,
}

impl Generator {
    /// Create a new Generator network
    pub fn new(vs: &nn::Path, config: NetworkConfig) -> Self {
        let [c1, c2, c3, c4] = config.channels();
        let layers = adain_layers(&config);

        let mut psi_slices = Vec::with_capacity(layers.len());
        let mut start = 0;
        for layer in &layers {
            let end = start + layer.psi_len();
            psi_slices.push((start, end));
            start = end;
        }
        let psi_len = start;

        let projection = vs.var(
            "projection",
            &[psi_len, config.embedding_length()],
            nn::Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        );

        let res = (1..=5)
            .map(|i| AdaptiveResidualBlock::new(&(vs / format!("res{}", i)), c4))
            .collect();

        Self {
            projection,

            conv1: ResidualBlockDown::new(&(vs / "conv1"), 3, c1),
            in1_e: InstanceNorm2d::new(&(vs / "in1_e"), c1),
            conv2: ResidualBlockDown::new(&(vs / "conv2"), c1, c2),
            in2_e: InstanceNorm2d::new(&(vs / "in2_e"), c2),
            conv3: ResidualBlockDown::new(&(vs / "conv3"), c2, c3),
            in3_e: InstanceNorm2d::new(&(vs / "in3_e"), c3),
            att1: SelfAttention::new(&(vs / "att1"), c3),
            conv4: ResidualBlockDown::new(&(vs / "conv4"), c3, c4),
            in4_e: InstanceNorm2d::new(&(vs / "in4_e"), c4),
            conv5: ResidualBlockDown::new(&(vs / "conv5"), c4, c4),
            in5_e: InstanceNorm2d::new(&(vs / "in5_e"), c4),
            conv6: ResidualBlockDown::new(&(vs / "conv6"), c4, c4),
            in6_e: InstanceNorm2d::new(&(vs / "in6_e"), c4),

            res,

            deconv6: AdaptiveResidualBlockUp::new(&(vs / "deconv6"), c4, c4, 2),
            in6_d: InstanceNorm2d::new(&(vs / "in6_d"), c4),
            deconv5: AdaptiveResidualBlockUp::new(&(vs / "deconv5"), c4, c4, 2),
            in5_d: InstanceNorm2d::new(&(vs / "in5_d"), c4),
            deconv4: AdaptiveResidualBlockUp::new(&(vs / "deconv4"), c4, c3, 2),
            in4_d: InstanceNorm2d::new(&(vs / "in4_d"), c3),
            deconv3: AdaptiveResidualBlockUp::new(&(vs / "deconv3"), c3, c2, 2),
            in3_d: InstanceNorm2d::new(&(vs / "in3_d"), c2),
            att2: SelfAttention::new(&(vs / "att2"), c2),
            deconv2: AdaptiveResidualBlockUp::new(&(vs / "deconv2"), c2, c1, 2),
            in2_d: InstanceNorm2d::new(&(vs / "in2_d"), c1),
            deconv1: AdaptiveResidualBlockUp::new(&(vs / "deconv1"), c1, 3, 2),
            in1_d: InstanceNorm2d::new(&(vs / "in1_d"), 3),

            config,
            layers,
            psi_slices,
        }
    }

    /// Total length of the AdaIN parameter vector
    pub fn psi_len(&self) -> i64 {
        self.psi_slices.last().map(|&(_, end)| end).unwrap_or(0)
    }

    /// Projection matrix `P` of shape (psi_len, embedding_length)
    pub fn projection_weight(&self) -> &Tensor {
        &self.projection
    }

    /// Project embeddings `e` of shape (batch, embedding_length, 1) to psi (batch, psi_len)
    pub fn project(&self, e: &Tensor) -> Tensor {
        let batch = e.size()[0];
        self.projection
            .unsqueeze(0)
            .expand([batch, -1, -1], false)
            .bmm(e)
            .squeeze_dim(2)
    }

    /// AdaIN parameters of the layer at `index` in [`adain_layers`] order
    fn slice_psi(&self, psi: &Tensor, index: usize) -> AdainParams {
        let (start, end) = self.psi_slices[index];
        let len1 = self.layers[index].in_channels;
        let len2 = self.layers[index].out_channels;
        let aux = psi.narrow(1, start, end - start).unsqueeze(-1);

        AdainParams {
            mean1: aux.narrow(1, 0, len1),
            std1: aux.narrow(1, len1, len1),
            mean2: aux.narrow(1, 2 * len1, len2),
            std2: aux.narrow(1, 2 * len1 + len2, len2),
        }
    }

    /// Synthesize frames
    ///
    /// # Arguments
    ///
    /// * `y` - Landmark sketches of shape (batch, 3, size, size)
    /// * `e` - Embeddings of shape (batch, embedding_length, 1)
    /// * `train` - Whether in training mode (affects spectral norm updates)
    ///
    /// # Returns
    ///
    /// Normalised frames with the same shape as `y`
    pub fn forward_t(&self, y: &Tensor, e: &Tensor, train: bool) -> Tensor {
        let psi = self.project(e);

        // Encode
        let out = self.in1_e.forward(&self.conv1.forward_t(y, train));
        let out = self.in2_e.forward(&self.conv2.forward_t(&out, train));
        let out = self.in3_e.forward(&self.conv3.forward_t(&out, train));
        let out = self.att1.forward(&out);
        let out = self.in4_e.forward(&self.conv4.forward_t(&out, train));
        let out = self.in5_e.forward(&self.conv5.forward_t(&out, train));
        let mut out = self.in6_e.forward(&self.conv6.forward_t(&out, train));

        // Residual layers
        for (i, block) in self.res.iter().enumerate() {
            out = block.forward_t(&out, &self.slice_psi(&psi, i), train);
        }

        // Decode
        let out = self.in6_d.forward(&self.deconv6.forward_t(&out, &self.slice_psi(&psi, 5), train));
        let out = self.in5_d.forward(&self.deconv5.forward_t(&out, &self.slice_psi(&psi, 6), train));
        let out = self.in4_d.forward(&self.deconv4.forward_t(&out, &self.slice_psi(&psi, 7), train));
        let out = self.in3_d.forward(&self.deconv3.forward_t(&out, &self.slice_psi(&psi, 8), train));
        let out = self.att2.forward(&out);
        let out = self.in2_d.forward(&self.deconv2.forward_t(&out, &self.slice_psi(&psi, 9), train));
        let out = self.in1_d.forward(&self.deconv1.forward_t(&out, &self.slice_psi(&psi, 10), train));

        // Sizes that are not multiples of 64 lose pixels to flooring on the way down
        let (h, w) = (y.size()[2], y.size()[3]);
        let out_size = out.size();
        let out = if out_size[2] != h || out_size[3] != w {
            out.upsample_bilinear2d([h, w], false, None::<f64>, None::<f64>)
        } else {
            out
        };

        normalize(&out.sigmoid())
    }

    /// Get configuration
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }
}
