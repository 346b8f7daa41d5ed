//! Building blocks shared by the embedder, generator and discriminator
//!
//! All convolutions are spectrally normalised. Residual blocks come in
//! down-sampling, plain, AdaIN-conditioned and AdaIN up-sampling flavours.

use tch::{nn, Kind, Tensor};

const ADAIN_EPS: f64 = 1e-5;
const NORM_EPS: f64 = 1e-12;

/// 2-D convolution with spectral normalisation of the weight
///
/// The largest singular value of the weight (viewed as `[out, in * k * k]`) is
/// estimated with one power iteration per training forward pass. The left
/// singular vector estimate `u` is kept as a non-trainable variable so it is
/// saved alongside the weights.
#[derive(Debug)]
pub struct SpectralConv2d {
    weight: Tensor,
    bias: Tensor,
    u: Tensor,
    out_channels: i64,
    stride: i64,
    padding: i64,
}

impl SpectralConv2d {
    pub fn new(
        vs: &nn::Path,
        in_channels: i64,
        out_channels: i64,
        kernel_size: i64,
        stride: i64,
        padding: i64,
    ) -> Self {
        let weight = vs.var(
            "weight",
            &[out_channels, in_channels, kernel_size, kernel_size],
            nn::init::DEFAULT_KAIMING_UNIFORM,
        );
        let bias = vs.var("bias", &[out_channels], nn::Init::Const(0.0));

        let mut u = vs.zeros_no_train("u", &[out_channels]);
        tch::no_grad(|| {
            let init = l2_normalize(&Tensor::randn([out_channels], (Kind::Float, u.device())));
            u.copy_(&init);
        });

        Self {
            weight,
            bias,
            u,
            out_channels,
            stride,
            padding,
        }
    }

    /// Weight divided by its estimated spectral norm
    fn normalized_weight(&self, train: bool) -> Tensor {
        let w_mat = self.weight.view([self.out_channels, -1]);

        let (u, v) = tch::no_grad(|| {
            let v = l2_normalize(&w_mat.tr().mv(&self.u));
            let u = l2_normalize(&w_mat.mv(&v));
            (u, v)
        });

        if train {
            tch::no_grad(|| {
                self.u.shallow_clone().copy_(&u);
            });
        }

        let sigma = u.dot(&w_mat.mv(&v));
        &self.weight / sigma
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let weight = self.normalized_weight(train);
        xs.conv2d(
            &weight,
            Some(&self.bias),
            [self.stride, self.stride],
            [self.padding, self.padding],
            [1, 1],
            1,
        )
    }
}

fn l2_normalize(x: &Tensor) -> Tensor {
    x / (x.norm() + NORM_EPS)
}

/// 3x3 spectral convolution keeping spatial size
fn conv3x3(vs: &nn::Path, in_channels: i64, out_channels: i64) -> SpectralConv2d {
    SpectralConv2d::new(vs, in_channels, out_channels, 3, 1, 1)
}

/// 1x1 spectral convolution used on skip connections
fn conv1x1(vs: &nn::Path, in_channels: i64, out_channels: i64) -> SpectralConv2d {
    SpectralConv2d::new(vs, in_channels, out_channels, 1, 1, 0)
}

/// Adaptive instance normalisation
///
/// Normalises every channel of every sample to zero mean and unit (unbiased)
/// standard deviation, then rescales with `std` and shifts with `mean`, both of
/// shape `[B, C, 1]`.
pub fn adain(x: &Tensor, mean: &Tensor, std: &Tensor) -> Tensor {
    let size = x.size();
    let (b, c, h, w) = (size[0], size[1], size[2], size[3]);
    let feature = x.view([b, c, -1]);
    let std_feat = feature.std_dim(Some([2i64].as_slice()), true, true) + ADAIN_EPS;
    let mean_feat = feature.mean_dim(Some([2i64].as_slice()), true, Kind::Float);
    let out = std * (feature - mean_feat) / std_feat + mean;
    out.view([b, c, h, w])
}

/// Instance normalisation with learned affine parameters
#[derive(Debug)]
pub struct InstanceNorm2d {
    weight: Tensor,
    bias: Tensor,
}

impl InstanceNorm2d {
    pub fn new(vs: &nn::Path, channels: i64) -> Self {
        Self {
            weight: vs.var("weight", &[channels], nn::Init::Const(1.0)),
            bias: vs.var("bias", &[channels], nn::Init::Const(0.0)),
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Tensor {
        xs.instance_norm(
            Some(&self.weight),
            Some(&self.bias),
            None::<&Tensor>,
            None::<&Tensor>,
            true,
            0.1,
            ADAIN_EPS,
            false,
        )
    }
}

/// Residual block that halves the spatial resolution
#[derive(Debug)]
pub struct ResidualBlockDown {
    conv_r1: SpectralConv2d,
    conv_r2: SpectralConv2d,
    conv_l: SpectralConv2d,
}

impl ResidualBlockDown {
    pub fn new(vs: &nn::Path, in_channels: i64, out_channels: i64) -> Self {
        Self {
            conv_r1: conv3x3(&(vs / "conv_r1"), in_channels, out_channels),
            conv_r2: conv3x3(&(vs / "conv_r2"), out_channels, out_channels),
            conv_l: conv1x1(&(vs / "conv_l"), in_channels, out_channels),
        }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let out = xs.relu();
        let out = self.conv_r1.forward_t(&out, train).relu();
        let out = self.conv_r2.forward_t(&out, train).avg_pool2d_default(2);

        let residual = self.conv_l.forward_t(xs, train).avg_pool2d_default(2);
        out + residual
    }
}

/// Residual block with instance normalisation, resolution preserving
#[derive(Debug)]
pub struct ResidualBlock {
    conv1: SpectralConv2d,
    in1: InstanceNorm2d,
    conv2: SpectralConv2d,
    in2: InstanceNorm2d,
}

impl ResidualBlock {
    pub fn new(vs: &nn::Path, channels: i64) -> Self {
        Self {
            conv1: conv3x3(&(vs / "conv1"), channels, channels),
            in1: InstanceNorm2d::new(&(vs / "in1"), channels),
            conv2: conv3x3(&(vs / "conv2"), channels, channels),
            in2: InstanceNorm2d::new(&(vs / "in2"), channels),
        }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let out = self.in1.forward(&self.conv1.forward_t(xs, train)).relu();
        let out = self.in2.forward(&self.conv2.forward_t(&out, train));
        out + xs
    }
}

/// AdaIN parameters for one adaptive block, each of shape `[B, C, 1]`
#[derive(Debug)]
pub struct AdainParams {
    pub mean1: Tensor,
    pub std1: Tensor,
    pub mean2: Tensor,
    pub std2: Tensor,
}

/// Resolution preserving residual block conditioned through AdaIN
#[derive(Debug)]
pub struct AdaptiveResidualBlock {
    conv1: SpectralConv2d,
    conv2: SpectralConv2d,
}

impl AdaptiveResidualBlock {
    pub fn new(vs: &nn::Path, channels: i64) -> Self {
        Self {
            conv1: conv3x3(&(vs / "conv1"), channels, channels),
            conv2: conv3x3(&(vs / "conv2"), channels, channels),
        }
    }

    pub fn forward_t(&self, xs: &Tensor, psi: &AdainParams, train: bool) -> Tensor {
        let out = self.conv1.forward_t(xs, train);
        let out = adain(&out, &psi.mean1, &psi.std1).relu();
        let out = self.conv2.forward_t(&out, train);
        let out = adain(&out, &psi.mean2, &psi.std2);
        out + xs
    }
}

/// Residual block that upsamples by `upsample` and is conditioned through AdaIN
#[derive(Debug)]
pub struct AdaptiveResidualBlockUp {
    conv_r1: SpectralConv2d,
    conv_r2: SpectralConv2d,
    conv_l: SpectralConv2d,
    upsample: i64,
}

impl AdaptiveResidualBlockUp {
    pub fn new(vs: &nn::Path, in_channels: i64, out_channels: i64, upsample: i64) -> Self {
        Self {
            conv_r1: conv3x3(&(vs / "conv_r1"), in_channels, out_channels),
            conv_r2: conv3x3(&(vs / "conv_r2"), out_channels, out_channels),
            conv_l: conv1x1(&(vs / "conv_l"), in_channels, out_channels),
            upsample,
        }
    }

    fn upsample(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        let (h, w) = (size[2], size[3]);
        xs.upsample_nearest2d(
            [h * self.upsample, w * self.upsample],
            None::<f64>,
            None::<f64>,
        )
    }

    pub fn forward_t(&self, xs: &Tensor, psi: &AdainParams, train: bool) -> Tensor {
        let out = adain(xs, &psi.mean1, &psi.std1).relu();
        let out = self.conv_r1.forward_t(&self.upsample(&out), train);
        let out = adain(&out, &psi.mean2, &psi.std2).relu();
        let out = self.conv_r2.forward_t(&out, train);

        let residual = self.conv_l.forward_t(&self.upsample(xs), train);
        out + residual
    }
}

/// Self-attention layer (SAGAN)
#[derive(Debug)]
pub struct SelfAttention {
    query_conv: nn::Conv2D,
    key_conv: nn::Conv2D,
    value_conv: nn::Conv2D,
    gamma: Tensor,
}

impl SelfAttention {
    pub fn new(vs: &nn::Path, channels: i64) -> Self {
        let inner = (channels / 8).max(1);
        Self {
            query_conv: nn::conv2d(vs / "query_conv", channels, inner, 1, Default::default()),
            key_conv: nn::conv2d(vs / "key_conv", channels, inner, 1, Default::default()),
            value_conv: nn::conv2d(vs / "value_conv", channels, channels, 1, Default::default()),
            gamma: vs.var("gamma", &[1], nn::Init::Randn { mean: 0.0, stdev: 0.02 }),
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        let (b, c, h, w) = (size[0], size[1], size[2], size[3]);

        let query = xs.apply(&self.query_conv).view([b, -1, h * w]).permute([0, 2, 1]);
        let key = xs.apply(&self.key_conv).view([b, -1, h * w]);
        let attention = query.bmm(&key).softmax(-1, Kind::Float);

        let value = xs.apply(&self.value_conv).view([b, -1, h * w]);
        let out = value.bmm(&attention.permute([0, 2, 1])).view([b, c, h, w]);

        &self.gamma * out + xs
    }
}
