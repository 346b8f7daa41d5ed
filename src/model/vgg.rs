//! Frozen VGG feature extractors for the perceptual loss

use std::path::Path;
use tch::{nn, nn::Module, nn::VarStore, Device, Tensor};

use crate::error::{Error, Result};

/// Which VGG trunk to build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VggKind {
    /// ImageNet VGG19
    Vgg19,
    /// VGG-Face, a VGG16 trunk trained on faces
    VggFace,
}

/// A stage of the convolutional trunk
#[derive(Debug, Clone, Copy)]
enum Stage {
    Conv(i64),
    Pool,
}

impl VggKind {
    fn stages(&self) -> Vec<Stage> {
        let blocks: &[(i64, usize)] = match self {
            VggKind::Vgg19 => &[(64, 2), (128, 2), (256, 4), (512, 4), (512, 4)],
            VggKind::VggFace => &[(64, 2), (128, 2), (256, 3), (512, 3), (512, 3)],
        };
        let mut stages = Vec::new();
        for &(channels, repeats) in blocks {
            stages.extend(std::iter::repeat(Stage::Conv(channels)).take(repeats));
            stages.push(Stage::Pool);
        }
        stages
    }

    /// `features.N` indices of the ReLU activations used by the loss
    pub fn taps(&self) -> &'static [i64] {
        match self {
            VggKind::Vgg19 => &[1, 6, 11, 20, 29],
            VggKind::VggFace => &[1, 6, 11, 18, 25],
        }
    }
}

/// Frozen VGG trunk returning ReLU activations at fixed layers
///
/// Parameters follow torchvision naming (`features.0.weight`, ...) so a
/// converted state dict loads directly.
pub struct VggFeatures {
    kind: VggKind,
    layers: Vec<(i64, Option<nn::Conv2D>)>,
    vs: VarStore,
}

impl std::fmt::Debug for VggFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VggFeatures")
            .field("kind", &self.kind)
            .field("layers", &self.layers.len())
            .finish()
    }
}

impl VggFeatures {
    /// Build with randomly initialised, frozen weights
    pub fn new(kind: VggKind, device: Device) -> Self {
        let mut vs = VarStore::new(device);
        let conv_config = nn::ConvConfig {
            padding: 1,
            ..Default::default()
        };

        let mut layers = Vec::new();
        let mut in_channels = 3;
        let mut idx = 0;
        let features = vs.root() / "features";
        for stage in kind.stages() {
            match stage {
                Stage::Conv(out_channels) => {
                    let conv = nn::conv2d(&features / idx, in_channels, out_channels, 3, conv_config);
                    layers.push((idx, Some(conv)));
                    // ReLU occupies the next index
                    idx += 2;
                    in_channels = out_channels;
                }
                Stage::Pool => {
                    layers.push((idx, None));
                    idx += 1;
                }
            }
        }
        drop(features);

        vs.freeze();
        Self { kind, layers, vs }
    }

    /// Build and load pretrained weights
    pub fn load(kind: VggKind, path: impl AsRef<Path>, device: Device) -> Result<Self> {
        let path = path.as_ref();
        let mut vgg = Self::new(kind, device);
        vgg.vs.load(path).map_err(|e| {
            Error::Checkpoint(format!("cannot load {:?} weights from {}: {}", kind, path.display(), e))
        })?;
        vgg.vs.freeze();
        tracing::info!("Loaded {:?} weights from {}", kind, path.display());
        Ok(vgg)
    }

    pub fn kind(&self) -> VggKind {
        self.kind
    }

    /// Activations at [`VggKind::taps`], shallowest first
    ///
    /// Stops after the deepest tap.
    pub fn forward(&self, xs: &Tensor) -> Vec<Tensor> {
        let taps = self.kind.taps();
        let last = taps.last().copied().unwrap_or(0);
        let mut out = Vec::with_capacity(taps.len());
        let mut xs = xs.shallow_clone();

        for (idx, layer) in &self.layers {
            match layer {
                Some(conv) => {
                    xs = conv.forward(&xs).relu();
                    if taps.contains(&(idx + 1)) {
                        out.push(xs.shallow_clone());
                    }
                    if idx + 1 >= last {
                        break;
                    }
                }
                None => xs = xs.max_pool2d_default(2),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    #[test]
    fn test_vgg19_taps() {
        let vgg = VggFeatures::new(VggKind::Vgg19, Device::Cpu);
        let x = Tensor::randn([1, 3, 32, 32], (Kind::Float, Device::Cpu));
        let acts = vgg.forward(&x);

        assert_eq!(acts.len(), 5);
        assert_eq!(acts[0].size(), vec![1, 64, 32, 32]);
        assert_eq!(acts[1].size(), vec![1, 128, 16, 16]);
        assert_eq!(acts[2].size(), vec![1, 256, 8, 8]);
        assert_eq!(acts[3].size(), vec![1, 512, 4, 4]);
        assert_eq!(acts[4].size(), vec![1, 512, 2, 2]);
    }

    #[test]
    fn test_vgg_face_taps() {
        let vgg = VggFeatures::new(VggKind::VggFace, Device::Cpu);
        let x = Tensor::randn([1, 3, 32, 32], (Kind::Float, Device::Cpu));
        let acts = vgg.forward(&x);

        assert_eq!(acts.len(), 5);
        assert_eq!(acts[4].size(), vec![1, 512, 2, 2]);
    }

    #[test]
    fn test_torchvision_names_and_frozen() {
        let vgg = VggFeatures::new(VggKind::Vgg19, Device::Cpu);
        let vars = vgg.vs.variables();

        assert!(vars.contains_key("features.0.weight"));
        assert!(vars.contains_key("features.34.bias"));
        assert_eq!(vars.len(), 32);
        assert!(vgg.vs.trainable_variables().iter().all(|t| !t.requires_grad()));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(VggFeatures::load(VggKind::VggFace, "/nonexistent/vgg.pt", Device::Cpu).is_err());
    }
}
