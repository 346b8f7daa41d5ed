//! Facial landmark detection
//!
//! Detectors return 68 points in frame pixel coordinates, or `None` when no
//! face is found.

use image::{imageops, imageops::FilterType, RgbImage};
use std::path::Path;
use tch::{CModule, Device, Kind, Tensor};

use crate::error::{Error, Result};
use crate::utils::image::rgb_to_tensor;

/// Number of points in the 68-point annotation scheme
pub const NUM_LANDMARKS: usize = 68;

/// 68 facial landmarks in pixel coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct Landmarks {
    pub points: [[f32; 2]; NUM_LANDMARKS],
}

impl Landmarks {
    pub fn new(points: [[f32; 2]; NUM_LANDMARKS]) -> Self {
        Self { points }
    }

    /// Build from a flat `[x0, y0, x1, y1, ...]` slice
    pub fn from_flat(values: &[f32]) -> Result<Self> {
        if values.len() != NUM_LANDMARKS * 2 {
            return Err(Error::Landmarks(format!(
                "expected {} coordinates, got {}",
                NUM_LANDMARKS * 2,
                values.len()
            )));
        }
        let mut points = [[0.0; 2]; NUM_LANDMARKS];
        for (point, xy) in points.iter_mut().zip(values.chunks_exact(2)) {
            *point = [xy[0], xy[1]];
        }
        Ok(Self { points })
    }

    /// `[68, 2]` float tensor
    pub fn to_tensor(&self) -> Tensor {
        let flat: Vec<f32> = self.points.iter().flatten().copied().collect();
        Tensor::from_slice(&flat).view([NUM_LANDMARKS as i64, 2])
    }

    /// `(min_x, min_y, max_x, max_y)` over all points
    pub fn bounding_box(&self) -> (f32, f32, f32, f32) {
        self.points.iter().fold(
            (f32::INFINITY, f32::INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
            |(x0, y0, x1, y1), &[x, y]| (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        )
    }
}

/// Finds facial landmarks in a frame
pub trait LandmarkDetector {
    /// Landmarks of the most prominent face, `None` if there is no face
    fn detect(&self, frame: &RgbImage) -> Result<Option<Landmarks>>;
}

/// Landmark detector backed by a TorchScript face alignment model
///
/// The model receives a `[1, 3, R, R]` float image in `[0, 1]` and returns
/// either coordinates (`[1, 68, 2]` or `[68, 2]`, in input pixels) or
/// heatmaps (`[1, 68, h, w]`).
pub struct TorchScriptDetector {
    module: CModule,
    device: Device,
    input_size: i64,
    min_confidence: f64,
}

impl TorchScriptDetector {
    /// Load the model from `path`
    pub fn new(path: impl AsRef<Path>, input_size: i64, device: Device) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Landmarks(format!(
                "landmark model {} not found",
                path.display()
            )));
        }
        let mut module = CModule::load_on_device(path, device)?;
        module.set_eval();
        tracing::info!("Loaded landmark model from {}", path.display());

        Ok(Self {
            module,
            device,
            input_size,
            min_confidence: 0.1,
        })
    }

    /// Heatmap peaks below this value count as no face
    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }
}

impl LandmarkDetector for TorchScriptDetector {
    fn detect(&self, frame: &RgbImage) -> Result<Option<Landmarks>> {
        let size = self.input_size as u32;
        let resized = imageops::resize(frame, size, size, FilterType::Triangle);
        let input = rgb_to_tensor(&resized)
            .permute([2, 0, 1])
            .unsqueeze(0)
            .to_kind(Kind::Float)
            .to_device(self.device)
            / 255.0;

        let output = tch::no_grad(|| self.module.forward_ts(&[input]))?;
        decode_output(
            &output,
            frame.width(),
            frame.height(),
            self.input_size,
            self.min_confidence,
        )
    }
}

/// Turn raw model output into landmarks in frame coordinates
fn decode_output(
    output: &Tensor,
    frame_width: u32,
    frame_height: u32,
    input_size: i64,
    min_confidence: f64,
) -> Result<Option<Landmarks>> {
    let output = output.to_device(Device::Cpu).to_kind(Kind::Float);
    let n = NUM_LANDMARKS as i64;
    let shape = output.size();

    let (coords, scale) = match shape.as_slice() {
        [1, points, 2] | [points, 2] if *points == n => {
            (output.view([n, 2]), input_size as f64)
        }
        [1, points, h, w] if *points == n => {
            let (h, w) = (*h, *w);
            let flat = output.view([n, h * w]);
            let (peaks, idx) = flat.max_dim(1, false);
            let min_peak = peaks.min().double_value(&[]);
            if min_peak < min_confidence {
                return Ok(None);
            }
            let col = idx.remainder(w);
            let row = (&idx - &col).to_kind(Kind::Float) / w as f64;
            let xs = col.to_kind(Kind::Float) * (input_size as f64 / w as f64);
            let ys = row * (input_size as f64 / h as f64);
            (Tensor::stack(&[xs, ys], 1), input_size as f64)
        }
        _ => {
            return Err(Error::Landmarks(format!(
                "unexpected landmark model output shape {:?}",
                shape
            )))
        }
    };

    // NaN or infinite coordinates mean no face
    if coords.isfinite().all().int64_value(&[]) == 0 {
        return Ok(None);
    }

    let frame_scale = Tensor::from_slice(&[
        frame_width as f32 / scale as f32,
        frame_height as f32 / scale as f32,
    ]);
    let coords = (coords * frame_scale).contiguous().view([-1]);
    let values = Vec::<f32>::try_from(&coords)?;
    Landmarks::from_flat(&values).map(Some)
}
