//! Processed video files and the meta-training dataset
//!
//! A processed video stores, for every selected frame, the frame itself, its
//! landmark sketch and the detected points as named tensors.

use image::{imageops, imageops::FilterType, RgbImage};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tch::{Kind, Tensor};

use super::landmarks::Landmarks;
use crate::error::{Error, Result};
use crate::utils::image::{rgb_to_tensor, tensor_to_rgb, IMAGENET_MEAN, IMAGENET_STD};

/// One selected frame of a processed video
#[derive(Debug, Clone)]
pub struct FrameRecord {
    pub frame: RgbImage,
    pub sketch: RgbImage,
    pub landmarks: Landmarks,
}

fn tensor_name(kind: &str, index: usize) -> String {
    format!("{}_{:03}", kind, index)
}

/// Write frames to a `.vid` file
pub fn save_video(path: impl AsRef<Path>, records: &[FrameRecord]) -> Result<()> {
    let mut named = Vec::with_capacity(records.len() * 3);
    for (j, record) in records.iter().enumerate() {
        named.push((tensor_name("frame", j), rgb_to_tensor(&record.frame)));
        named.push((tensor_name("sketch", j), rgb_to_tensor(&record.sketch)));
        named.push((tensor_name("points", j), record.landmarks.to_tensor()));
    }
    Tensor::save_multi(&named, path)?;
    Ok(())
}

/// Read the frames of a `.vid` file in stored order
pub fn load_video(path: impl AsRef<Path>) -> Result<Vec<FrameRecord>> {
    let path = path.as_ref();
    let mut tensors: HashMap<String, Tensor> = Tensor::load_multi(path)?.into_iter().collect();
    let count = tensors.keys().filter(|k| k.starts_with("frame_")).count();

    let mut take = |name: String| {
        tensors.remove(&name).ok_or_else(|| {
            Error::Dataset(format!("{} is missing tensor {}", path.display(), name))
        })
    };

    let mut records = Vec::with_capacity(count);
    for j in 0..count {
        let frame = tensor_to_rgb(&take(tensor_name("frame", j))?)?;
        let sketch = tensor_to_rgb(&take(tensor_name("sketch", j))?)?;
        let points = take(tensor_name("points", j))?.to_kind(Kind::Float).contiguous().view([-1]);
        let landmarks = Landmarks::from_flat(&Vec::<f32>::try_from(&points)?)?;

        if frame.dimensions() != sketch.dimensions() {
            return Err(Error::Dataset(format!(
                "{}: frame {} and its sketch differ in size",
                path.display(),
                j
            )));
        }
        records.push(FrameRecord {
            frame,
            sketch,
            landmarks,
        });
    }
    Ok(records)
}

/// Resize the shorter side, center crop and normalise
#[derive(Debug, Clone)]
pub struct Transform {
    pub image_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Transform {
    /// ImageNet statistics at `image_size`
    pub fn new(image_size: u32) -> Self {
        Self {
            image_size,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }

    /// `[1, 3, S, S]` float tensor
    pub fn apply(&self, img: &RgbImage) -> Tensor {
        let size = self.image_size;
        let (w, h) = img.dimensions();
        let (new_w, new_h) = if w <= h {
            (size, ((size as u64 * h as u64) / w as u64) as u32)
        } else {
            (((size as u64 * w as u64) / h as u64) as u32, size)
        };

        let resized = if (new_w, new_h) == (w, h) {
            img.clone()
        } else {
            imageops::resize(img, new_w, new_h, FilterType::Triangle)
        };

        let left = ((new_w - size) as f64 / 2.0).round() as u32;
        let top = ((new_h - size) as f64 / 2.0).round() as u32;
        let cropped = imageops::crop_imm(&resized, left, top, size, size).to_image();

        let mean = Tensor::from_slice(&self.mean).view([1, 3, 1, 1]);
        let std = Tensor::from_slice(&self.std).view([1, 3, 1, 1]);
        let x = rgb_to_tensor(&cropped)
            .permute([2, 0, 1])
            .unsqueeze(0)
            .to_kind(Kind::Float)
            / 255.0;
        (x - mean) / std
    }
}

/// A transformed frame and its landmark sketch
#[derive(Debug)]
pub struct Sample {
    /// `[1, 3, S, S]`
    pub frame: Tensor,
    /// `[1, 3, S, S]`
    pub landmarks: Tensor,
}

/// Processed videos under a root directory
#[derive(Debug)]
pub struct VoxCelebDataset {
    root: PathBuf,
    files: Vec<PathBuf>,
    indexes: Vec<usize>,
    shuffle_frames: bool,
    transform: Transform,
}

fn collect_files(dir: &Path, extension: &str, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, extension, files)?;
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(extension))
            .unwrap_or(false)
        {
            files.push(path);
        }
    }
    Ok(())
}

impl VoxCelebDataset {
    /// List every `extension` file under `root`
    ///
    /// Files are sorted so a video keeps its index (and discriminator column)
    /// across runs. `shuffle` only changes the visiting order.
    pub fn new(
        root: impl AsRef<Path>,
        extension: &str,
        shuffle: bool,
        shuffle_frames: bool,
        transform: Transform,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(Error::Dataset(format!(
                "dataset directory {} does not exist",
                root.display()
            )));
        }

        let mut files = Vec::new();
        collect_files(&root, extension, &mut files)?;
        files.sort();

        let mut indexes: Vec<usize> = (0..files.len()).collect();
        if shuffle {
            indexes.shuffle(&mut rand::thread_rng());
        }

        tracing::debug!("Found {} {} files in {}", files.len(), extension, root.display());
        Ok(Self {
            root,
            files,
            indexes,
            shuffle_frames,
            transform,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Path of the video with real index `index`
    pub fn path(&self, index: usize) -> Option<&Path> {
        self.files.get(index).map(PathBuf::as_path)
    }

    /// The `idx`-th item in visiting order
    ///
    /// Returns the video's real index together with its transformed frames.
    pub fn get(&self, idx: usize) -> Result<(usize, Vec<Sample>)> {
        let real = *self.indexes.get(idx).ok_or_else(|| {
            Error::Dataset(format!("index {} out of range for {} videos", idx, self.len()))
        })?;

        let mut records = load_video(&self.files[real])?;
        if self.shuffle_frames {
            records.shuffle(&mut rand::thread_rng());
        }

        let samples = records
            .iter()
            .map(|r| Sample {
                frame: self.transform.apply(&r.frame),
                landmarks: self.transform.apply(&r.sketch),
            })
            .collect();
        Ok((real, samples))
    }

    /// Items in visiting order
    pub fn iter(&self) -> impl Iterator<Item = Result<(usize, Vec<Sample>)>> + '_ {
        (0..self.len()).map(move |idx| self.get(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::landmarks::NUM_LANDMARKS;
    use image::Rgb;

    fn record(width: u32, height: u32, shade: u8) -> FrameRecord {
        FrameRecord {
            frame: RgbImage::from_pixel(width, height, Rgb([shade, 0, 0])),
            sketch: RgbImage::from_pixel(width, height, Rgb([255, 255, 255])),
            landmarks: Landmarks::new([[shade as f32, 1.0]; NUM_LANDMARKS]),
        }
    }

    #[test]
    fn test_video_roundtrip_with_mixed_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id00001.vid");

        save_video(&path, &[record(8, 6, 10), record(4, 4, 20), record(8, 6, 30)]).unwrap();
        let loaded = load_video(&path).unwrap();

        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[1].frame.dimensions(), (4, 4));
        assert_eq!(loaded[2].frame.get_pixel(0, 0), &Rgb([30, 0, 0]));
        assert_eq!(loaded[0].landmarks.points[0], [10.0, 1.0]);
    }

    #[test]
    fn test_transform_shape_and_normalisation() {
        let transform = Transform::new(16);
        let img = RgbImage::from_pixel(40, 20, Rgb([255, 255, 255]));
        let x = transform.apply(&img);

        assert_eq!(x.size(), vec![1, 3, 16, 16]);
        let red = x.double_value(&[0, 0, 8, 8]);
        assert!((red - (1.0 - 0.485) / 0.229).abs() < 1e-4);
    }

    #[test]
    fn test_transform_center_crops() {
        let mut img = RgbImage::from_pixel(30, 10, Rgb([0, 0, 0]));
        for y in 0..10 {
            for x in 10..20 {
                img.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let x = Transform::new(10).apply(&img);
        // Only the white middle third survives the crop
        assert!(x.min().double_value(&[]) > 1.5);
    }

    #[test]
    fn test_dataset_listing_and_items() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        save_video(dir.path().join("b.vid"), &[record(8, 8, 1), record(8, 8, 2)]).unwrap();
        save_video(dir.path().join("nested/a.vid"), &[record(8, 8, 3)]).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let dataset = VoxCelebDataset::new(dir.path(), ".vid", false, true, Transform::new(8)).unwrap();
        assert_eq!(dataset.len(), 2);
        assert!(dataset.path(0).unwrap().ends_with("b.vid"));

        let (i, samples) = dataset.get(0).unwrap();
        assert_eq!(i, 0);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].frame.size(), vec![1, 3, 8, 8]);

        let items: Vec<_> = dataset.iter().collect::<Result<_>>().unwrap();
        assert_eq!(items.len(), 2);
        assert!(dataset.get(2).is_err());
    }

    #[test]
    fn test_shuffle_keeps_real_indexes() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c", "d"] {
            save_video(dir.path().join(format!("{}.vid", name)), &[record(4, 4, 0)]).unwrap();
        }
        let dataset = VoxCelebDataset::new(dir.path(), ".vid", true, false, Transform::new(4)).unwrap();

        let mut seen: Vec<usize> = dataset.iter().map(|item| item.unwrap().0).collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_missing_root() {
        assert!(VoxCelebDataset::new("/nonexistent/dataset", ".vid", false, false, Transform::new(8)).is_err());
    }
}
