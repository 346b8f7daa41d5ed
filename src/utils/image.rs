//! Conversions between `image` buffers and tensors, and sample export
//!
//! Network inputs live in ImageNet-normalised space; these helpers move
//! between that space, `[0, 1]` floats and `u8` RGB pixels.

use image::RgbImage;
use std::path::Path;
use tch::{Device, Kind, Tensor};

use crate::error::{Error, Result};

/// ImageNet channel means
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Per-channel constants shaped `[1, 3, 1, 1]` for broadcasting over NCHW batches
pub fn channel_tensor(values: [f32; 3], device: Device) -> Tensor {
    Tensor::from_slice(&values).view([1, 3, 1, 1]).to_device(device)
}

/// Map `[0, 1]` images to ImageNet-normalised space
pub fn normalize(x: &Tensor) -> Tensor {
    let device = x.device();
    (x - channel_tensor(IMAGENET_MEAN, device)) / channel_tensor(IMAGENET_STD, device)
}

/// Inverse of [`normalize`]
pub fn denormalize(x: &Tensor) -> Tensor {
    let device = x.device();
    x * channel_tensor(IMAGENET_STD, device) + channel_tensor(IMAGENET_MEAN, device)
}

/// `u8` tensor of shape `[H, W, 3]` holding the image pixels
pub fn rgb_to_tensor(img: &RgbImage) -> Tensor {
    let (w, h) = img.dimensions();
    Tensor::from_slice(img.as_raw().as_slice()).view([h as i64, w as i64, 3])
}

/// Build an image from a `u8` tensor of shape `[H, W, 3]`
pub fn tensor_to_rgb(t: &Tensor) -> Result<RgbImage> {
    let (h, w, c) = t.size3()?;
    if c != 3 || t.kind() != Kind::Uint8 {
        return Err(Error::Dataset(format!(
            "expected a u8 [H, W, 3] tensor, got {:?} {:?}",
            t.kind(),
            t.size()
        )));
    }
    let pixels = Vec::<u8>::try_from(&t.to_device(Device::Cpu).flatten(0, -1))?;
    RgbImage::from_raw(w as u32, h as u32, pixels)
        .ok_or_else(|| Error::Dataset(format!("pixel buffer does not match {}x{}", w, h)))
}

/// Write a normalised `[1, 3, H, W]` or `[3, H, W]` tensor as an 8-bit image
pub fn save_image(path: impl AsRef<Path>, data: &Tensor) -> Result<()> {
    let data = data.detach().to_device(Device::Cpu).to_kind(Kind::Float);
    let data = match data.dim() {
        3 => data.unsqueeze(0),
        4 => data.narrow(0, 0, 1),
        _ => {
            return Err(Error::Dataset(format!(
                "cannot save tensor of shape {:?} as an image",
                data.size()
            )))
        }
    };

    let pixels = (denormalize(&data).squeeze_dim(0) * 255.0)
        .clamp(0.0, 255.0)
        .to_kind(Kind::Uint8)
        .permute([1, 2, 0])
        .contiguous();

    tensor_to_rgb(&pixels)?.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_rgb_tensor_roundtrip() {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(3, 1, Rgb([10, 20, 30]));

        let t = rgb_to_tensor(&img);
        assert_eq!(t.size(), vec![2, 4, 3]);
        assert_eq!(t.int64_value(&[1, 3, 2]), 30);

        let back = tensor_to_rgb(&t).unwrap();
        assert_eq!(back, img);
    }

    #[test]
    fn test_normalize_inverts() {
        let x = Tensor::rand([2, 3, 5, 5], (Kind::Float, Device::Cpu));
        let diff = (denormalize(&normalize(&x)) - &x).abs().max().double_value(&[]);
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_rejects_float_tensor() {
        let t = Tensor::zeros([2, 2, 3], (Kind::Float, Device::Cpu));
        assert!(tensor_to_rgb(&t).is_err());
    }

    #[test]
    fn test_save_image_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.png");

        // Normalised zeros are the ImageNet mean colour
        let data = Tensor::zeros([1, 3, 8, 6], (Kind::Float, Device::Cpu));
        save_image(&path, &data).unwrap();

        let loaded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(loaded.dimensions(), (6, 8));
        assert_eq!(loaded.get_pixel(0, 0), &Rgb([123, 116, 103]));
    }
}
