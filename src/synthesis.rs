//! Few-shot synthesis from a processed video
//!
//! The first K frames define the identity; every frame's landmark sketch is
//! then rendered in that identity.

use std::path::{Path, PathBuf};
use tch::Tensor;

use crate::data::{load_video, Transform};
use crate::error::{Error, Result};
use crate::model::TalkingHeads;
use crate::utils::save_image;

/// Render every frame of `video` after embedding its first `k` frames
///
/// Writes `<stem>_<j>_x.png` (the real frame) and `<stem>_<j>_x_hat.png`
/// (the synthesized one) to `output` and returns the synthesized paths.
pub fn generate_from_video(
    model: &TalkingHeads,
    video: impl AsRef<Path>,
    k: usize,
    transform: &Transform,
    output: impl AsRef<Path>,
) -> Result<Vec<PathBuf>> {
    let video = video.as_ref();
    let output = output.as_ref();
    let records = load_video(video)?;
    if records.is_empty() || k == 0 {
        return Err(Error::Dataset(format!(
            "{} holds no frames to embed",
            video.display()
        )));
    }

    let stem = video
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("video")
        .to_string();

    let frames: Vec<Tensor> = records.iter().map(|r| transform.apply(&r.frame)).collect();
    let sketches: Vec<Tensor> = records.iter().map(|r| transform.apply(&r.sketch)).collect();

    let k = k.min(records.len());
    let device = model.device;
    let e_hat = tch::no_grad(|| {
        let x = Tensor::cat(&frames[..k], 0).to_device(device);
        let y = Tensor::cat(&sketches[..k], 0).to_device(device);
        model.embed(&x, &y, false)
    });
    tracing::info!("Embedded {} of {} frames from {}", k, records.len(), video.display());

    std::fs::create_dir_all(output)?;
    let mut written = Vec::with_capacity(records.len());
    for (j, (x, y)) in frames.iter().zip(&sketches).enumerate() {
        let x_hat = model.synthesize(&y.to_device(device), &e_hat);

        save_image(output.join(format!("{}_{:03}_x.png", stem, j)), x)?;
        let path = output.join(format!("{}_{:03}_x_hat.png", stem, j));
        save_image(&path, &x_hat)?;
        written.push(path);
    }

    tracing::info!("Wrote {} frames to {}", written.len(), output.display());
    Ok(written)
}
