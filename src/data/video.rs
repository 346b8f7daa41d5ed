//! Video decoding through the `ffprobe`/`ffmpeg` command line tools
//!
//! Frames are read as raw `rgb24` from ffmpeg's stdout.

use image::RgbImage;
use serde::Deserialize;
use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};

/// Extensions recognised as video files
pub const VIDEO_EXTENSIONS: [&str; 6] = ["mp4", "avi", "mov", "mkv", "webm", "m4v"];

/// Basic stream information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    /// Frame count reported by the container, 0 when unknown
    pub frame_count: usize,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    nb_frames: Option<String>,
}

/// Whether `name` has a video extension
pub fn is_video_file(name: impl AsRef<Path>) -> bool {
    name.as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Whether every entry of `files` is a video file
pub fn contains_only_videos<P: AsRef<Path>>(files: &[P]) -> bool {
    files.iter().all(is_video_file)
}

fn parse_probe(json: &str) -> Result<VideoInfo> {
    let probe: ProbeOutput = serde_json::from_str(json)?;
    let stream = probe
        .streams
        .into_iter()
        .find(|s| s.width.is_some() && s.height.is_some())
        .ok_or_else(|| Error::Video("no video stream found".to_string()))?;

    Ok(VideoInfo {
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        frame_count: stream
            .nb_frames
            .and_then(|n| n.parse().ok())
            .unwrap_or(0),
    })
}

/// Read the first video stream's dimensions with `ffprobe`
pub fn probe(path: impl AsRef<Path>) -> Result<VideoInfo> {
    let path = path.as_ref();
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,nb_frames",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .map_err(|e| Error::Video(format!("cannot run ffprobe: {}", e)))?;

    if !output.status.success() {
        return Err(Error::Video(format!(
            "ffprobe failed on {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let info = parse_probe(&String::from_utf8_lossy(&output.stdout))?;
    if info.width == 0 || info.height == 0 {
        return Err(Error::Video(format!("{} has an empty frame size", path.display())));
    }
    Ok(info)
}

/// Split a raw `rgb24` stream into frames
fn split_frames(raw: Vec<u8>, width: u32, height: u32) -> Result<Vec<RgbImage>> {
    let frame_len = (width * height * 3) as usize;
    if raw.len() % frame_len != 0 {
        return Err(Error::Video(format!(
            "truncated frame stream: {} bytes is not a multiple of {}",
            raw.len(),
            frame_len
        )));
    }

    raw.chunks_exact(frame_len)
        .map(|chunk| {
            RgbImage::from_raw(width, height, chunk.to_vec())
                .ok_or_else(|| Error::Video("frame buffer size mismatch".to_string()))
        })
        .collect()
}

/// Decode every frame of a video
pub fn extract_frames(path: impl AsRef<Path>) -> Result<Vec<RgbImage>> {
    let path = path.as_ref();
    let info = probe(path)?;

    let output = Command::new("ffmpeg")
        .args(["-v", "error", "-nostdin", "-i"])
        .arg(path)
        .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
        .output()
        .map_err(|e| Error::Video(format!("cannot run ffmpeg: {}", e)))?;

    if !output.status.success() {
        return Err(Error::Video(format!(
            "ffmpeg failed on {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let frames = split_frames(output.stdout, info.width, info.height)?;
    tracing::debug!(
        "Decoded {} frames ({}x{}) from {}",
        frames.len(),
        info.width,
        info.height,
        path.display()
    );
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file("id10001/abc.mp4"));
        assert!(is_video_file("clip.MKV"));
        assert!(!is_video_file("notes.txt"));
        assert!(!is_video_file("no_extension"));
    }

    #[test]
    fn test_contains_only_videos() {
        assert!(contains_only_videos(&["a.mp4", "b.avi"]));
        assert!(!contains_only_videos(&["a.mp4", "b.jpg"]));
        assert!(contains_only_videos::<&str>(&[]));
    }

    #[test]
    fn test_parse_probe() {
        let json = r#"{"streams": [{"width": 640, "height": 360, "nb_frames": "125"}]}"#;
        let info = parse_probe(json).unwrap();
        assert_eq!(
            info,
            VideoInfo {
                width: 640,
                height: 360,
                frame_count: 125
            }
        );

        let json = r#"{"streams": [{"width": 32, "height": 16}]}"#;
        assert_eq!(parse_probe(json).unwrap().frame_count, 0);

        assert!(parse_probe(r#"{"streams": []}"#).is_err());
    }

    #[test]
    fn test_split_frames() {
        let raw: Vec<u8> = (0..2 * 2 * 3 * 3).map(|v| v as u8).collect();
        let frames = split_frames(raw, 2, 2).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].get_pixel(0, 0).0, [12, 13, 14]);

        assert!(split_frames(vec![0; 13], 2, 2).is_err());
    }
}
