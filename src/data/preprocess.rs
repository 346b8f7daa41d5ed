//! Raw dataset preprocessing
//!
//! The raw dataset holds one folder per video id, each containing only video
//! files. Every folder becomes one `<id>.vid` file with `K + 1` frames, their
//! landmarks and landmark sketches.

use indicatif::{ProgressBar, ProgressStyle};
use rand::Rng;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use super::dataset::{save_video, FrameRecord};
use super::landmarks::LandmarkDetector;
use super::render::plot_landmarks;
use super::video::{contains_only_videos, extract_frames};
use crate::error::{Error, Result};

/// A raw folder holding the videos of one id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFolder {
    pub id: String,
    pub path: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Options of a preprocessing run
#[derive(Debug, Clone)]
pub struct PreprocessOptions {
    /// Raw dataset root
    pub source: PathBuf,
    /// Directory the `.vid` files are written to
    pub output: PathBuf,
    /// Maximum number of folders to process, 0 for all
    pub size: usize,
    /// Reprocess ids that already have an output file
    pub overwrite: bool,
    /// Pick frames at random instead of evenly spaced
    pub random_frames: bool,
    /// Frames stored per video
    pub frames_per_video: usize,
    /// Landmark sketch line width in pixels
    pub line_width: u32,
    /// Extension of processed files
    pub extension: String,
}

/// Outcome of a preprocessing run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreprocessReport {
    pub processed: usize,
    pub failed: usize,
}

fn collect_processed_ids(dir: &Path, extension: &str, ids: &mut HashSet<String>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_processed_ids(&path, extension, ids)?;
        } else if let Some(id) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(extension))
        {
            ids.insert(id.to_string());
        }
    }
    Ok(())
}

fn collect_folders(dir: &Path, folders: &mut Vec<VideoFolder>) -> Result<()> {
    let mut files = Vec::new();
    let mut subdirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            subdirs.push(path);
        } else {
            files.push(path);
        }
    }
    files.sort();
    subdirs.sort();

    if !files.is_empty() {
        if !subdirs.is_empty() {
            return Err(Error::Dataset(format!(
                "{} contains both videos and subdirectories",
                dir.display()
            )));
        }
        if !contains_only_videos(&files) {
            return Err(Error::Dataset(format!(
                "{} contains files that are not videos",
                dir.display()
            )));
        }
        let id = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Dataset(format!("{} has no usable name", dir.display())))?
            .to_string();
        folders.push(VideoFolder {
            id,
            path: dir.to_path_buf(),
            files,
        });
        return Ok(());
    }

    for sub in subdirs {
        collect_folders(&sub, folders)?;
    }
    Ok(())
}

/// Folders under `source` that still need processing
///
/// Ids with an existing `<id><extension>` anywhere under `output` are skipped
/// unless `overwrite`. A non-zero `size` caps the list.
pub fn get_video_list(
    source: impl AsRef<Path>,
    size: usize,
    output: impl AsRef<Path>,
    extension: &str,
    overwrite: bool,
) -> Result<Vec<VideoFolder>> {
    let source = source.as_ref();
    if !source.is_dir() {
        return Err(Error::Dataset(format!(
            "source directory {} does not exist",
            source.display()
        )));
    }

    let mut processed = HashSet::new();
    if !overwrite {
        collect_processed_ids(output.as_ref(), extension, &mut processed)?;
    }

    let mut folders = Vec::new();
    collect_folders(source, &mut folders)?;
    let total = folders.len();
    folders.retain(|f| !processed.contains(&f.id));
    let skipped = total - folders.len();
    if size > 0 {
        folders.truncate(size);
    }

    tracing::info!(
        "{} video folders found, {} already processed, {} selected",
        total,
        skipped,
        folders.len()
    );
    Ok(folders)
}

/// Indices of `count` frames out of `n_frames`, ascending
pub fn select_frames<R: Rng>(n_frames: usize, count: usize, random: bool, rng: &mut R) -> Result<Vec<usize>> {
    if n_frames < count {
        return Err(Error::Video(format!(
            "video has {} frames, {} required",
            n_frames, count
        )));
    }

    let mut indices: Vec<usize> = if random {
        rand::seq::index::sample(rng, n_frames, count).into_vec()
    } else {
        (0..count).map(|i| i * n_frames / count).collect()
    };
    indices.sort_unstable();
    Ok(indices)
}

/// Turn one raw folder into `<output>/<id><extension>`
pub fn process_video_folder<R: Rng>(
    folder: &VideoFolder,
    options: &PreprocessOptions,
    detector: &dyn LandmarkDetector,
    rng: &mut R,
) -> Result<PathBuf> {
    let mut frames = Vec::new();
    for file in &folder.files {
        frames.extend(extract_frames(file)?);
    }

    let selected = select_frames(
        frames.len(),
        options.frames_per_video,
        options.random_frames,
        rng,
    )?;

    let mut records = Vec::with_capacity(selected.len());
    for idx in selected {
        let frame = std::mem::take(&mut frames[idx]);
        let landmarks = detector.detect(&frame)?.ok_or_else(|| {
            Error::Landmarks(format!("no face found in frame {} of {}", idx, folder.id))
        })?;
        let sketch = plot_landmarks(frame.width(), frame.height(), &landmarks, options.line_width);
        records.push(FrameRecord {
            frame,
            sketch,
            landmarks,
        });
    }

    std::fs::create_dir_all(&options.output)?;
    let path = options
        .output
        .join(format!("{}{}", folder.id, options.extension));
    save_video(&path, &records)?;
    Ok(path)
}

/// Process every pending folder of the raw dataset
///
/// A failing folder is logged and counted, and the run continues.
pub fn preprocess_dataset(
    options: &PreprocessOptions,
    detector: &dyn LandmarkDetector,
) -> Result<PreprocessReport> {
    tracing::info!("===== DATASET PRE-PROCESSING =====");
    tracing::info!(
        "Source: {}, output: {}",
        options.source.display(),
        options.output.display()
    );

    let folders = get_video_list(
        &options.source,
        options.size,
        &options.output,
        &options.extension,
        options.overwrite,
    )?;

    let pb = ProgressBar::new(folders.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .expect("static progress template")
            .progress_chars("##-"),
    );

    let mut rng = rand::thread_rng();
    let mut report = PreprocessReport::default();
    for folder in &folders {
        pb.set_message(folder.id.clone());
        match process_video_folder(folder, options, detector, &mut rng) {
            Ok(path) => {
                report.processed += 1;
                tracing::debug!("Saved {}", path.display());
            }
            Err(e) if e.is_per_video() => {
                report.failed += 1;
                tracing::warn!("Skipping {}: {}", folder.id, e);
            }
            Err(e) => {
                report.failed += 1;
                tracing::error!("Failed to process {}: {}", folder.id, e);
            }
        }
        pb.inc(1);
    }
    pb.finish_with_message("done");

    tracing::info!(
        "Pre-processing finished: {} processed, {} failed",
        report.processed,
        report.failed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_get_video_list_skips_processed() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("raw");
        let output = dir.path().join("out");
        touch(&source.join("id001/a.mp4"));
        touch(&source.join("id001/b.mp4"));
        touch(&source.join("group/id002/c.mp4"));
        touch(&source.join("id003/d.avi"));
        touch(&output.join("nested/id003.vid"));

        let folders = get_video_list(&source, 0, &output, ".vid", false).unwrap();
        let ids: Vec<_> = folders.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["id002", "id001"]);
        assert_eq!(folders[1].files.len(), 2);

        let all = get_video_list(&source, 0, &output, ".vid", true).unwrap();
        assert_eq!(all.len(), 3);

        let capped = get_video_list(&source, 1, &output, ".vid", true).unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn test_get_video_list_rejects_mixed_folders() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("raw/id001/a.mp4"));
        touch(&dir.path().join("raw/id001/readme.txt"));
        assert!(get_video_list(dir.path().join("raw"), 0, dir.path().join("out"), ".vid", false).is_err());

        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("raw/id001/a.mp4"));
        touch(&dir.path().join("raw/id001/extra/b.mp4"));
        assert!(get_video_list(dir.path().join("raw"), 0, dir.path().join("out"), ".vid", false).is_err());
    }

    struct NoFace;

    impl LandmarkDetector for NoFace {
        fn detect(&self, _frame: &image::RgbImage) -> Result<Option<crate::data::Landmarks>> {
            Ok(None)
        }
    }

    #[test]
    fn test_unreadable_videos_are_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("raw/id001/a.mp4"));
        touch(&dir.path().join("raw/id002/b.mp4"));

        let options = PreprocessOptions {
            source: dir.path().join("raw"),
            output: dir.path().join("out"),
            size: 0,
            overwrite: false,
            random_frames: true,
            frames_per_video: 3,
            line_width: 2,
            extension: ".vid".to_string(),
        };
        let report = preprocess_dataset(&options, &NoFace).unwrap();
        assert_eq!(report, PreprocessReport { processed: 0, failed: 2 });
    }

    #[test]
    fn test_select_frames_even() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(select_frames(10, 5, false, &mut rng).unwrap(), vec![0, 2, 4, 6, 8]);
        assert_eq!(select_frames(3, 3, false, &mut rng).unwrap(), vec![0, 1, 2]);
        assert!(select_frames(2, 3, false, &mut rng).is_err());
    }

    #[test]
    fn test_select_frames_random() {
        let mut rng = StdRng::seed_from_u64(42);
        let picked = select_frames(100, 33, true, &mut rng).unwrap();

        assert_eq!(picked.len(), 33);
        assert!(picked.windows(2).all(|w| w[0] < w[1]));
        assert!(picked.iter().all(|&i| i < 100));
    }
}
