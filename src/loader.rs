use std::path::{Path, PathBuf};

use image::{imageops, imageops::FilterType, DynamicImage, ImageFormat};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::{ClassifyError, Result};

/// One decoded image, keyed by its file name inside the image directory.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub filename: String,
    /// `(channels, height, width)`, values in `[0, 1]`.
    pub tensor: Array3<f32>,
}

/// A directory entry that was looked at but not loaded.
#[derive(Debug, Clone)]
pub struct SkippedEntry {
    pub path: PathBuf,
    pub reason: String,
}

/// Images loaded from one directory, in visiting order.
#[derive(Debug, Clone, Default)]
pub struct ImageBatch {
    images: Vec<LoadedImage>,
    skipped: Vec<SkippedEntry>,
}

impl ImageBatch {
    pub fn new(images: Vec<LoadedImage>) -> Self {
        Self {
            images,
            skipped: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn images(&self) -> &[LoadedImage] {
        &self.images
    }

    pub fn skipped(&self) -> &[SkippedEntry] {
        &self.skipped
    }

    pub fn filenames(&self) -> impl Iterator<Item = &str> {
        self.images.iter().map(|image| image.filename.as_str())
    }

    /// Stacks the batch into an `(N, C, H, W)` tensor, multiplying every pixel
    /// by `scale`.
    pub fn to_tensor(&self, scale: f32) -> Result<Array4<f32>> {
        if self.images.is_empty() {
            return Err(ClassifyError::inference(
                "batch assembly",
                "cannot build a tensor from an empty batch",
            ));
        }

        let views: Vec<_> = self.images.iter().map(|image| image.tensor.view()).collect();
        let mut tensor = ndarray::stack(Axis(0), &views)?;
        tensor.mapv_inplace(|v| v * scale);
        Ok(tensor)
    }
}

/// Loads every decodable image directly inside `dir`.
///
/// Entries are visited in file-name order and symlinks are followed. Anything
/// that is not a regular file with an image extension is ignored, and files that fail to decode are
/// recorded in [`ImageBatch::skipped`] without stopping the scan.
pub fn load_images(dir: &Path, color: bool, width: u32, height: u32) -> Result<ImageBatch> {
    if !dir.is_dir() {
        return Err(ClassifyError::FileSystem {
            path: dir.to_path_buf(),
            operation: "image directory lookup".to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "image directory does not exist",
            ),
        });
    }

    let mut batch = ImageBatch::default();
    let mut candidates = Vec::new();

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().unwrap_or(dir).to_path_buf();
                warn!("Skipping unreadable entry {}: {}", path.display(), e);
                batch.skipped.push(SkippedEntry {
                    path,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        if !entry.file_type().is_file() {
            debug!("Ignoring non-file entry {}", entry.path().display());
            continue;
        }
        if ImageFormat::from_path(entry.path()).is_err() {
            debug!("Ignoring non-image file {}", entry.path().display());
            continue;
        }
        candidates.push(entry.into_path());
    }

    let progress_bar = ProgressBar::new(candidates.len() as u64);
    progress_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-"),
    );

    for path in candidates {
        progress_bar.inc(1);

        // non-UTF-8 names cannot be result keys without risking collisions
        let Some(filename) = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
        else {
            progress_bar.suspend(|| {
                warn!("Skipping {}: file name is not UTF-8", path.display())
            });
            batch.skipped.push(SkippedEntry {
                path,
                reason: "file name is not valid UTF-8".to_string(),
            });
            continue;
        };

        match decode_image(&path, color, width, height) {
            Ok(tensor) => {
                progress_bar.suspend(|| {
                    debug!("Loaded {} as {:?}", filename, tensor.shape())
                });
                batch.images.push(LoadedImage { filename, tensor });
            }
            Err(e) => {
                progress_bar.suspend(|| warn!("Skipping {}: {}", path.display(), e));
                batch.skipped.push(SkippedEntry {
                    reason: e.to_string(),
                    path,
                });
            }
        }
    }
    progress_bar.finish_and_clear();

    if batch.is_empty() {
        return Err(ClassifyError::NoImages {
            dir: dir.to_path_buf(),
        });
    }

    info!(
        "Loaded {} image(s) from {} ({} skipped)",
        batch.len(),
        dir.display(),
        batch.skipped.len()
    );
    Ok(batch)
}

/// Decodes one file into a `(channels, height, width)` tensor in `[0, 1]`.
pub fn decode_image(path: &Path, color: bool, width: u32, height: u32) -> Result<Array3<f32>> {
    let image = image::open(path).map_err(|source| ClassifyError::ImageLoad {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(image_to_tensor(&image, color, width, height))
}

fn image_to_tensor(image: &DynamicImage, color: bool, width: u32, height: u32) -> Array3<f32> {
    if color {
        let resized = imageops::resize(&image.to_rgb32f(), width, height, FilterType::Triangle);
        resized.as_ndarray3().to_owned()
    } else {
        let resized = imageops::resize(&image.to_luma32f(), width, height, FilterType::Triangle);
        resized.as_ndarray3().to_owned()
    }
}
