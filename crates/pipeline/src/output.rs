//! Upscaling and writing accepted images.
//!
//! Resizing and PNG encoding are CPU-bound, so the async entry points run
//! them on the blocking pool.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::imageops::FilterType;
use image::ImageFormat;
use storyframe_core::error::CoreError;
use storyframe_core::generation::RawImage;
use storyframe_core::types::SceneIndex;

use crate::error::PipelineError;

/// File name for a scene's final image.
pub fn scene_file_name(index: SceneIndex) -> String {
    format!("scene_{index:03}.png")
}

/// Resize to the output resolution (cropping to fill) if it differs.
pub fn fit_to_output(image: &RawImage, width: u32, height: u32) -> RawImage {
    if image.width() == width && image.height() == height {
        image.clone()
    } else {
        image.resize_to_fill(width, height, FilterType::Lanczos3)
    }
}

pub fn encode_png(image: &RawImage) -> Result<Vec<u8>, CoreError> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

/// Write `image` as `scene_{index}.png` under `dir`, resized to `width` x `height`.
pub fn save_scene_blocking(
    image: &RawImage,
    index: SceneIndex,
    dir: &Path,
    width: u32,
    height: u32,
) -> Result<PathBuf, CoreError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(scene_file_name(index));
    fit_to_output(image, width, height).save_with_format(&path, ImageFormat::Png)?;
    Ok(path)
}

/// Async wrapper around [`save_scene_blocking`].
pub async fn save_scene(
    image: Arc<RawImage>,
    index: SceneIndex,
    dir: PathBuf,
    width: u32,
    height: u32,
) -> Result<PathBuf, PipelineError> {
    tokio::task::spawn_blocking(move || save_scene_blocking(&image, index, &dir, width, height))
        .await
        .map_err(|e| PipelineError::Task(e.to_string()))?
        .map_err(PipelineError::from)
}

/// Async wrapper around [`encode_png`].
pub async fn encode_png_async(image: Arc<RawImage>) -> Result<Vec<u8>, PipelineError> {
    tokio::task::spawn_blocking(move || encode_png(&image))
        .await
        .map_err(|e| PipelineError::Task(e.to_string()))?
        .map_err(PipelineError::from)
}
