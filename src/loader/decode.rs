//! Image decoding using the image crate.
//!
//! Resized qualities are scaled so their longest side matches the target
//! size while preserving aspect ratio. Sources are never upscaled.

use std::io::Cursor;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::codecs::gif::GifDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, DynamicImage, GenericImageView, ImageFormat};
use tracing::trace;

use crate::config::DecodeBackend;
use crate::models::ImageQuality;

/// What a worker asks the decoder for.
#[derive(Debug, Clone, Copy)]
pub struct DecodeJob<'a> {
    pub path: &'a Path,
    pub quality: ImageQuality,
    /// Longest side in pixels, 0 for full resolution.
    pub target_size: u32,
    pub backend: DecodeBackend,
}

/// Turns a file into a bitmap. Called on pool worker threads.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, job: &DecodeJob<'_>) -> Result<DynamicImage>;
}

/// Decoder reading images from the filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileDecoder;

impl ImageDecoder for FileDecoder {
    fn decode(&self, job: &DecodeJob<'_>) -> Result<DynamicImage> {
        let img = open_image(job.path)?;
        if job.target_size == 0 {
            return Ok(img);
        }

        let (src_width, src_height) = img.dimensions();
        let (width, height) = fit_within(src_width, src_height, job.target_size);
        if (width, height) == (src_width, src_height) {
            return Ok(img);
        }

        trace!(
            path = ?job.path,
            quality = %job.quality,
            src_width,
            src_height,
            width,
            height,
            "Resizing decoded image"
        );
        let filter = match job.backend {
            DecodeBackend::Fast => FilterType::Triangle,
            DecodeBackend::Quality => FilterType::CatmullRom,
        };
        Ok(img.resize_exact(width, height, filter))
    }
}

/// Opens an image, taking the first frame of animated GIFs.
pub fn open_image(path: &Path) -> Result<DynamicImage> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read image: {:?}", path))?;
    let format = image::guess_format(&bytes).ok();

    if format == Some(ImageFormat::Gif) {
        let decoder = GifDecoder::new(Cursor::new(bytes))
            .with_context(|| format!("Failed to decode GIF: {:?}", path))?;
        let mut frames = decoder.into_frames();
        if let Some(frame) = frames.next() {
            let frame = frame.context("Failed to decode GIF frame")?;
            return Ok(DynamicImage::ImageRgba8(frame.into_buffer()));
        }
        return Err(anyhow!("GIF has no frames: {:?}", path));
    }

    match format {
        Some(fmt) => image::load_from_memory_with_format(&bytes, fmt)
            .with_context(|| format!("Failed to decode image: {:?}", path)),
        None => image::load_from_memory(&bytes)
            .with_context(|| format!("Failed to decode image: {:?}", path)),
    }
}

/// Scales (width, height) so the longest side is at most `target`.
pub fn fit_within(src_width: u32, src_height: u32, target: u32) -> (u32, u32) {
    if src_width == 0 || src_height == 0 {
        return (target.max(1), target.max(1));
    }

    let longest = src_width.max(src_height);
    if longest <= target {
        return (src_width, src_height);
    }

    let scale = target as f64 / longest as f64;
    let width = (src_width as f64 * scale).round() as u32;
    let height = (src_height as f64 * scale).round() as u32;
    (width.max(1), height.max(1))
}

/// Check if a file extension is one the decoder supports.
pub fn is_supported_extension(ext: &str) -> bool {
    matches!(
        ext.to_lowercase().as_str(),
        "jpg" | "jpeg" | "png" | "webp" | "gif" | "bmp" | "tiff" | "tif"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fit_within_landscape() {
        let (w, h) = fit_within(1920, 1080, 256);
        assert_eq!(w, 256);
        assert_eq!(h, 144);
    }

    #[test]
    fn test_fit_within_portrait() {
        let (w, h) = fit_within(1000, 4000, 400);
        assert_eq!(h, 400);
        assert_eq!(w, 100);
    }

    #[test]
    fn test_fit_within_never_upscales() {
        assert_eq!(fit_within(200, 100, 256), (200, 100));
    }

    #[test]
    fn test_fit_within_extreme_panorama() {
        let (w, h) = fit_within(100_000, 10, 256);
        assert_eq!(w, 256);
        assert_eq!(h, 1);
    }

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported_extension("JPG"));
        assert!(is_supported_extension("tif"));
        assert!(!is_supported_extension("txt"));
        assert!(!is_supported_extension("mp4"));
    }

    #[test]
    fn test_file_decoder_resizes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.png");
        DynamicImage::new_rgb8(400, 200).save(&path).unwrap();

        let job = DecodeJob {
            path: &path,
            quality: ImageQuality::Thumb,
            target_size: 100,
            backend: DecodeBackend::Fast,
        };
        let img = FileDecoder.decode(&job).unwrap();
        assert_eq!(img.dimensions(), (100, 50));

        let full = DecodeJob {
            target_size: 0,
            quality: ImageQuality::Original,
            ..job
        };
        assert_eq!(FileDecoder.decode(&full).unwrap().dimensions(), (400, 200));
    }

    #[test]
    fn test_file_decoder_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not a real jpeg file").unwrap();

        let job = DecodeJob {
            path: &path,
            quality: ImageQuality::Thumb,
            target_size: 100,
            backend: DecodeBackend::Quality,
        };
        assert!(FileDecoder.decode(&job).is_err());
    }
}
