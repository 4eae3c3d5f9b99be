//! Photo metadata extraction.
//!
//! Field-level EXIF/IPTC parsing lives behind [`MetadataParser`]; the default
//! parser reads only the image header for dimensions.

use std::path::Path;

use anyhow::{Context, Result};
use image::ImageReader;
use tracing::trace;

use crate::models::PhotoMetadata;

/// Parses metadata for a photo file. Called on exif worker threads.
pub trait MetadataParser: Send + Sync {
    /// `mtime` is the file modification time, used when the file carries no
    /// capture time.
    fn parse(&self, path: &Path, mtime: i64) -> Result<PhotoMetadata>;
}

/// Reads dimensions from the image header without decoding pixels.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderMetadataParser;

impl MetadataParser for HeaderMetadataParser {
    fn parse(&self, path: &Path, mtime: i64) -> Result<PhotoMetadata> {
        trace!(?path, "Reading image header");

        let (width, height) = ImageReader::open(path)
            .with_context(|| format!("Failed to open image: {:?}", path))?
            .with_guessed_format()
            .with_context(|| format!("Failed to guess image format: {:?}", path))?
            .into_dimensions()
            .with_context(|| format!("Failed to read dimensions: {:?}", path))?;

        Ok(PhotoMetadata {
            width,
            height,
            orientation: 1,
            taken_at: mtime,
            camera: None,
            is_fallback: false,
        })
    }
}
