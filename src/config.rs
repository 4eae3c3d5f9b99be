//! Loader configuration.
//!
//! Values are read once when the [`LoadManager`](crate::pipeline::LoadManager)
//! is built. The manager exposes setters for the knobs that may change at
//! runtime; those only affect work scheduled afterwards.

use std::path::PathBuf;

use crate::cache::ThumbStore;
use crate::models::Stage;

/// Default number of resized (thumb/hq) images kept decoded in memory.
pub const DEFAULT_RESIZED_CACHE_CAPACITY: usize = 500;

/// Default number of original-resolution images kept decoded in memory.
pub const DEFAULT_ORIGINAL_CACHE_CAPACITY: usize = 4;

/// Default number of photo entities kept in the photo cache.
pub const DEFAULT_PHOTO_CACHE_CAPACITY: usize = 50_000;

/// Default thumbnail size (longest side) in pixels.
pub const DEFAULT_THUMB_SIZE: u32 = 256;

/// Default high-quality image size (longest side) in pixels.
pub const DEFAULT_HQ_IMAGE_SIZE: u32 = 2000;

/// Maximum number of workers in any one pool.
pub const MAX_WORKERS: usize = 16;

/// Resampling backend used when decoding resized images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeBackend {
    /// Triangle filter, noticeably faster on large sources.
    Fast,
    /// Catmull-Rom filter.
    #[default]
    Quality,
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Decoded thumb, thumb-hq and hq images kept in memory.
    pub resized_cache_capacity: usize,
    /// Decoded original-resolution images kept in memory.
    pub original_cache_capacity: usize,
    /// Photo entities kept in the photo cache.
    pub photo_cache_capacity: usize,
    /// Metadata parsing workers.
    pub exif_workers: usize,
    /// Thumbnail decoding workers.
    pub thumb_workers: usize,
    /// Workers for thumb-hq and hq decodes.
    pub hq_workers: usize,
    /// Original-resolution decoding workers.
    pub original_workers: usize,
    /// Tour association lookup workers.
    pub sql_workers: usize,
    /// Longest side of thumbnails in pixels.
    pub thumb_size: u32,
    /// Longest side of high-quality images in pixels.
    pub hq_image_size: u32,
    /// Resampling filter for resized decodes.
    pub backend: DecodeBackend,
    /// Directory of the thumbnail store, `None` disables it.
    pub thumb_store_dir: Option<PathBuf>,
}

impl LoaderConfig {
    /// Pool size configured for a stage.
    pub fn workers(&self, stage: Stage) -> usize {
        match stage {
            Stage::Exif => self.exif_workers,
            Stage::Thumbnail => self.thumb_workers,
            Stage::HighQuality => self.hq_workers,
            Stage::Original => self.original_workers,
            Stage::SqlAssociation => self.sql_workers,
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let cpus = available_cpus();
        Self {
            resized_cache_capacity: DEFAULT_RESIZED_CACHE_CAPACITY,
            original_cache_capacity: DEFAULT_ORIGINAL_CACHE_CAPACITY,
            photo_cache_capacity: DEFAULT_PHOTO_CACHE_CAPACITY,
            exif_workers: cpus,
            thumb_workers: cpus,
            // Concurrent large decodes thrash memory, keep them serialized.
            hq_workers: 1,
            original_workers: 1,
            sql_workers: 1,
            thumb_size: DEFAULT_THUMB_SIZE,
            hq_image_size: DEFAULT_HQ_IMAGE_SIZE,
            backend: DecodeBackend::default(),
            thumb_store_dir: ThumbStore::default_dir().ok(),
        }
    }
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .clamp(1, MAX_WORKERS)
}

/// Builder for [`LoaderConfig`].
pub struct LoaderConfigBuilder {
    config: LoaderConfig,
}

impl LoaderConfigBuilder {
    /// Starts from [`LoaderConfig::default`].
    pub fn new() -> Self {
        Self {
            config: LoaderConfig::default(),
        }
    }

    /// Decoded thumb/hq images kept in memory.
    pub fn resized_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.resized_cache_capacity = capacity;
        self
    }

    /// Decoded originals kept in memory.
    pub fn original_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.original_cache_capacity = capacity;
        self
    }

    /// Photo entities kept in memory.
    pub fn photo_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.photo_cache_capacity = capacity;
        self
    }

    /// Pool size for a stage, clamped to `1..=MAX_WORKERS`.
    pub fn workers(mut self, stage: Stage, count: usize) -> Self {
        let count = count.clamp(1, MAX_WORKERS);
        match stage {
            Stage::Exif => self.config.exif_workers = count,
            Stage::Thumbnail => self.config.thumb_workers = count,
            Stage::HighQuality => self.config.hq_workers = count,
            Stage::Original => self.config.original_workers = count,
            Stage::SqlAssociation => self.config.sql_workers = count,
        }
        self
    }

    /// Thumbnail longest side, at least 1.
    pub fn thumb_size(mut self, size: u32) -> Self {
        self.config.thumb_size = size.max(1);
        self
    }

    /// High-quality longest side, at least 1.
    pub fn hq_image_size(mut self, size: u32) -> Self {
        self.config.hq_image_size = size.max(1);
        self
    }

    /// Resampling filter for resized decodes.
    pub fn backend(mut self, backend: DecodeBackend) -> Self {
        self.config.backend = backend;
        self
    }

    /// Thumbnail store directory, `None` disables the store.
    pub fn thumb_store_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.config.thumb_store_dir = dir;
        self
    }

    /// Finishes the configuration.
    pub fn build(self) -> LoaderConfig {
        self.config
    }
}

impl Default for LoaderConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
