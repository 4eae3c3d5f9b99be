//! On-disk store of decoded thumbnails.
//!
//! Thumbnails are stored in XDG_CACHE_HOME/photo-pipeline/thumbs/ as JPEG.
//! Filenames are based on xxhash of (path + mtime + size) so a modified
//! source never matches a stale thumbnail.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use tracing::{debug, trace, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::models::Photo;

/// Bump when thumbnail generation semantics change.
const THUMB_STORE_VERSION: u8 = 1;

/// JPEG quality for stored thumbnails (0-100).
const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Clone)]
pub struct ThumbStore {
    dir: PathBuf,
}

impl ThumbStore {
    pub fn new(dir: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(?dir, error = ?e, "Failed to create thumbnail store directory");
        }
        debug!(?dir, "Initialized thumbnail store");
        Self { dir }
    }

    /// Get the default store directory.
    pub fn default_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "photo-pipeline")
            .context("Failed to determine project directories")?;
        Ok(proj_dirs.cache_dir().join("thumbs"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the stored thumbnail for a photo.
    pub fn file_path(&self, photo: &Photo) -> PathBuf {
        self.dir
            .join(format!("{:016x}.jpg", Self::key(photo.path(), photo.mtime(), photo.size())))
    }

    fn key(path: &Path, mtime: i64, size: i64) -> u64 {
        let path_str = path.to_string_lossy();
        let mut data = Vec::with_capacity(path_str.len() + 17);
        data.push(THUMB_STORE_VERSION);
        data.extend_from_slice(path_str.as_bytes());
        data.extend_from_slice(&mtime.to_le_bytes());
        data.extend_from_slice(&size.to_le_bytes());
        xxh3_64(&data)
    }

    /// Loads a stored thumbnail. A file that cannot be decoded is removed.
    pub fn load(&self, photo: &Photo) -> Option<DynamicImage> {
        let stored = self.file_path(photo);
        if !stored.exists() {
            return None;
        }

        match image::open(&stored) {
            Ok(img) => {
                trace!(path = ?photo.path(), "Thumbnail store hit");
                Some(img)
            }
            Err(e) => {
                warn!(?stored, error = ?e, "Removing unreadable stored thumbnail");
                let _ = std::fs::remove_file(&stored);
                None
            }
        }
    }

    /// Writes a thumbnail as JPEG.
    pub fn save(&self, photo: &Photo, img: &DynamicImage) -> Result<PathBuf> {
        let dst = self.file_path(photo);
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create thumbnail directory: {:?}", self.dir))?;

        let file = File::create(&dst)
            .with_context(|| format!("Failed to create thumbnail file: {:?}", dst))?;
        let mut writer = BufWriter::new(file);

        // JPEG has no alpha channel
        let rgb = img.to_rgb8();
        let encoder = JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY);
        rgb.write_with_encoder(encoder)
            .with_context(|| format!("Failed to encode thumbnail: {:?}", dst))?;

        trace!(?dst, "Stored thumbnail");
        Ok(dst)
    }

    pub fn remove(&self, photo: &Photo) -> bool {
        std::fs::remove_file(self.file_path(photo)).is_ok()
    }

    /// Removes every stored thumbnail.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        if self.dir.exists() {
            for entry in std::fs::read_dir(&self.dir)?.flatten() {
                let path = entry.path();
                if path.is_file() && path.extension().is_some_and(|e| e == "jpg") {
                    if std::fs::remove_file(&path).is_ok() {
                        removed += 1;
                    }
                }
            }
        }
        debug!(dir = ?self.dir, removed, "Cleared thumbnail store");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_key_changes_with_mtime() {
        let path = Path::new("/test/image.jpg");
        assert_eq!(
            ThumbStore::key(path, 1234567890, 1024),
            ThumbStore::key(path, 1234567890, 1024)
        );
        assert_ne!(
            ThumbStore::key(path, 1234567890, 1024),
            ThumbStore::key(path, 1234567891, 1024)
        );
    }

    #[test]
    fn test_file_name_format() {
        let store = ThumbStore::new(PathBuf::from("/nonexistent/thumbs"));
        let photo = Photo::new(PathBuf::from("/test/image.jpg"), 1024, 1234567890);
        let name = store.file_path(&photo);
        let name = name.file_name().unwrap().to_string_lossy();
        // 16 hex + ".jpg"
        assert!(name.ends_with(".jpg"));
        assert_eq!(name.len(), 20);
    }

    #[test]
    fn test_save_load_and_clear() {
        let dir = tempdir().unwrap();
        let store = ThumbStore::new(dir.path().join("thumbs"));
        let photo = Photo::new(PathBuf::from("/test/image.jpg"), 1024, 7);

        assert!(store.load(&photo).is_none());
        store.save(&photo, &DynamicImage::new_rgb8(32, 16)).unwrap();

        let loaded = store.load(&photo).unwrap();
        assert_eq!((loaded.width(), loaded.height()), (32, 16));

        assert_eq!(store.clear().unwrap(), 1);
        assert!(store.load(&photo).is_none());
    }

    #[test]
    fn test_corrupt_file_is_removed() {
        let dir = tempdir().unwrap();
        let store = ThumbStore::new(dir.path().to_path_buf());
        let photo = Photo::new(PathBuf::from("/test/broken.jpg"), 1, 1);
        std::fs::write(store.file_path(&photo), b"not a jpeg").unwrap();

        assert!(store.load(&photo).is_none());
        assert!(!store.file_path(&photo).exists());
    }
}
