//! Bounded caches of decoded images.
//!
//! Two instances exist per loader: one for resized images (thumb, thumb-hq,
//! hq) and one for originals. Both are LRU caches bounded by entry count.
//! Every entry that leaves the map, by capacity pressure, replacement,
//! invalidation or shutdown, goes through the dispose hook exactly once.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{DynamicImage, GenericImageView};
use lru::LruCache;
use parking_lot::RwLock;
use tracing::{debug, trace};
use xxhash_rust::xxh3::xxh3_64;

use crate::models::ImageQuality;

/// Estimated bytes per pixel for RGBA bitmaps.
const BYTES_PER_PIXEL: usize = 4;

/// Bump when the key layout changes.
const KEY_VERSION: u8 = 1;

/// A decoded bitmap ready for display.
#[derive(Debug)]
pub struct DecodedImage {
    pixels: DynamicImage,
    width: u32,
    height: u32,
    memory_bytes: usize,
}

impl DecodedImage {
    pub fn new(pixels: DynamicImage) -> Self {
        let (width, height) = pixels.dimensions();
        let memory_bytes = (width as usize) * (height as usize) * BYTES_PER_PIXEL;
        Self {
            pixels,
            width,
            height,
            memory_bytes,
        }
    }

    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn longest_side(&self) -> u32 {
        self.width.max(self.height)
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }
}

/// Hash of (path, quality).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(u64);

impl CacheKey {
    pub fn new(path: &Path, quality: ImageQuality) -> Self {
        let path_str = path.to_string_lossy();
        let mut data = Vec::with_capacity(path_str.len() + 2);
        data.push(KEY_VERSION);
        data.extend_from_slice(path_str.as_bytes());
        data.push(quality.index() as u8);
        Self(xxh3_64(&data))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// A cached image together with the identity of its source.
///
/// The source path is a plain identifier, the cache never holds the photo.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub image: Arc<DecodedImage>,
    pub path: PathBuf,
    pub quality: ImageQuality,
}

impl CacheEntry {
    pub fn new(path: &Path, quality: ImageQuality, image: Arc<DecodedImage>) -> Self {
        Self {
            key: CacheKey::new(path, quality),
            image,
            path: path.to_path_buf(),
            quality,
        }
    }
}

/// Called once for every entry that leaves the cache.
pub type DisposeHook = Box<dyn Fn(&CacheEntry) + Send + Sync>;

pub struct DecodedImageCache {
    name: &'static str,
    entries: RwLock<LruCache<CacheKey, CacheEntry>>,
    dispose: DisposeHook,
}

impl DecodedImageCache {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self::with_dispose_hook(
            name,
            capacity,
            Box::new(move |entry: &CacheEntry| {
                trace!(
                    cache = name,
                    path = ?entry.path,
                    quality = %entry.quality,
                    bytes = entry.image.memory_bytes(),
                    "Disposed decoded image"
                );
            }),
        )
    }

    pub fn with_dispose_hook(name: &'static str, capacity: usize, dispose: DisposeHook) -> Self {
        debug!(cache = name, capacity, "Initialized decoded image cache");
        Self {
            name,
            entries: RwLock::new(LruCache::new(non_zero(capacity))),
            dispose,
        }
    }

    /// Looks up an entry and marks it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.write().get(key).cloned()
    }

    pub fn get_image(&self, path: &Path, quality: ImageQuality) -> Option<Arc<DecodedImage>> {
        self.get(&CacheKey::new(path, quality)).map(|e| e.image)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().contains(key)
    }

    /// Inserts an entry, disposing whatever it displaces: the previous entry
    /// under the same key, or the least recently used one when full.
    pub fn put(&self, entry: CacheEntry) {
        let new_image = Arc::clone(&entry.image);
        let displaced = self.entries.write().push(entry.key, entry);

        if let Some((_, old)) = displaced {
            // Re-inserting the same bitmap must not release it.
            if !Arc::ptr_eq(&old.image, &new_image) {
                self.dispose_entry(&old);
            }
        }
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.entries.write().pop(key);
        match removed {
            Some(entry) => {
                self.dispose_entry(&entry);
                true
            }
            None => false,
        }
    }

    /// Removes and disposes every entry whose source lies below `folder`.
    pub fn invalidate_folder(&self, folder: &Path) -> usize {
        let removed: Vec<CacheEntry> = {
            let mut entries = self.entries.write();
            let keys: Vec<CacheKey> = entries
                .iter()
                .filter(|(_, entry)| entry.path.starts_with(folder))
                .map(|(key, _)| *key)
                .collect();
            keys.iter().filter_map(|key| entries.pop(key)).collect()
        };

        for entry in &removed {
            self.dispose_entry(entry);
        }
        if !removed.is_empty() {
            debug!(cache = self.name, ?folder, count = removed.len(), "Invalidated folder");
        }
        removed.len()
    }

    /// Changes the capacity, disposing least recently used entries that no
    /// longer fit.
    pub fn resize(&self, capacity: usize) {
        let capacity = non_zero(capacity);
        let evicted: Vec<CacheEntry> = {
            let mut entries = self.entries.write();
            let mut evicted = Vec::new();
            while entries.len() > capacity.get() {
                match entries.pop_lru() {
                    Some((_, entry)) => evicted.push(entry),
                    None => break,
                }
            }
            entries.resize(capacity);
            evicted
        };

        for entry in &evicted {
            self.dispose_entry(entry);
        }
        debug!(cache = self.name, capacity = capacity.get(), evicted = evicted.len(), "Resized cache");
    }

    /// Disposes every entry.
    pub fn clear(&self) {
        let drained: Vec<CacheEntry> = {
            let mut entries = self.entries.write();
            let mut drained = Vec::with_capacity(entries.len());
            while let Some((_, entry)) = entries.pop_lru() {
                drained.push(entry);
            }
            drained
        };
        for entry in &drained {
            self.dispose_entry(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.read().cap().get()
    }

    /// Estimated bytes held by cached bitmaps.
    pub fn memory_usage(&self) -> usize {
        self.entries
            .read()
            .iter()
            .map(|(_, entry)| entry.image.memory_bytes())
            .sum()
    }

    fn dispose_entry(&self, entry: &CacheEntry) {
        (self.dispose)(entry);
    }
}

impl Drop for DecodedImageCache {
    fn drop(&mut self) {
        self.clear();
    }
}

fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn image(size: u32) -> Arc<DecodedImage> {
        Arc::new(DecodedImage::new(DynamicImage::new_rgba8(size, size)))
    }

    fn counting_cache(capacity: usize) -> (DecodedImageCache, Arc<Mutex<Vec<PathBuf>>>) {
        let disposed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&disposed);
        let cache = DecodedImageCache::with_dispose_hook(
            "test",
            capacity,
            Box::new(move |entry: &CacheEntry| sink.lock().push(entry.path.clone())),
        );
        (cache, disposed)
    }

    fn entry(path: &str, quality: ImageQuality) -> CacheEntry {
        CacheEntry::new(Path::new(path), quality, image(4))
    }

    #[test]
    fn test_key_depends_on_quality() {
        let path = Path::new("/photos/a.jpg");
        assert_eq!(
            CacheKey::new(path, ImageQuality::Thumb),
            CacheKey::new(path, ImageQuality::Thumb)
        );
        assert_ne!(
            CacheKey::new(path, ImageQuality::Thumb),
            CacheKey::new(path, ImageQuality::HighQuality)
        );
    }

    #[test]
    fn test_overflow_evicts_lru_once() {
        let (cache, disposed) = counting_cache(3);
        cache.put(entry("/p/1.jpg", ImageQuality::Thumb));
        cache.put(entry("/p/2.jpg", ImageQuality::Thumb));
        cache.put(entry("/p/3.jpg", ImageQuality::Thumb));

        // Touch 1 so 2 becomes least recently used.
        assert!(cache
            .get(&CacheKey::new(Path::new("/p/1.jpg"), ImageQuality::Thumb))
            .is_some());

        cache.put(entry("/p/4.jpg", ImageQuality::Thumb));

        assert_eq!(cache.len(), 3);
        assert_eq!(*disposed.lock(), vec![PathBuf::from("/p/2.jpg")]);
        assert!(cache.get_image(Path::new("/p/2.jpg"), ImageQuality::Thumb).is_none());
    }

    #[test]
    fn test_put_replaces_and_disposes_previous() {
        let (cache, disposed) = counting_cache(3);
        cache.put(entry("/p/1.jpg", ImageQuality::Thumb));
        cache.put(entry("/p/1.jpg", ImageQuality::Thumb));
        assert_eq!(cache.len(), 1);
        assert_eq!(disposed.lock().len(), 1);

        // Same bitmap again is not a replacement.
        let current = cache
            .get(&CacheKey::new(Path::new("/p/1.jpg"), ImageQuality::Thumb))
            .unwrap();
        cache.put(current);
        assert_eq!(disposed.lock().len(), 1);
    }

    #[test]
    fn test_invalidate_folder() {
        let (cache, disposed) = counting_cache(10);
        cache.put(entry("/trip/a.jpg", ImageQuality::Thumb));
        cache.put(entry("/trip/b.jpg", ImageQuality::HighQuality));
        cache.put(entry("/trip/day2/c.jpg", ImageQuality::Thumb));
        cache.put(entry("/home/d.jpg", ImageQuality::Thumb));

        assert_eq!(cache.invalidate_folder(Path::new("/trip")), 3);
        assert_eq!(cache.len(), 1);
        assert_eq!(disposed.lock().len(), 3);
        assert!(cache.get_image(Path::new("/home/d.jpg"), ImageQuality::Thumb).is_some());
    }

    #[test]
    fn test_invalidate_single_key() {
        let (cache, disposed) = counting_cache(10);
        cache.put(entry("/p/1.jpg", ImageQuality::Original));
        let key = CacheKey::new(Path::new("/p/1.jpg"), ImageQuality::Original);
        assert!(cache.invalidate(&key));
        assert!(!cache.invalidate(&key));
        assert_eq!(disposed.lock().len(), 1);
    }

    #[test]
    fn test_resize_disposes_overflow() {
        let (cache, disposed) = counting_cache(5);
        for i in 0..5 {
            cache.put(entry(&format!("/p/{i}.jpg"), ImageQuality::Thumb));
        }
        cache.resize(2);
        assert_eq!(cache.capacity(), 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(disposed.lock().len(), 3);
        // Oldest entries go first.
        assert_eq!(disposed.lock()[0], PathBuf::from("/p/0.jpg"));
    }

    #[test]
    fn test_drop_disposes_remaining() {
        let (cache, disposed) = counting_cache(5);
        cache.put(entry("/p/1.jpg", ImageQuality::Thumb));
        cache.put(entry("/p/2.jpg", ImageQuality::Thumb));
        drop(cache);
        assert_eq!(disposed.lock().len(), 2);
    }

    #[test]
    fn test_memory_usage() {
        let (cache, _) = counting_cache(5);
        cache.put(entry("/p/1.jpg", ImageQuality::Thumb));
        assert_eq!(cache.memory_usage(), 4 * 4 * BYTES_PER_PIXEL);
    }
}
