//! Caches owned by the load pipeline.
//!
//! - `DecodedImageCache` - LRU caches of decoded bitmaps (resized, original)
//! - `PhotoCache` - LRU cache of photo entities with eviction listeners
//! - `ThumbStore` - JPEG thumbnails persisted on disk

pub mod image_cache;
pub mod photo_cache;
pub mod thumb_store;

pub use image_cache::{CacheEntry, CacheKey, DecodedImage, DecodedImageCache, DisposeHook};
pub use photo_cache::{EvictionListener, PhotoCache};
pub use thumb_store::ThumbStore;
