//! LRU cache of photo entities keyed by path.
//!
//! Evicted photos are handed to a background notifier thread which calls the
//! registered listeners. A listener that still displays the photo puts it
//! back; since the listener never runs inside the evicting `put`, the
//! re-admission cannot re-enter the cache lock.

use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::thread;

use flume::{Receiver, Sender};
use lru::LruCache;
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::models::{Photo, PhotoFile};

/// Listener called from the notifier thread for each evicted photo.
pub type EvictionListener = Arc<dyn Fn(&PhotoCache, &Arc<Photo>) + Send + Sync>;

struct Inner {
    entries: RwLock<LruCache<PathBuf, Arc<Photo>>>,
    listeners: RwLock<Vec<EvictionListener>>,
    evicted_tx: Sender<Arc<Photo>>,
}

/// Shared handle to the photo cache. Clones share the same entries.
#[derive(Clone)]
pub struct PhotoCache {
    inner: Arc<Inner>,
}

impl PhotoCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let (evicted_tx, evicted_rx) = flume::unbounded();

        let inner = Arc::new(Inner {
            entries: RwLock::new(LruCache::new(capacity)),
            listeners: RwLock::new(Vec::new()),
            evicted_tx,
        });

        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name("photo-evictions".to_string())
            .spawn(move || notifier_loop(weak, evicted_rx))
            .expect("Failed to spawn photo eviction notifier");

        debug!(capacity = capacity.get(), "Initialized photo cache");
        Self { inner }
    }

    pub fn get(&self, path: &Path) -> Option<Arc<Photo>> {
        self.inner.entries.write().get(path).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.inner.entries.read().contains(path)
    }

    /// Inserts a photo. A least recently used photo pushed out by the
    /// insertion is queued for the eviction listeners.
    pub fn put(&self, photo: Arc<Photo>) {
        let key = photo.path().to_path_buf();
        let displaced = self.inner.entries.write().push(key.clone(), photo);

        if let Some((old_key, evicted)) = displaced {
            // Same key means the entry was replaced, not evicted.
            if old_key != key {
                trace!(path = ?evicted.path(), "Evicted photo");
                let _ = self.inner.evicted_tx.send(evicted);
            }
        }
    }

    /// Returns the cached photo for a scanned file, creating it when absent.
    ///
    /// Lookup and insert happen under one write lock, so concurrent callers
    /// for the same path share a single photo.
    pub fn get_or_insert(&self, file: PhotoFile) -> Arc<Photo> {
        let (photo, evicted) = {
            let mut entries = self.inner.entries.write();
            if let Some(photo) = entries.get(&file.path) {
                return Arc::clone(photo);
            }
            let key = file.path.clone();
            let photo = Arc::new(Photo::from_file(file));
            let evicted = entries.push(key, Arc::clone(&photo)).map(|(_, old)| old);
            (photo, evicted)
        };

        if let Some(evicted) = evicted {
            trace!(path = ?evicted.path(), "Evicted photo");
            let _ = self.inner.evicted_tx.send(evicted);
        }
        photo
    }

    pub fn remove(&self, path: &Path) -> Option<Arc<Photo>> {
        self.inner.entries.write().pop(path)
    }

    /// Drops every photo below `folder`. Listeners are not notified.
    pub fn invalidate_folder(&self, folder: &Path) -> usize {
        let mut entries = self.inner.entries.write();
        let keys: Vec<PathBuf> = entries
            .iter()
            .filter(|(path, _)| path.starts_with(folder))
            .map(|(path, _)| path.clone())
            .collect();
        for key in &keys {
            entries.pop(key);
        }
        if !keys.is_empty() {
            debug!(?folder, count = keys.len(), "Invalidated photos in folder");
        }
        keys.len()
    }

    /// Moves a photo to a new path, e.g. after a rename.
    ///
    /// Returns the photo stored under the new path.
    pub fn replace_identity(&self, old_path: &Path, new_path: &Path) -> Option<Arc<Photo>> {
        let old = self.remove(old_path)?;
        let moved = Arc::new(old.with_path(new_path.to_path_buf()));
        self.put(Arc::clone(&moved));
        debug!(?old_path, ?new_path, "Replaced photo identity");
        Some(moved)
    }

    pub fn add_eviction_listener<F>(&self, listener: F)
    where
        F: Fn(&PhotoCache, &Arc<Photo>) + Send + Sync + 'static,
    {
        self.inner.listeners.write().push(Arc::new(listener));
    }

    /// All cached photos, most recently used first.
    pub fn snapshot(&self) -> Vec<Arc<Photo>> {
        self.inner
            .entries
            .read()
            .iter()
            .map(|(_, photo)| Arc::clone(photo))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.entries.write().clear();
    }
}

fn notifier_loop(cache: Weak<Inner>, rx: Receiver<Arc<Photo>>) {
    debug!("Photo eviction notifier started");

    while let Ok(photo) = rx.recv() {
        let Some(inner) = cache.upgrade() else {
            break;
        };
        let handle = PhotoCache { inner };
        let listeners = handle.inner.listeners.read().clone();

        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener(&handle, &photo)));
            if result.is_err() {
                warn!(path = ?photo.path(), "Eviction listener panicked");
            }
        }
    }

    debug!("Photo eviction notifier stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn photo(path: &str) -> Arc<Photo> {
        Arc::new(Photo::new(PathBuf::from(path), 100, 1))
    }

    #[test]
    fn test_get_and_put() {
        let cache = PhotoCache::new(10);
        cache.put(photo("/p/a.jpg"));
        assert!(cache.get(Path::new("/p/a.jpg")).is_some());
        assert!(cache.get(Path::new("/p/b.jpg")).is_none());
    }

    #[test]
    fn test_eviction_notifies_listener() {
        let cache = PhotoCache::new(2);
        let (tx, rx) = flume::unbounded();
        cache.add_eviction_listener(move |_, photo| {
            let _ = tx.send(photo.path().to_path_buf());
        });

        cache.put(photo("/p/1.jpg"));
        cache.put(photo("/p/2.jpg"));
        cache.put(photo("/p/3.jpg"));

        let evicted = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(evicted, PathBuf::from("/p/1.jpg"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_replacing_same_path_is_not_an_eviction() {
        let cache = PhotoCache::new(2);
        let (tx, rx) = flume::unbounded();
        cache.add_eviction_listener(move |_, photo| {
            let _ = tx.send(photo.path().to_path_buf());
        });

        cache.put(photo("/p/1.jpg"));
        cache.put(photo("/p/1.jpg"));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_displayed_photo_is_readmitted() {
        let cache = PhotoCache::new(2);
        let displayed = PathBuf::from("/p/1.jpg");
        let (tx, rx) = flume::unbounded();

        let keep = displayed.clone();
        cache.add_eviction_listener(move |cache, photo| {
            if photo.path() == keep {
                cache.put(Arc::clone(photo));
            }
            let _ = tx.send(photo.path().to_path_buf());
        });

        let original = photo("/p/1.jpg");
        cache.put(Arc::clone(&original));
        cache.put(photo("/p/2.jpg"));
        cache.put(photo("/p/3.jpg"));

        let evicted = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(evicted, displayed);

        let readmitted = cache.get(&displayed).unwrap();
        assert!(Arc::ptr_eq(&readmitted, &original));
    }

    #[test]
    fn test_invalidate_folder() {
        let cache = PhotoCache::new(10);
        cache.put(photo("/trip/a.jpg"));
        cache.put(photo("/trip/sub/b.jpg"));
        cache.put(photo("/other/c.jpg"));

        assert_eq!(cache.invalidate_folder(Path::new("/trip")), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(Path::new("/other/c.jpg")));
    }

    #[test]
    fn test_replace_identity() {
        let cache = PhotoCache::new(10);
        cache.put(photo("/p/old.jpg"));

        let moved = cache
            .replace_identity(Path::new("/p/old.jpg"), Path::new("/p/new.jpg"))
            .unwrap();
        assert_eq!(moved.path(), Path::new("/p/new.jpg"));
        assert!(!cache.contains(Path::new("/p/old.jpg")));
        assert!(cache.contains(Path::new("/p/new.jpg")));

        assert!(cache
            .replace_identity(Path::new("/p/missing.jpg"), Path::new("/p/x.jpg"))
            .is_none());
    }

    #[test]
    fn test_get_or_insert_reuses_entry() {
        let cache = PhotoCache::new(10);
        let first = cache.get_or_insert(PhotoFile::new(PathBuf::from("/p/a.jpg"), 1, 2));
        let second = cache.get_or_insert(PhotoFile::new(PathBuf::from("/p/a.jpg"), 1, 2));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_concurrent_get_or_insert_shares_one_photo() {
        let cache = PhotoCache::new(10);
        let photos: Vec<Arc<Photo>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let cache = cache.clone();
                    s.spawn(move || {
                        cache.get_or_insert(PhotoFile::new(PathBuf::from("/p/shared.jpg"), 1, 2))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(photos.iter().all(|p| Arc::ptr_eq(p, &photos[0])));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_get_or_insert_evicts_through_listeners() {
        let cache = PhotoCache::new(1);
        let (tx, rx) = flume::unbounded();
        cache.add_eviction_listener(move |_, photo| {
            let _ = tx.send(photo.path().to_path_buf());
        });

        cache.get_or_insert(PhotoFile::new(PathBuf::from("/p/a.jpg"), 1, 2));
        cache.get_or_insert(PhotoFile::new(PathBuf::from("/p/b.jpg"), 1, 2));

        let evicted = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(evicted, PathBuf::from("/p/a.jpg"));
    }
}
