//! The load manager: entry point for every image, metadata and association
//! load.
//!
//! It owns the five stage queues, the decoded-image caches, the photo cache
//! and the failure registries, and wires the stages together (escalation
//! from thumbnails to high quality, cancellation, state resets).
//!
//! Loading-state rules for an image request:
//! - enqueue claims the (photo, quality) slot, UNDEFINED -> IN_QUEUE, before
//!   the request reaches a queue, so a second enqueue is a no-op
//! - a worker owns the request from the moment it pops it; every exit path
//!   resets IN_QUEUE -> UNDEFINED through [`QueuedGuard`] unless the request
//!   ended INVALID
//! - a loaded image is one present in a decoded cache, there is no flag

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use super::errors::ErrorRegistry;
use super::request::LoadRequest;
use super::stage::StageQueue;
use crate::cache::{CacheEntry, CacheKey, DecodedImage, DecodedImageCache, PhotoCache, ThumbStore};
use crate::config::{DecodeBackend, LoaderConfig};
use crate::error::{LoadError, LoadResult};
use crate::loader::{
    AssociationSource, DecodeJob, FileDecoder, HeaderMetadataParser, ImageDecoder,
    MetadataParser,
};
use crate::models::{FetchState, ImageQuality, LoadTier, Photo, PhotoFile, PhotoMetadata, Stage};

/// Result of handing a request to the manager.
#[derive(Debug, Clone)]
pub enum Enqueued {
    /// The image is already decoded; no work was scheduled and the callback
    /// will not fire.
    Cached(Arc<DecodedImage>),
    /// A worker will process the request.
    Queued,
    /// A request for the same photo and tier is already pending.
    AlreadyQueued,
    /// Metadata or associations are already loaded.
    Loaded,
    /// The photo is in a failure registry; resolved without decoding.
    Invalid,
    /// The manager has been shut down.
    Rejected,
}

impl Enqueued {
    /// Whether a worker will pick the request up.
    pub fn is_queued(&self) -> bool {
        matches!(self, Enqueued::Queued)
    }
}

/// Builder for [`LoadManager`].
pub struct LoadManagerBuilder {
    config: LoaderConfig,
    decoder: Arc<dyn ImageDecoder>,
    metadata: Arc<dyn MetadataParser>,
    associations: Option<Arc<dyn AssociationSource>>,
}

impl LoadManagerBuilder {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            decoder: Arc::new(FileDecoder),
            metadata: Arc::new(HeaderMetadataParser),
            associations: None,
        }
    }

    /// Replaces the default file decoder.
    pub fn decoder(mut self, decoder: Arc<dyn ImageDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Replaces the default header parser.
    pub fn metadata_parser(mut self, parser: Arc<dyn MetadataParser>) -> Self {
        self.metadata = parser;
        self
    }

    /// Enables the SQL association stage. Without a source, association
    /// requests resolve as loaded with no tours.
    pub fn association_source(mut self, source: Arc<dyn AssociationSource>) -> Self {
        self.associations = Some(source);
        self
    }

    /// Builds the manager and starts every worker pool.
    pub fn build(self) -> LoadManager {
        LoadManager::from_builder(self)
    }
}

struct Inner {
    config: RwLock<LoaderConfig>,
    exif: StageQueue,
    thumb: StageQueue,
    hq: StageQueue,
    original: StageQueue,
    sql: StageQueue,
    resized: DecodedImageCache,
    originals: DecodedImageCache,
    photos: PhotoCache,
    thumb_store: Option<ThumbStore>,
    invalid_images: ErrorRegistry,
    invalid_exif: ErrorRegistry,
    persist_failures: ErrorRegistry,
    decoder: Arc<dyn ImageDecoder>,
    metadata: Arc<dyn MetadataParser>,
    associations: Option<Arc<dyn AssociationSource>>,
}

/// Process-wide image loading pipeline. Construct one and pass it by
/// reference to its consumers.
pub struct LoadManager {
    inner: Arc<Inner>,
}

impl LoadManager {
    /// Manager with the default decoder and metadata parser.
    pub fn new(config: LoaderConfig) -> Self {
        LoadManagerBuilder::new(config).build()
    }

    /// Builder for injecting custom decoders and sources.
    pub fn builder(config: LoaderConfig) -> LoadManagerBuilder {
        LoadManagerBuilder::new(config)
    }

    fn from_builder(builder: LoadManagerBuilder) -> Self {
        let LoadManagerBuilder {
            config,
            decoder,
            metadata,
            associations,
        } = builder;

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let stage = |stage: Stage| {
                let weak = weak.clone();
                StageQueue::new(stage, config.workers(stage), move |request| {
                    if let Some(inner) = weak.upgrade() {
                        inner.process(request);
                    }
                })
            };

            Inner {
                exif: stage(Stage::Exif),
                thumb: stage(Stage::Thumbnail),
                hq: stage(Stage::HighQuality),
                original: stage(Stage::Original),
                sql: stage(Stage::SqlAssociation),
                resized: DecodedImageCache::new("resized", config.resized_cache_capacity),
                originals: DecodedImageCache::new("original", config.original_cache_capacity),
                photos: PhotoCache::new(config.photo_cache_capacity),
                thumb_store: config.thumb_store_dir.clone().map(ThumbStore::new),
                invalid_images: ErrorRegistry::new("images"),
                invalid_exif: ErrorRegistry::new("exif"),
                persist_failures: ErrorRegistry::new("thumb-store"),
                decoder,
                metadata,
                associations,
                config: RwLock::new(config),
            }
        });

        info!("Started load manager");
        Self { inner }
    }

    /// Hands a request to the stage matching its tier.
    pub fn enqueue(&self, request: LoadRequest) -> Enqueued {
        self.inner.enqueue(request)
    }

    /// Convenience for an image request without a callback or gate.
    pub fn request_image(&self, photo: &Arc<Photo>, quality: ImageQuality) -> Enqueued {
        self.enqueue(LoadRequest::image(Arc::clone(photo), quality))
    }

    /// Returns a decoded image if one is cached.
    pub fn cached_image(&self, path: &Path, quality: ImageQuality) -> Option<Arc<DecodedImage>> {
        self.inner.cache_for(quality).get_image(path, quality)
    }

    /// Best cached image for a photo, highest quality first.
    pub fn best_cached_image(&self, path: &Path) -> Option<(ImageQuality, Arc<DecodedImage>)> {
        ImageQuality::ALL
            .iter()
            .rev()
            .find_map(|&q| self.cached_image(path, q).map(|img| (q, img)))
    }

    /// Photo entity for a scanned file, from the photo cache when present.
    pub fn photo(&self, file: PhotoFile) -> Arc<Photo> {
        self.inner.photos.get_or_insert(file)
    }

    /// Photo entity cache, e.g. for registering eviction listeners.
    pub fn photo_cache(&self) -> &PhotoCache {
        &self.inner.photos
    }

    /// Cache of thumb, thumb-hq and hq images.
    pub fn resized_cache(&self) -> &DecodedImageCache {
        &self.inner.resized
    }

    /// Cache of original-resolution images.
    pub fn original_cache(&self) -> &DecodedImageCache {
        &self.inner.originals
    }

    /// Whether the photo failed to decode and will not be retried.
    pub fn is_failed(&self, path: &Path) -> bool {
        self.inner.invalid_images.is_failed(path)
    }

    /// Requests waiting in a stage.
    pub fn queue_depth(&self, stage: Stage) -> usize {
        self.inner.queue(stage).len()
    }

    /// Whether a stage has pending or running requests.
    pub fn is_busy(&self, stage: Stage) -> bool {
        self.inner.queue(stage).is_busy()
    }

    /// Cancels one stage, resetting the state of every orphaned request.
    ///
    /// Returns the number of cancelled requests.
    pub fn cancel_stage(&self, stage: Stage) -> usize {
        self.inner.cancel_stage(stage)
    }

    /// Cancels the thumbnail, high-quality and original stages, and the exif
    /// stage when `include_exif` is set.
    pub fn stop_loading(&self, include_exif: bool) -> usize {
        let mut cancelled = self.cancel_stage(Stage::Thumbnail)
            + self.cancel_stage(Stage::HighQuality)
            + self.cancel_stage(Stage::Original);
        if include_exif {
            cancelled += self.cancel_stage(Stage::Exif);
        }
        debug!(cancelled, include_exif, "Stopped loading");
        cancelled
    }

    /// Blocks until the exif stage is idle, polling every `poll`.
    ///
    /// `on_progress` receives the remaining queue depth on every poll.
    /// Returns false when `cancel` was set before the stage drained.
    pub fn wait_for_exif<F>(&self, cancel: &AtomicBool, poll: Duration, mut on_progress: F) -> bool
    where
        F: FnMut(usize),
    {
        loop {
            if cancel.load(Ordering::Acquire) {
                debug!("Exif wait cancelled");
                return false;
            }
            if !self.inner.exif.is_busy() {
                return true;
            }
            on_progress(self.inner.exif.len());
            thread::sleep(poll);
        }
    }

    /// Empties the failure registries so failed photos may be tried again.
    pub fn clear_invalid(&self) {
        self.inner.invalid_images.clear_all();
        self.inner.invalid_exif.clear_all();
        self.inner.persist_failures.clear_all();

        for photo in self.inner.photos.snapshot() {
            photo.reset_invalid();
            if photo.metadata().is_some_and(|m| m.is_fallback) {
                photo.invalidate_metadata();
            }
        }
        info!("Cleared invalid photos");
    }

    /// Drops decoded images and photo entities below `folder`.
    pub fn dispose_folder(&self, folder: &Path) {
        let images = self.inner.resized.invalidate_folder(folder)
            + self.inner.originals.invalidate_folder(folder);
        let photos = self.inner.photos.invalidate_folder(folder);
        debug!(?folder, images, photos, "Disposed folder");
    }

    /// Forgets everything decoded or parsed for a photo, e.g. after the file
    /// was replaced on disk.
    pub fn invalidate_photo(&self, photo: &Photo) {
        for quality in ImageQuality::ALL {
            let key = CacheKey::new(photo.path(), quality);
            self.inner.cache_for(quality).invalidate(&key);
        }
        if let Some(store) = &self.inner.thumb_store {
            store.remove(photo);
        }
        photo.invalidate_metadata();
    }

    /// Longest side of high-quality decodes scheduled from now on.
    pub fn set_hq_image_size(&self, size: u32) {
        self.inner.config.write().hq_image_size = size.max(1);
    }

    /// Resampling backend for decodes scheduled from now on.
    pub fn set_backend(&self, backend: DecodeBackend) {
        self.inner.config.write().backend = backend;
    }

    /// Resizes both decoded-image caches, disposing entries that no longer
    /// fit.
    pub fn set_cache_capacities(&self, resized: usize, original: usize) {
        {
            let mut config = self.inner.config.write();
            config.resized_cache_capacity = resized;
            config.original_cache_capacity = original;
        }
        self.inner.resized.resize(resized);
        self.inner.originals.resize(original);
    }

    /// Grows or shrinks the worker pool of one stage. The count is clamped
    /// to `1..=MAX_WORKERS`.
    pub fn set_stage_workers(&self, stage: Stage, count: usize) {
        self.inner.queue(stage).set_workers(count);
        let count = self.inner.queue(stage).worker_count();
        let mut config = self.inner.config.write();
        match stage {
            Stage::Exif => config.exif_workers = count,
            Stage::Thumbnail => config.thumb_workers = count,
            Stage::HighQuality => config.hq_workers = count,
            Stage::Original => config.original_workers = count,
            Stage::SqlAssociation => config.sql_workers = count,
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> LoaderConfig {
        self.inner.config.read().clone()
    }

    /// Cancels all pending work and stops every worker pool.
    pub fn shutdown(&self) {
        self.stop_loading(true);
        self.cancel_stage(Stage::SqlAssociation);
        for stage in Stage::ALL {
            self.inner.queue(stage).shutdown();
        }
        // Workers finishing during shutdown may have escalated into a queue
        // nobody drains any more.
        let orphaned: usize = Stage::ALL.iter().map(|&s| self.cancel_stage(s)).sum();
        info!(orphaned, "Load manager shut down");
    }
}

impl Drop for LoadManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resets IN_QUEUE -> UNDEFINED when a worker is done with an image request,
/// whichever way it leaves.
struct QueuedGuard<'a> {
    photo: &'a Photo,
    quality: ImageQuality,
}

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.photo.reset_if_queued(self.quality);
    }
}

/// Puts an exif or association fetch back to NOT_LOADED if the worker leaves
/// without finishing it.
struct FetchGuard<'a> {
    photo: &'a Photo,
    stage: Stage,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        match self.stage {
            Stage::Exif if self.photo.exif_state() == FetchState::InQueue => {
                self.photo.set_exif_state(FetchState::NotLoaded)
            }
            Stage::SqlAssociation if self.photo.sql_state() == FetchState::InQueue => {
                self.photo.set_sql_state(FetchState::NotLoaded)
            }
            _ => {}
        }
    }
}

impl Inner {
    fn queue(&self, stage: Stage) -> &StageQueue {
        match stage {
            Stage::Exif => &self.exif,
            Stage::Thumbnail => &self.thumb,
            Stage::HighQuality => &self.hq,
            Stage::Original => &self.original,
            Stage::SqlAssociation => &self.sql,
        }
    }

    fn cache_for(&self, quality: ImageQuality) -> &DecodedImageCache {
        if quality.is_original() {
            &self.originals
        } else {
            &self.resized
        }
    }

    fn enqueue(&self, request: LoadRequest) -> Enqueued {
        match request.tier() {
            LoadTier::Image(quality) => self.enqueue_image(request, quality),
            LoadTier::Exif => self.enqueue_exif(request),
            LoadTier::SqlAssociation => self.enqueue_sql(request),
        }
    }

    fn enqueue_image(&self, request: LoadRequest, quality: ImageQuality) -> Enqueued {
        let photo = Arc::clone(request.photo());

        if let Some(image) = self.cache_for(quality).get_image(photo.path(), quality) {
            return Enqueued::Cached(image);
        }

        if self.invalid_images.is_failed(photo.path()) {
            photo.mark_invalid(quality);
            return Enqueued::Invalid;
        }

        if !photo.try_mark_queued(quality) {
            trace!(path = ?photo.path(), %quality, "Request already pending");
            return Enqueued::AlreadyQueued;
        }

        if self.queue(quality.stage()).enqueue(request) {
            Enqueued::Queued
        } else {
            photo.reset_if_queued(quality);
            Enqueued::Rejected
        }
    }

    fn enqueue_exif(&self, request: LoadRequest) -> Enqueued {
        let photo = Arc::clone(request.photo());

        if photo.exif_state() == FetchState::Loaded {
            return Enqueued::Loaded;
        }

        if self.invalid_exif.is_failed(photo.path()) {
            if photo.metadata().is_none() {
                photo.set_metadata(PhotoMetadata::fallback(photo.mtime()));
            }
            photo.set_exif_state(FetchState::Loaded);
            return Enqueued::Invalid;
        }

        if !photo.try_queue_exif() {
            return Enqueued::AlreadyQueued;
        }

        if self.exif.enqueue(request) {
            Enqueued::Queued
        } else {
            photo.set_exif_state(FetchState::NotLoaded);
            Enqueued::Rejected
        }
    }

    fn enqueue_sql(&self, request: LoadRequest) -> Enqueued {
        let photo = Arc::clone(request.photo());

        if photo.sql_state() == FetchState::Loaded {
            return Enqueued::Loaded;
        }

        if self.associations.is_none() {
            photo.set_sql_state(FetchState::Loaded);
            return Enqueued::Loaded;
        }

        if !photo.try_queue_sql() {
            return Enqueued::AlreadyQueued;
        }

        if self.sql.enqueue(request) {
            Enqueued::Queued
        } else {
            photo.set_sql_state(FetchState::NotLoaded);
            Enqueued::Rejected
        }
    }

    fn cancel_stage(&self, stage: Stage) -> usize {
        let orphaned = self.queue(stage).drain_and_cancel();
        for request in &orphaned {
            let photo = request.photo();
            match request.tier() {
                LoadTier::Image(quality) => {
                    photo.reset_if_queued(quality);
                }
                LoadTier::Exif => {
                    if photo.exif_state() == FetchState::InQueue {
                        photo.set_exif_state(FetchState::NotLoaded);
                    }
                }
                LoadTier::SqlAssociation => {
                    if photo.sql_state() == FetchState::InQueue {
                        photo.set_sql_state(FetchState::NotLoaded);
                    }
                }
            }
        }
        orphaned.len()
    }

    /// Entry point of every stage worker.
    fn process(&self, request: LoadRequest) {
        match request.tier() {
            LoadTier::Image(quality) => self.process_image(&request, quality),
            LoadTier::Exif => self.process_exif(&request),
            LoadTier::SqlAssociation => self.process_sql(&request),
        }
    }

    fn process_image(&self, request: &LoadRequest, quality: ImageQuality) {
        let photo = request.photo();
        let guard = QueuedGuard {
            photo: photo.as_ref(),
            quality,
        };

        if self.invalid_images.is_failed(photo.path()) {
            photo.mark_invalid(quality);
            drop(guard);
            request.notify(None, true);
            return;
        }

        if quality.stage().is_gated() && !request.is_visible() {
            // Abandoned without a callback; a later scroll-back re-requests.
            trace!(path = ?photo.path(), %quality, "Skipped invisible photo");
            return;
        }

        let cache = self.cache_for(quality);
        if let Some(image) = cache.get_image(photo.path(), quality) {
            drop(guard);
            request.notify(Some(image), true);
            return;
        }

        match self.decode_image(request, quality) {
            Ok(image) => {
                let image = Arc::new(image);
                cache.put(CacheEntry::new(photo.path(), quality, Arc::clone(&image)));
                drop(guard);

                let escalate = quality == ImageQuality::Thumb
                    && image.longest_side() < request.display_size();

                request.notify(Some(image), true);

                if escalate {
                    trace!(path = ?photo.path(), "Escalating thumbnail to high quality");
                    let hq = request.escalate(ImageQuality::HighQuality);
                    if let Enqueued::Cached(image) = self.enqueue(hq.clone()) {
                        hq.notify(Some(image), true);
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "Failed to load image");
                self.invalid_images.mark_failed(photo.path());
                photo.mark_invalid(quality);
                drop(guard);
                request.notify(None, true);
            }
        }
    }

    fn decode_image(&self, request: &LoadRequest, quality: ImageQuality) -> LoadResult<DecodedImage> {
        let photo = request.photo();
        let (target_size, backend) = {
            let config = self.config.read();
            let target = match quality {
                ImageQuality::Thumb => config.thumb_size,
                ImageQuality::ThumbHighQuality => request.display_size().max(config.thumb_size),
                ImageQuality::HighQuality => config.hq_image_size,
                ImageQuality::Original => 0,
            };
            (target, config.backend)
        };

        let store = self
            .thumb_store
            .as_ref()
            .filter(|_| quality == ImageQuality::Thumb)
            .filter(|_| !self.persist_failures.is_failed(photo.path()));

        if let Some(img) = store.and_then(|s| s.load(photo)) {
            return Ok(DecodedImage::new(img));
        }

        let job = DecodeJob {
            path: photo.path(),
            quality,
            target_size,
            backend,
        };
        let img = match catch_unwind(AssertUnwindSafe(|| self.decoder.decode(&job))) {
            Ok(Ok(img)) => img,
            Ok(Err(e)) => return Err(LoadError::decode(photo.path(), format!("{e:#}"))),
            Err(_) => return Err(LoadError::decode(photo.path(), "decoder panicked")),
        };

        if let Some(store) = store {
            if let Err(e) = store.save(photo, &img) {
                let err = LoadError::persist(photo.path(), format!("{e:#}"));
                warn!(error = %err, "Falling back to original image for thumbnails");
                self.persist_failures.mark_failed(photo.path());
            }
        }

        Ok(DecodedImage::new(img))
    }

    fn process_exif(&self, request: &LoadRequest) {
        let photo = request.photo();
        let _guard = FetchGuard {
            photo: photo.as_ref(),
            stage: Stage::Exif,
        };

        if self.invalid_exif.is_failed(photo.path()) {
            photo.set_metadata(PhotoMetadata::fallback(photo.mtime()));
            photo.set_exif_state(FetchState::Loaded);
            request.notify(None, false);
            return;
        }

        let parsed = catch_unwind(AssertUnwindSafe(|| {
            self.metadata.parse(photo.path(), photo.mtime())
        }));
        let parsed = match parsed {
            Ok(Ok(meta)) => Ok(meta),
            Ok(Err(e)) => Err(LoadError::metadata(photo.path(), format!("{e:#}"))),
            Err(_) => Err(LoadError::metadata(photo.path(), "metadata parser panicked")),
        };

        let update_ui = match parsed {
            Ok(meta) => {
                photo.set_metadata(meta);
                true
            }
            Err(err) => {
                warn!(error = %err, "Using file time for photo");
                self.invalid_exif.mark_failed(photo.path());
                photo.set_metadata(PhotoMetadata::fallback(photo.mtime()));
                false
            }
        };
        photo.set_exif_state(FetchState::Loaded);
        request.notify(None, update_ui);
    }

    fn process_sql(&self, request: &LoadRequest) {
        let photo = request.photo();
        let _guard = FetchGuard {
            photo: photo.as_ref(),
            stage: Stage::SqlAssociation,
        };

        let Some(source) = &self.associations else {
            photo.set_sql_state(FetchState::Loaded);
            return;
        };

        match source.tour_ids(photo.path()) {
            Ok(ids) => {
                let update_ui = !ids.is_empty();
                photo.set_tour_ids(ids);
                photo.set_sql_state(FetchState::Loaded);
                request.notify(None, update_ui);
            }
            Err(e) => {
                // Not memoized: lookups fail for transient reasons.
                let err = LoadError::association(photo.path(), format!("{e:#}"));
                warn!(error = %err, "Association lookup failed");
            }
        }
    }
}
