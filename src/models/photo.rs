use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::quality::ImageQuality;

/// Load progress of one (photo, quality) pair.
///
/// There is no `Loaded` variant: a loaded image is one that is present in a
/// decoded-image cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingState {
    Undefined,
    InQueue,
    Invalid,
}

impl LoadingState {
    fn as_u8(self) -> u8 {
        match self {
            LoadingState::Undefined => 0,
            LoadingState::InQueue => 1,
            LoadingState::Invalid => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoadingState::InQueue,
            2 => LoadingState::Invalid,
            _ => LoadingState::Undefined,
        }
    }
}

/// Progress of a one-shot lookup (metadata, tour associations).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    NotLoaded,
    InQueue,
    Loaded,
}

impl FetchState {
    fn as_u8(self) -> u8 {
        match self {
            FetchState::NotLoaded => 0,
            FetchState::InQueue => 1,
            FetchState::Loaded => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => FetchState::InQueue,
            2 => FetchState::Loaded,
            _ => FetchState::NotLoaded,
        }
    }
}

/// File attributes produced by a folder scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoFile {
    pub path: PathBuf,
    pub size: i64,
    pub mtime: i64,
}

impl PhotoFile {
    pub fn new(path: PathBuf, size: i64, mtime: i64) -> Self {
        Self { path, size, mtime }
    }
}

/// Parsed image metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoMetadata {
    pub width: u32,
    pub height: u32,
    /// EXIF orientation (1-8), 1 when unknown.
    pub orientation: u8,
    /// Capture time in unix seconds.
    pub taken_at: i64,
    pub camera: Option<String>,
    /// Set when parsing failed and `taken_at` is the file modification time.
    pub is_fallback: bool,
}

impl PhotoMetadata {
    /// Metadata for a file whose headers could not be parsed.
    pub fn fallback(mtime: i64) -> Self {
        Self {
            width: 0,
            height: 0,
            orientation: 1,
            taken_at: mtime,
            camera: None,
            is_fallback: true,
        }
    }

    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// A photo on disk, identified by its absolute path.
///
/// File attributes are immutable; the loading states, metadata and tour links
/// are written only by the load pipeline.
#[derive(Debug)]
pub struct Photo {
    path: PathBuf,
    size: i64,
    mtime: i64,
    loading: [AtomicU8; 4],
    exif_state: AtomicU8,
    sql_state: AtomicU8,
    metadata: RwLock<Option<Arc<PhotoMetadata>>>,
    tour_ids: RwLock<Vec<i64>>,
}

impl Photo {
    pub fn new(path: PathBuf, size: i64, mtime: i64) -> Self {
        Self {
            path,
            size,
            mtime,
            loading: Default::default(),
            exif_state: AtomicU8::new(FetchState::NotLoaded.as_u8()),
            sql_state: AtomicU8::new(FetchState::NotLoaded.as_u8()),
            metadata: RwLock::new(None),
            tour_ids: RwLock::new(Vec::new()),
        }
    }

    pub fn from_file(file: PhotoFile) -> Self {
        Self::new(file.path, file.size, file.mtime)
    }

    /// Copy of this photo under another path, keeping metadata and tour links
    /// but none of the in-flight loading state.
    pub fn with_path(&self, path: PathBuf) -> Self {
        let photo = Self::new(path, self.size, self.mtime);
        *photo.metadata.write() = self.metadata();
        *photo.tour_ids.write() = self.tour_ids();
        if self.metadata.read().is_some() {
            photo.set_exif_state(FetchState::Loaded);
        }
        if self.sql_state() == FetchState::Loaded {
            photo.set_sql_state(FetchState::Loaded);
        }
        photo
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn loading_state(&self, quality: ImageQuality) -> LoadingState {
        LoadingState::from_u8(self.loading[quality.index()].load(Ordering::Acquire))
    }

    /// Claims the (photo, quality) slot for a new request.
    ///
    /// Returns false when a request is already queued.
    pub(crate) fn try_mark_queued(&self, quality: ImageQuality) -> bool {
        let queued = LoadingState::InQueue.as_u8();
        self.loading[quality.index()]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != queued).then_some(queued)
            })
            .is_ok()
    }

    /// IN_QUEUE -> UNDEFINED. Leaves INVALID untouched.
    pub(crate) fn reset_if_queued(&self, quality: ImageQuality) -> bool {
        self.loading[quality.index()]
            .compare_exchange(
                LoadingState::InQueue.as_u8(),
                LoadingState::Undefined.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn mark_invalid(&self, quality: ImageQuality) {
        self.loading[quality.index()].store(LoadingState::Invalid.as_u8(), Ordering::Release);
    }

    /// INVALID -> UNDEFINED for every quality.
    pub(crate) fn reset_invalid(&self) {
        for slot in &self.loading {
            let _ = slot.compare_exchange(
                LoadingState::Invalid.as_u8(),
                LoadingState::Undefined.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    pub fn exif_state(&self) -> FetchState {
        FetchState::from_u8(self.exif_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_exif_state(&self, state: FetchState) {
        self.exif_state.store(state.as_u8(), Ordering::Release);
    }

    /// NOT_LOADED -> IN_QUEUE.
    pub(crate) fn try_queue_exif(&self) -> bool {
        Self::try_queue_fetch(&self.exif_state)
    }

    pub fn sql_state(&self) -> FetchState {
        FetchState::from_u8(self.sql_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_sql_state(&self, state: FetchState) {
        self.sql_state.store(state.as_u8(), Ordering::Release);
    }

    /// NOT_LOADED -> IN_QUEUE.
    pub(crate) fn try_queue_sql(&self) -> bool {
        Self::try_queue_fetch(&self.sql_state)
    }

    fn try_queue_fetch(state: &AtomicU8) -> bool {
        state
            .compare_exchange(
                FetchState::NotLoaded.as_u8(),
                FetchState::InQueue.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn metadata(&self) -> Option<Arc<PhotoMetadata>> {
        self.metadata.read().clone()
    }

    pub(crate) fn set_metadata(&self, metadata: PhotoMetadata) {
        *self.metadata.write() = Some(Arc::new(metadata));
    }

    /// Drops the metadata so the next exif request parses the file again.
    pub fn invalidate_metadata(&self) {
        *self.metadata.write() = None;
        self.set_exif_state(FetchState::NotLoaded);
    }

    /// Capture time, falling back to the file modification time.
    pub fn taken_at(&self) -> i64 {
        self.metadata
            .read()
            .as_ref()
            .map_or(self.mtime, |m| m.taken_at)
    }

    pub fn tour_ids(&self) -> Vec<i64> {
        self.tour_ids.read().clone()
    }

    pub(crate) fn set_tour_ids(&self, ids: Vec<i64>) {
        *self.tour_ids.write() = ids;
    }

    /// Whether the photo lies below `folder`.
    pub fn is_in_folder(&self, folder: &Path) -> bool {
        self.path.starts_with(folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo() -> Photo {
        Photo::new(PathBuf::from("/photos/a.jpg"), 1024, 1_700_000_000)
    }

    #[test]
    fn test_queue_claim_is_exclusive() {
        let photo = photo();
        assert!(photo.try_mark_queued(ImageQuality::Thumb));
        assert!(!photo.try_mark_queued(ImageQuality::Thumb));
        // Other qualities are independent.
        assert!(photo.try_mark_queued(ImageQuality::Original));
        assert_eq!(photo.loading_state(ImageQuality::Thumb), LoadingState::InQueue);
    }

    #[test]
    fn test_reset_keeps_invalid() {
        let photo = photo();
        photo.mark_invalid(ImageQuality::HighQuality);
        assert!(!photo.reset_if_queued(ImageQuality::HighQuality));
        assert_eq!(
            photo.loading_state(ImageQuality::HighQuality),
            LoadingState::Invalid
        );

        photo.reset_invalid();
        assert_eq!(
            photo.loading_state(ImageQuality::HighQuality),
            LoadingState::Undefined
        );
    }

    #[test]
    fn test_taken_at_falls_back_to_mtime() {
        let photo = photo();
        assert_eq!(photo.taken_at(), 1_700_000_000);

        let mut meta = PhotoMetadata::fallback(0);
        meta.taken_at = 42;
        meta.is_fallback = false;
        photo.set_metadata(meta);
        assert_eq!(photo.taken_at(), 42);

        photo.invalidate_metadata();
        assert!(photo.metadata().is_none());
        assert_eq!(photo.exif_state(), FetchState::NotLoaded);
    }

    #[test]
    fn test_with_path_drops_loading_state() {
        let photo = photo();
        photo.set_metadata(PhotoMetadata::fallback(5));
        photo.try_mark_queued(ImageQuality::Thumb);

        let moved = photo.with_path(PathBuf::from("/photos/b.jpg"));
        assert_eq!(moved.path(), Path::new("/photos/b.jpg"));
        assert_eq!(moved.loading_state(ImageQuality::Thumb), LoadingState::Undefined);
        assert_eq!(moved.exif_state(), FetchState::Loaded);
        assert_eq!(moved.metadata().map(|m| m.taken_at), Some(5));
    }

    #[test]
    fn test_folder_membership() {
        let photo = photo();
        assert!(photo.is_in_folder(Path::new("/photos")));
        assert!(!photo.is_in_folder(Path::new("/phot")));
    }
}
