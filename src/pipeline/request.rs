use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::cache::DecodedImage;
use crate::models::{ImageQuality, LoadTier, Photo};

/// Delivered to the completion callback on a worker thread.
#[derive(Debug, Clone)]
pub struct LoadEvent {
    pub photo: Arc<Photo>,
    pub tier: LoadTier,
    /// The decoded image for image tiers; `None` when decoding failed or for
    /// metadata/association loads.
    pub image: Option<Arc<DecodedImage>>,
    /// Whether the consumer should repaint.
    pub update_ui: bool,
}

impl LoadEvent {
    pub fn quality(&self) -> Option<ImageQuality> {
        self.tier.quality()
    }

    pub fn is_broken(&self) -> bool {
        matches!(self.tier, LoadTier::Image(_)) && self.image.is_none()
    }
}

/// Completion callback. Invoked on a pipeline worker thread; consumers
/// marshal to their own display thread.
pub type LoadCallback = Arc<dyn Fn(&LoadEvent) + Send + Sync>;

/// Returns whether the gallery slot of a request is still on screen.
/// Must be fast and side-effect free.
pub type VisibilityGate = Arc<dyn Fn(&LoadRequest) -> bool + Send + Sync>;

/// A request to load one tier of a photo.
#[derive(Clone)]
pub struct LoadRequest {
    photo: Arc<Photo>,
    tier: LoadTier,
    /// Longest side the consumer displays the image at, 0 when unknown.
    display_size: u32,
    callback: Option<LoadCallback>,
    gate: Option<VisibilityGate>,
    enqueued_at: Instant,
}

impl LoadRequest {
    pub fn new(photo: Arc<Photo>, tier: LoadTier) -> Self {
        Self {
            photo,
            tier,
            display_size: 0,
            callback: None,
            gate: None,
            enqueued_at: Instant::now(),
        }
    }

    pub fn image(photo: Arc<Photo>, quality: ImageQuality) -> Self {
        Self::new(photo, LoadTier::Image(quality))
    }

    pub fn exif(photo: Arc<Photo>) -> Self {
        Self::new(photo, LoadTier::Exif)
    }

    pub fn associations(photo: Arc<Photo>) -> Self {
        Self::new(photo, LoadTier::SqlAssociation)
    }

    pub fn with_display_size(mut self, size: u32) -> Self {
        self.display_size = size;
        self
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&LoadEvent) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn with_shared_callback(mut self, callback: LoadCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_gate<F>(mut self, gate: F) -> Self
    where
        F: Fn(&LoadRequest) -> bool + Send + Sync + 'static,
    {
        self.gate = Some(Arc::new(gate));
        self
    }

    pub fn with_shared_gate(mut self, gate: VisibilityGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn photo(&self) -> &Arc<Photo> {
        &self.photo
    }

    pub fn tier(&self) -> LoadTier {
        self.tier
    }

    pub fn quality(&self) -> Option<ImageQuality> {
        self.tier.quality()
    }

    pub fn display_size(&self) -> u32 {
        self.display_size
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// No gate means always visible.
    pub fn is_visible(&self) -> bool {
        self.gate.as_ref().map_or(true, |gate| gate(self))
    }

    /// Same photo, callback and gate at another quality.
    pub fn escalate(&self, quality: ImageQuality) -> Self {
        Self {
            photo: Arc::clone(&self.photo),
            tier: LoadTier::Image(quality),
            display_size: self.display_size,
            callback: self.callback.clone(),
            gate: self.gate.clone(),
            enqueued_at: Instant::now(),
        }
    }

    pub(crate) fn notify(&self, image: Option<Arc<DecodedImage>>, update_ui: bool) {
        if let Some(callback) = &self.callback {
            callback(&LoadEvent {
                photo: Arc::clone(&self.photo),
                tier: self.tier,
                image,
                update_ui,
            });
        }
    }
}

impl fmt::Debug for LoadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadRequest")
            .field("path", &self.photo.path())
            .field("tier", &self.tier)
            .field("display_size", &self.display_size)
            .field("has_callback", &self.callback.is_some())
            .field("has_gate", &self.gate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    fn photo() -> Arc<Photo> {
        Arc::new(Photo::new(PathBuf::from("/p/a.jpg"), 1, 1))
    }

    #[test]
    fn test_missing_gate_is_visible() {
        let req = LoadRequest::image(photo(), ImageQuality::Thumb);
        assert!(req.is_visible());

        let hidden = req.clone().with_gate(|_| false);
        assert!(!hidden.is_visible());
    }

    #[test]
    fn test_escalation_keeps_callback_and_gate() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let req = LoadRequest::image(photo(), ImageQuality::Thumb)
            .with_display_size(300)
            .with_gate(|req| req.display_size() == 300)
            .with_callback(move |event| sink.lock().push(event.quality()));

        let hq = req.escalate(ImageQuality::HighQuality);
        assert_eq!(hq.quality(), Some(ImageQuality::HighQuality));
        assert_eq!(hq.display_size(), 300);
        assert!(hq.is_visible());

        hq.notify(None, true);
        assert_eq!(*seen.lock(), vec![Some(ImageQuality::HighQuality)]);
    }

    #[test]
    fn test_broken_event() {
        let event = LoadEvent {
            photo: photo(),
            tier: LoadTier::Image(ImageQuality::Thumb),
            image: None,
            update_ui: true,
        };
        assert!(event.is_broken());

        let exif = LoadEvent {
            tier: LoadTier::Exif,
            ..event
        };
        assert!(!exif.is_broken());
    }
}
