use std::fmt;

/// Decode targets for a photo, ordered from cheapest to most detailed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ImageQuality {
    Thumb,
    ThumbHighQuality,
    HighQuality,
    Original,
}

impl ImageQuality {
    pub const ALL: [ImageQuality; 4] = [
        ImageQuality::Thumb,
        ImageQuality::ThumbHighQuality,
        ImageQuality::HighQuality,
        ImageQuality::Original,
    ];

    /// Position in the per-photo loading state table.
    pub fn index(self) -> usize {
        match self {
            ImageQuality::Thumb => 0,
            ImageQuality::ThumbHighQuality => 1,
            ImageQuality::HighQuality => 2,
            ImageQuality::Original => 3,
        }
    }

    /// The stage whose queue and workers handle this quality.
    pub fn stage(self) -> Stage {
        match self {
            ImageQuality::Thumb => Stage::Thumbnail,
            ImageQuality::ThumbHighQuality | ImageQuality::HighQuality => Stage::HighQuality,
            ImageQuality::Original => Stage::Original,
        }
    }

    /// Originals are kept apart from resized images so a few huge bitmaps
    /// cannot push every thumbnail out of memory.
    pub fn is_original(self) -> bool {
        self == ImageQuality::Original
    }

    pub fn name(self) -> &'static str {
        match self {
            ImageQuality::Thumb => "thumb",
            ImageQuality::ThumbHighQuality => "thumb-hq",
            ImageQuality::HighQuality => "hq",
            ImageQuality::Original => "original",
        }
    }
}

impl fmt::Display for ImageQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One pipeline phase with its own queue and worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Exif,
    Thumbnail,
    HighQuality,
    Original,
    SqlAssociation,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Exif,
        Stage::Thumbnail,
        Stage::HighQuality,
        Stage::Original,
        Stage::SqlAssociation,
    ];

    /// Bulk-triggered stages serve the most recent request first, the
    /// scroll position moves faster than the backlog drains.
    pub fn discipline(self) -> QueueDiscipline {
        match self {
            Stage::Exif | Stage::SqlAssociation => QueueDiscipline::Lifo,
            Stage::Thumbnail | Stage::HighQuality | Stage::Original => QueueDiscipline::Fifo,
        }
    }

    /// Whether workers consult the visibility gate before decoding.
    pub fn is_gated(self) -> bool {
        matches!(self, Stage::Thumbnail | Stage::HighQuality | Stage::Original)
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Exif => "exif",
            Stage::Thumbnail => "thumb",
            Stage::HighQuality => "hq",
            Stage::Original => "original",
            Stage::SqlAssociation => "sql",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDiscipline {
    /// Most recently requested first.
    Lifo,
    /// First requested first.
    Fifo,
}

/// What a request loads: a decoded image, the photo metadata, or the
/// photo's tour associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadTier {
    Image(ImageQuality),
    Exif,
    SqlAssociation,
}

impl LoadTier {
    pub fn stage(self) -> Stage {
        match self {
            LoadTier::Image(quality) => quality.stage(),
            LoadTier::Exif => Stage::Exif,
            LoadTier::SqlAssociation => Stage::SqlAssociation,
        }
    }

    pub fn quality(self) -> Option<ImageQuality> {
        match self {
            LoadTier::Image(quality) => Some(quality),
            _ => None,
        }
    }
}

impl fmt::Display for LoadTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadTier::Image(quality) => quality.fmt(f),
            LoadTier::Exif => f.write_str("exif"),
            LoadTier::SqlAssociation => f.write_str("sql"),
        }
    }
}
