//! Error types for the load pipeline.
//!
//! Workers never propagate these out of a pool thread. They are logged and
//! turned into a loading-state transition or a metadata fallback.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    /// Corrupt or unsupported image. Memoized, never retried automatically.
    #[error("Decode error for {path:?}: {message}")]
    Decode { path: PathBuf, message: String },

    /// A decoded thumbnail could not be written to the thumbnail store.
    #[error("Failed to persist thumbnail for {path:?}: {message}")]
    Persist { path: PathBuf, message: String },

    /// EXIF/header parsing failed; the photo falls back to its mtime.
    #[error("Metadata extraction failed for {path:?}: {message}")]
    Metadata { path: PathBuf, message: String },

    /// Tour association lookup failed.
    #[error("Association lookup failed for {path:?}: {message}")]
    Association { path: PathBuf, message: String },
}

impl LoadError {
    pub fn decode(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        LoadError::Decode {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn persist(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        LoadError::Persist {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn metadata(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        LoadError::Metadata {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn association(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        LoadError::Association {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

pub type LoadResult<T> = Result<T, LoadError>;
