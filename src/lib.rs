//! Staged, concurrent image loading for photo galleries.
//!
//! A [`LoadManager`] accepts load requests for photos at one of several
//! quality tiers (thumbnail, display-fitted thumbnail, high quality,
//! original) plus metadata and tour-association lookups. Each tier has its
//! own queue and worker pool; decoded images land in LRU caches and results
//! are delivered through per-request callbacks.

pub mod cache;
pub mod config;
pub mod error;
pub mod loader;
pub mod models;
pub mod pipeline;
pub mod scanner;

pub use config::{DecodeBackend, LoaderConfig, LoaderConfigBuilder};
pub use error::{LoadError, LoadResult};
pub use models::{ImageQuality, LoadTier, LoadingState, Photo, PhotoFile, Stage};
pub use pipeline::{Enqueued, LoadEvent, LoadManager, LoadRequest};
