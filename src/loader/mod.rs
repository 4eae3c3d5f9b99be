//! Work performed inside pipeline workers.
//!
//! This module provides:
//! - `ImageDecoder` / `FileDecoder` - file to bitmap at a target size
//! - `MetadataParser` / `HeaderMetadataParser` - photo metadata
//! - `AssociationSource` / `SqliteAssociationStore` - tour links

pub mod association;
pub mod decode;
pub mod metadata;

pub use association::{AssociationSource, SqliteAssociationStore};
pub use decode::{DecodeJob, FileDecoder, ImageDecoder};
pub use metadata::{HeaderMetadataParser, MetadataParser};
