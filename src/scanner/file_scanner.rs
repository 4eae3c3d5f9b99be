//! Folder scanner producing the photo files a gallery shows.
//!
//! This module provides the `FileScanner` struct which handles:
//! - Recursive directory walks using walkdir
//! - Photo detection by file extension
//! - File size and modification time capture
//! - Progress reporting via channels

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::loader::decode::is_supported_extension;
use crate::models::PhotoFile;

/// Configuration for the file scanner.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Whether to scan directories recursively.
    pub recursive: bool,
    /// Maximum directory depth (0 = unlimited).
    pub max_depth: usize,
    /// Whether to follow symbolic links.
    pub follow_symlinks: bool,
    /// Whether to include dot files and dot directories.
    pub include_hidden: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            recursive: true,
            max_depth: 0, // unlimited
            follow_symlinks: false,
            include_hidden: false,
        }
    }
}

/// Progress information sent during scanning.
#[derive(Debug, Clone)]
pub enum ScanProgress {
    Started { path: PathBuf },
    /// Running count of photos found so far.
    Discovered { count: usize },
    FileError { path: PathBuf, error: String },
    Completed { total: usize, errors: usize },
}

/// Result of a completed scan.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Photos found, sorted by path.
    pub files: Vec<PhotoFile>,
    /// Number of entries that could not be read.
    pub error_count: usize,
}

/// How often `Discovered` progress is reported.
const PROGRESS_EVERY: usize = 256;

pub struct FileScanner {
    config: ScanConfig,
}

impl FileScanner {
    pub fn new() -> Self {
        Self {
            config: ScanConfig::default(),
        }
    }

    pub fn with_config(config: ScanConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Scans a folder on the blocking pool.
    pub async fn scan(&self, dir: &Path) -> Result<ScanResult> {
        let dir = dir.to_path_buf();
        let config = self.config.clone();

        task::spawn_blocking(move || Self::scan_sync(&dir, &config, None))
            .await
            .context("Scan task panicked")?
    }

    /// Scans a folder with progress reporting via a channel.
    ///
    /// Returns a receiver for progress updates and a handle to await the
    /// result.
    pub fn scan_with_progress(
        &self,
        dir: PathBuf,
    ) -> (
        mpsc::Receiver<ScanProgress>,
        task::JoinHandle<Result<ScanResult>>,
    ) {
        let config = self.config.clone();
        let (tx, rx) = mpsc::channel(100);

        let handle = task::spawn_blocking(move || Self::scan_sync(&dir, &config, Some(tx)));

        // Flatten the join error into the scan result
        let wrapped = task::spawn(async move { handle.await.context("Scan task panicked")? });

        (rx, wrapped)
    }

    /// Walks a folder on the calling thread.
    pub fn discover(&self, dir: &Path) -> Result<ScanResult> {
        Self::scan_sync(dir, &self.config, None)
    }

    fn scan_sync(
        dir: &Path,
        config: &ScanConfig,
        progress: Option<mpsc::Sender<ScanProgress>>,
    ) -> Result<ScanResult> {
        let report = |event: ScanProgress| {
            if let Some(tx) = &progress {
                let _ = tx.blocking_send(event);
            }
        };

        if !dir.is_dir() {
            anyhow::bail!("Not a directory: {:?}", dir);
        }

        info!("Starting scan of {:?}", dir);
        report(ScanProgress::Started {
            path: dir.to_path_buf(),
        });

        let mut walker = WalkDir::new(dir).follow_links(config.follow_symlinks);
        if !config.recursive {
            walker = walker.max_depth(1);
        } else if config.max_depth > 0 {
            walker = walker.max_depth(config.max_depth);
        }

        let include_hidden = config.include_hidden;
        let mut result = ScanResult::default();

        let entries = walker
            .into_iter()
            .filter_entry(|e| include_hidden || e.depth() == 0 || !is_hidden(e.file_name()));

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    warn!("Failed to read {:?}: {}", path, e);
                    report(ScanProgress::FileError {
                        path,
                        error: e.to_string(),
                    });
                    result.error_count += 1;
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                continue;
            }

            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !is_supported_extension(ext) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("Failed to read metadata for {:?}: {}", path, e);
                    report(ScanProgress::FileError {
                        path: path.to_path_buf(),
                        error: e.to_string(),
                    });
                    result.error_count += 1;
                    continue;
                }
            };

            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);

            result
                .files
                .push(PhotoFile::new(path.to_path_buf(), metadata.len() as i64, mtime));

            if result.files.len() % PROGRESS_EVERY == 0 {
                report(ScanProgress::Discovered {
                    count: result.files.len(),
                });
            }
        }

        // Sort by path for consistent ordering
        result.files.sort_by(|a, b| a.path.cmp(&b.path));

        debug!(errors = result.error_count, "Walk finished");
        info!("Scan complete: {} photos", result.files.len());
        report(ScanProgress::Discovered {
            count: result.files.len(),
        });
        report(ScanProgress::Completed {
            total: result.files.len(),
            errors: result.error_count,
        });

        Ok(result)
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|s| s.starts_with('.'))
}
