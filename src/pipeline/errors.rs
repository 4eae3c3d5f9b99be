//! Memo of photos that failed to load.
//!
//! Entries are never expired; only an explicit administrative clear removes
//! them, so a corrupt file is decoded at most once per clear.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info};

pub struct ErrorRegistry {
    name: &'static str,
    failed: RwLock<HashSet<PathBuf>>,
}

impl ErrorRegistry {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            failed: RwLock::new(HashSet::new()),
        }
    }

    /// Returns true when the path was not yet recorded.
    pub fn mark_failed(&self, path: &Path) -> bool {
        let inserted = self.failed.write().insert(path.to_path_buf());
        if inserted {
            debug!(registry = self.name, ?path, "Recorded failure");
        }
        inserted
    }

    pub fn is_failed(&self, path: &Path) -> bool {
        self.failed.read().contains(path)
    }

    /// Empties the registry, returning how many entries were removed.
    pub fn clear_all(&self) -> usize {
        let removed = std::mem::take(&mut *self.failed.write()).len();
        info!(registry = self.name, removed, "Cleared failure registry");
        removed
    }

    pub fn len(&self) -> usize {
        self.failed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.failed.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_clear() {
        let registry = ErrorRegistry::new("test");
        let path = Path::new("/p/broken.jpg");

        assert!(!registry.is_failed(path));
        assert!(registry.mark_failed(path));
        assert!(!registry.mark_failed(path));
        assert!(registry.is_failed(path));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.clear_all(), 1);
        assert!(registry.is_empty());
        assert!(!registry.is_failed(path));
    }
}
