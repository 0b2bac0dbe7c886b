//! Reader pins on on-disk files.
//!
//! A download of a file holds a [`Pin`] for its path. Deleting a time-shift
//! entry checks [`PinTable::is_pinned`] and defers the unlink while any pin
//! remains.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Default)]
pub struct PinTable {
    counts: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl PinTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(&self, path: impl Into<PathBuf>) -> Pin {
        let path = path.into();
        *self.counts.lock().entry(path.clone()).or_insert(0) += 1;
        Pin {
            path,
            counts: Arc::clone(&self.counts),
        }
    }

    pub fn is_pinned(&self, path: &Path) -> bool {
        self.count(path) > 0
    }

    pub fn count(&self, path: &Path) -> usize {
        self.counts.lock().get(path).copied().unwrap_or(0)
    }
}

/// Held for as long as a reader streams the path.
#[derive(Debug)]
pub struct Pin {
    path: PathBuf,
    counts: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl Pin {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        let mut counts = self.counts.lock();
        if let Some(n) = counts.get_mut(&self.path) {
            *n -= 1;
            if *n == 0 {
                counts.remove(&self.path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pins_count_and_release() {
        let table = PinTable::new();
        let path = Path::new("/srv/live/seg_1.m4s");
        let a = table.pin(path);
        let b = table.pin(path);
        assert_eq!(table.count(path), 2);
        drop(a);
        assert!(table.is_pinned(path));
        drop(b);
        assert!(!table.is_pinned(path));
    }
}
