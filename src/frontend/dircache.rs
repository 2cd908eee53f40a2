//! Per-image directory cache (§4.4, §5).
//!
//! Maps an internal inode to its already-unioned child listing, so a repeated `readdir`/`lookup`
//! against the same in-image directory doesn't re-run the union walk. One cache per image,
//! independent of the Namespace Model's lock; population races are benign (the last writer
//! wins), matching `backhand::FilesystemReader`'s own `RwLock<Cache>` for block decompression.

use std::collections::HashMap;
use std::ffi::OsString;
use std::sync::RwLock;

use crate::image::FileType;

#[derive(Debug, Clone)]
pub struct CachedChild {
    pub inode: u64,
    pub file_type: FileType,
}

#[derive(Default)]
pub struct DirCache {
    entries: RwLock<HashMap<u64, Vec<(OsString, CachedChild)>>>,
}

impl DirCache {
    pub fn get(&self, inode: u64) -> Option<Vec<(OsString, CachedChild)>> {
        self.entries.read().unwrap().get(&inode).cloned()
    }

    /// Installs a freshly computed listing. If another thread raced and installed one first,
    /// this one simply overwrites it — both are equally valid computations of the same
    /// immutable union, so there is no correctness issue in letting the last writer win.
    pub fn put(&self, inode: u64, listing: Vec<(OsString, CachedChild)>) {
        self.entries.write().unwrap().insert(inode, listing);
    }

    /// Drops any cached listing for `inode`, used when a scan records a new runtime union
    /// against it.
    pub fn invalidate(&self, inode: u64) {
        self.entries.write().unwrap().remove(&inode);
    }
}
