//! Process-wide registry of opened archives.
//!
//! Every archive is decoded at most once per process: the first successful
//! [`ArchiveFactory::get_or_create()`] for a path inserts the [`Archive`], and every later call
//! for the same file, however it is spelled (relative, through `..` or through symlinks), gets the
//! same shared instance.  Archives are never evicted.
//!
//! Failures are not remembered.  A path that could not be opened or decoded is tried again on the
//! next call.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use log::{debug, trace};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::archive::{Archive, Result};

/// Turns `path` into the form used as a cache key: the canonical absolute path of the file.
///
/// Fails if the file does not exist, in which case it could not be opened either.
pub fn normalize_archive_path(path: &Path) -> io::Result<PathBuf> {
    fs::canonicalize(path)
}

#[derive(Debug, Default)]
pub struct ArchiveFactory {
    archives: Mutex<HashMap<PathBuf, Arc<Archive>>>,
    decodes: AtomicUsize,
}

impl ArchiveFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared archive for `path`, opening and decoding it if this is the first time.
    ///
    /// The lock is held while decoding, so concurrent callers for the same path wait for the
    /// first one and then share its result.
    pub fn try_get_or_create(&self, path: impl AsRef<Path>) -> Result<Arc<Archive>> {
        let key = normalize_archive_path(path.as_ref())?;

        let mut archives = self.archives.lock();
        if let Some(archive) = archives.get(&key) {
            trace!("archive cache hit for {key:?}");
            return Ok(Arc::clone(archive));
        }

        debug!("archive cache miss for {key:?}");
        let archive = Arc::new(Archive::open(key.clone())?);
        self.decodes.fetch_add(1, Ordering::Relaxed);
        archives.insert(key, Arc::clone(&archive));
        Ok(archive)
    }

    /// Like [`Self::try_get_or_create()`] but maps any failure to `None`.
    pub fn get_or_create(&self, path: impl AsRef<Path>) -> Option<Arc<Archive>> {
        let path = path.as_ref();
        self.try_get_or_create(path)
            .map_err(|err| debug!("cannot open archive {path:?}: {err}"))
            .ok()
    }

    /// Whether an archive for `path` has been successfully created.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        match normalize_archive_path(path.as_ref()) {
            Ok(key) => self.archives.lock().contains_key(&key),
            Err(_) => false,
        }
    }

    /// The number of archives held.
    pub fn len(&self) -> usize {
        self.archives.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times an archive index has been decoded by this factory.
    pub fn decode_count(&self) -> usize {
        self.decodes.load(Ordering::Relaxed)
    }
}

static GLOBAL_FACTORY: Lazy<ArchiveFactory> = Lazy::new(ArchiveFactory::new);

/// The factory shared by the whole process.
pub fn global() -> &'static ArchiveFactory {
    &GLOBAL_FACTORY
}

/// Opens `path` through the process-wide factory.
pub fn create_archive(path: impl AsRef<Path>) -> Option<Arc<Archive>> {
    GLOBAL_FACTORY.get_or_create(path)
}
