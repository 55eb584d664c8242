//! A parsed asar archive bound to its open file.
//!
//! [`Archive`] answers metadata queries from the in-memory index and reads file contents with
//! positioned reads on a shared file handle, so a single instance can serve any number of threads
//! without further locking.
//!
//! Two sets of operations are offered:
//!
//!  - the [`ArchiveOps`] trait, where every failure collapses into `None`.  This is the interface
//!    consumed by host bindings, which only distinguish "found" from "not found".
//!  - the inherent `try_*` methods, which report what went wrong as an [`ArchiveError`].

use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
};

use log::{debug, trace};
use parking_lot::Mutex;
use rustix::fs::{fchmod, Mode};
use thiserror::Error;

use crate::{
    header::{read_header, HeaderError},
    integrity::Mismatch,
    tree::{normalize, FileEntry, Kind, LookupError, NodeId, Resolved, Tree},
    util::{copy_range, RangeReader},
};

/// Appended to the archive's file name to form the side-store directory of unpacked files.
pub const UNPACKED_SUFFIX: &str = ".unpacked";

const TEMPFILE_PREFIX: &str = "asar-";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("Is a directory: {0:?}")]
    IsADirectory(String),
    #[error("Integrity check failed for {path:?}: {mismatch}")]
    IntegrityMismatch { path: String, mismatch: Mismatch },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Raw addressing data of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    /// Absolute offset of the contents within the archive file.  Meaningless if `unpacked`.
    pub offset: u64,
    pub unpacked: bool,
    pub executable: bool,
}

/// What a path behaves as, in the manner of `stat(2)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub size: u64,
    pub offset: u64,
    pub is_file: bool,
    pub is_directory: bool,
    /// Set whenever at least one link was followed, alongside the final kind.
    pub is_link: bool,
}

/// The operations exposed to host bindings.
///
/// Paths are virtual paths relative to the archive root.  None of these operations fail loudly:
/// any error is reported as `None`.
pub trait ArchiveOps {
    /// The real path of the archive file.
    fn path(&self) -> &Path;

    fn file_info(&self, path: &str) -> Option<FileInfo>;

    fn stat(&self, path: &str) -> Option<Stats>;

    /// Names in the directory at `path`, in index order.
    fn readdir(&self, path: &str) -> Option<Vec<String>>;

    /// Returns a real path holding the contents of the file at `path`.
    ///
    /// Packed files are copied into a new temporary file which the caller is responsible for
    /// removing.  Unpacked files are returned in place.
    fn copy_file_out(&self, path: &str) -> Option<PathBuf>;
}

#[derive(Debug)]
pub struct Archive {
    path: PathBuf,
    file: File,
    base_offset: u64,
    tree: Tree,
    /// Files previously copied out, by node.
    extracted: Mutex<HashMap<NodeId, PathBuf>>,
}

impl Archive {
    /// Opens the archive at `path` and decodes its index.
    ///
    /// The path is kept as given: normalizing it is up to the caller.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        debug!("opening asar archive {path:?}");
        let file = File::open(&path)?;
        let header = read_header(&file)?;

        Ok(Archive {
            path,
            file,
            base_offset: header.base_offset,
            tree: header.tree,
            extracted: Mutex::new(HashMap::new()),
        })
    }

    /// Absolute offset of the payload region within the archive file.
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// The directory holding this archive's unpacked files.
    pub fn unpacked_dir(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(UNPACKED_SUFFIX);
        self.path.with_file_name(name)
    }

    fn resolve_file(&self, path: &str) -> Result<(Resolved, &FileEntry)> {
        let resolved = self.tree.resolve(path)?;
        match self.tree.kind(resolved.id) {
            Kind::File(entry) => Ok((resolved, entry)),
            _ => Err(ArchiveError::IsADirectory(path.to_string())),
        }
    }

    /// Where an unpacked file lives in the side-store.
    fn unpacked_path(&self, id: NodeId) -> PathBuf {
        let virtual_path = self.tree.path_of(id);
        let mut real = self.unpacked_dir();
        // path_of() only yields names validated when the index was decoded
        real.extend(normalize(&virtual_path).unwrap_or_default());
        real
    }

    pub fn try_file_info(&self, path: &str) -> Result<FileInfo> {
        let (_, entry) = self.resolve_file(path)?;
        Ok(FileInfo {
            size: entry.size,
            offset: self.base_offset + entry.offset,
            unpacked: entry.unpacked,
            executable: entry.executable,
        })
    }

    pub fn try_stat(&self, path: &str) -> Result<Stats> {
        let resolved = self.tree.resolve(path)?;
        let is_link = resolved.link_hops > 0;

        Ok(match self.tree.kind(resolved.id) {
            Kind::File(entry) => Stats {
                size: entry.size,
                offset: self.base_offset + entry.offset,
                is_file: true,
                is_link,
                ..Default::default()
            },
            Kind::Directory(_) => Stats {
                is_directory: true,
                is_link,
                ..Default::default()
            },
            Kind::Link(_) => unreachable!("resolve() follows links"),
        })
    }

    pub fn try_readdir(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .tree
            .children(path)?
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    pub fn try_copy_file_out(&self, path: &str) -> Result<PathBuf> {
        let (resolved, entry) = self.resolve_file(path)?;

        if entry.unpacked {
            let real = self.unpacked_path(resolved.id);
            trace!("{path:?} is unpacked at {real:?}");
            return Ok(real);
        }

        if let Some(previous) = self.extracted.lock().get(&resolved.id) {
            if previous.exists() {
                trace!("{path:?} already extracted to {previous:?}");
                return Ok(previous.clone());
            }
        }

        // Dynamic loaders and mime sniffing look at the extension.
        let name = self.tree.node(resolved.id).name.as_ref();
        let suffix = match Path::new(name).extension() {
            Some(ext) => format!(".{}", ext.to_string_lossy()),
            None => String::new(),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMPFILE_PREFIX)
            .suffix(&suffix)
            .tempfile()?;

        copy_range(
            &self.file,
            self.base_offset + entry.offset,
            entry.size,
            tmp.as_file_mut(),
        )?;
        if entry.executable {
            fchmod(tmp.as_file(), Mode::from_raw_mode(0o755)).map_err(std::io::Error::from)?;
        }

        let (_, new_path) = tmp.keep().map_err(|err| err.error)?;
        debug!(
            "extracted {path:?} ({} bytes) to {new_path:?}",
            entry.size
        );
        self.extracted.lock().insert(resolved.id, new_path.clone());
        Ok(new_path)
    }

    /// Checks the contents of the file at `path` against the integrity data in the index.
    ///
    /// Files without integrity data pass trivially.
    pub fn verify(&self, path: &str) -> Result<()> {
        let (resolved, entry) = self.resolve_file(path)?;
        let Some(integrity) = &entry.integrity else {
            trace!("{path:?} has no integrity data");
            return Ok(());
        };

        let outcome = if entry.unpacked {
            let mut file = File::open(self.unpacked_path(resolved.id))?;
            integrity.verify(&mut file)?
        } else {
            let mut reader =
                RangeReader::new(&self.file, self.base_offset + entry.offset, entry.size);
            integrity.verify(&mut reader)?
        };

        outcome.map_err(|mismatch| ArchiveError::IntegrityMismatch {
            path: path.to_string(),
            mismatch,
        })
    }
}

/// Collapses an error into `None`, leaving a trace of it in the debug log.
fn absent<T>(op: &str, path: &str, result: Result<T>) -> Option<T> {
    result
        .map_err(|err| debug!("{op}({path:?}): {err}"))
        .ok()
}

impl ArchiveOps for Archive {
    fn path(&self) -> &Path {
        &self.path
    }

    fn file_info(&self, path: &str) -> Option<FileInfo> {
        absent("file_info", path, self.try_file_info(path))
    }

    fn stat(&self, path: &str) -> Option<Stats> {
        absent("stat", path, self.try_stat(path))
    }

    fn readdir(&self, path: &str) -> Option<Vec<String>> {
        absent("readdir", path, self.try_readdir(path))
    }

    fn copy_file_out(&self, path: &str) -> Option<PathBuf> {
        absent("copy_file_out", path, self.try_copy_file_out(path))
    }
}

#[cfg(test)]
mod test {
    use std::{fs, io::Write};

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        header::encode_index,
        test::{tempdir, ArchiveBuilder},
    };

    #[test]
    fn test_unpacked_dir() {
        let dir = tempdir();
        let path = dir.path().join("app.asar");
        ArchiveBuilder::new().write(&path).unwrap();

        let archive = Archive::open(&path).unwrap();
        assert_eq!(archive.unpacked_dir(), dir.path().join("app.asar.unpacked"));
        assert_eq!(archive.path(), path.as_path());
    }

    #[test]
    fn test_open_errors() {
        let dir = tempdir();

        let missing = dir.path().join("missing.asar");
        assert!(matches!(Archive::open(&missing), Err(ArchiveError::Io(_))));

        let empty = dir.path().join("empty.asar");
        File::create(&empty).unwrap();
        assert!(matches!(
            Archive::open(&empty),
            Err(ArchiveError::Header(HeaderError::CorruptHeader(_)))
        ));

        // header size pointing past the end of the file
        let truncated = dir.path().join("truncated.asar");
        let mut file = File::create(&truncated).unwrap();
        file.write_all(&[4, 0, 0, 0, 0xff, 0, 0, 0, 1, 2, 3]).unwrap();
        assert!(matches!(
            Archive::open(&truncated),
            Err(ArchiveError::Header(HeaderError::CorruptHeader(_)))
        ));
    }

    #[test]
    fn test_offset_out_of_range() {
        let dir = tempdir();
        let cases = [
            r#"{"files":{"f":{"size":1,"offset":"18446744073709551615"}}}"#,
            r#"{"files":{"f":{"size":18446744073709551615,"offset":"0"}}}"#,
            r#"{"files":{"d":{"files":{"u":{"size":1,"offset":"18446744073709551615","unpacked":true}}}}}"#,
        ];
        for (n, json) in cases.into_iter().enumerate() {
            let path = dir.path().join(format!("{n}.asar"));
            fs::write(&path, encode_index(json)).unwrap();
            match Archive::open(&path) {
                Err(ArchiveError::Header(HeaderError::InvalidEntry { path, .. })) => {
                    assert!(path == "f" || path == "d/u", "{path}")
                }
                other => panic!("{json} should be rejected, got {other:?}"),
            }
        }

        // offsets past the end of the file still decode; only reads fail
        let path = dir.path().join("edge.asar");
        let bytes = encode_index(r#"{"files":{"f":{"size":0,"offset":"1000"}}}"#);
        let base_offset = bytes.len() as u64;
        fs::write(&path, bytes).unwrap();
        let archive = Archive::open(&path).unwrap();
        assert_eq!(archive.stat("f").unwrap().offset, base_offset + 1000);
    }

    #[test]
    fn test_base_offset() {
        let dir = tempdir();
        let path = dir.path().join("app.asar");
        let mut builder = ArchiveBuilder::new();
        builder.file("a", b"xyz");
        builder.write(&path).unwrap();

        let archive = Archive::open(&path).unwrap();
        let len = fs::metadata(&path).unwrap().len();
        assert_eq!(archive.base_offset(), len - 3);
        assert_eq!(archive.try_file_info("a").unwrap().offset, len - 3);
    }

    #[test]
    fn test_extract_cache() {
        let dir = tempdir();
        let path = dir.path().join("app.asar");
        let mut builder = ArchiveBuilder::new();
        builder.file("lib/native.node", b"\x7fELF");
        builder.link("alias.node", "lib/native.node");
        builder.write(&path).unwrap();
        let archive = Archive::open(&path).unwrap();

        let first = archive.try_copy_file_out("lib/native.node").unwrap();
        assert_eq!(first.extension().unwrap(), "node");
        assert_eq!(fs::read(&first).unwrap(), b"\x7fELF");

        // the same node, reached directly or through a link, reuses the extraction
        assert_eq!(archive.try_copy_file_out("lib/native.node").unwrap(), first);
        assert_eq!(archive.try_copy_file_out("alias.node").unwrap(), first);

        // ... unless the caller removed it
        fs::remove_file(&first).unwrap();
        let second = archive.try_copy_file_out("lib/native.node").unwrap();
        assert_eq!(fs::read(&second).unwrap(), b"\x7fELF");
        fs::remove_file(&second).unwrap();
    }
}
