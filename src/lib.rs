//! Read-only access to asar archives.
//!
//! An asar archive is a single file holding a JSON index of a directory tree, followed by the
//! contents of every file in that tree, back to back.  This crate parses the index once per
//! archive and per process, and answers filesystem-like queries against it:
//!
//! ```no_run
//! use asarfs::{create_archive, ArchiveOps};
//!
//! let archive = create_archive("resources/app.asar").expect("not an asar archive");
//! if let Some(stats) = archive.stat("node_modules/foo/package.json") {
//!     println!("{} bytes", stats.size);
//! }
//! for name in archive.readdir("").unwrap_or_default() {
//!     println!("{name}");
//! }
//! // tools which need a real file get a copy
//! let real = archive.copy_file_out("bin/tool");
//! ```
//!
//! Files marked as "unpacked" in the index live in a directory next to the archive named after
//! it with [`UNPACKED_SUFFIX`] appended, mirroring the tree.

pub mod archive;
pub mod factory;
pub mod header;
pub mod integrity;
pub mod tree;
mod util;

#[cfg(any(test, feature = "test"))]
pub mod test;

pub use archive::{Archive, ArchiveError, ArchiveOps, FileInfo, Stats, UNPACKED_SUFFIX};
pub use factory::{create_archive, ArchiveFactory};
