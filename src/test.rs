//! Test utilities for asarfs.
//!
//! This module provides helpers for writing tests: temporary directory allocation and an
//! [`ArchiveBuilder`] producing archives in the same layout as the asar packer.

use std::{
    fs::{create_dir_all, write},
    io,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

use crate::{archive::UNPACKED_SUFFIX, header::encode_index, integrity::Integrity};

static TMPDIR: Lazy<PathBuf> = Lazy::new(|| {
    let base: PathBuf = if let Some(path) = std::env::var_os("ASARFS_TEST_TMPDIR") {
        eprintln!("temporary directory from $ASARFS_TEST_TMPDIR: {path:?}");
        path.into()
    } else {
        std::env::temp_dir()
    };
    // archive paths are canonicalized, so keep test paths comparable with them
    std::fs::canonicalize(&base).unwrap_or(base)
});

/// Allocate a temporary directory.
pub fn tempdir() -> TempDir {
    TempDir::with_prefix_in("asarfs-test-", TMPDIR.as_path()).unwrap()
}

/// Builds an archive in memory.
///
/// Paths use `/` as separator; intermediate directories are created on demand.  Packed files are
/// laid out in the payload in the order they are added.
#[derive(Debug, Default)]
pub struct ArchiveBuilder {
    root: Map<String, Value>,
    payload: Vec<u8>,
    unpacked: Vec<(String, Vec<u8>)>,
}

fn files_of(dir: &mut Map<String, Value>) -> &mut Map<String, Value> {
    dir.entry("files")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .expect("\"files\" is not an object")
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        let mut builder = Self::default();
        files_of(&mut builder.root);
        builder
    }

    fn insert(&mut self, path: &str, node: Value) -> &mut Self {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let (name, parents) = segments.split_last().expect("empty path");

        let mut dir = &mut self.root;
        for parent in parents {
            let next = files_of(dir)
                .entry(parent.to_string())
                .or_insert_with(|| json!({"files": {}}));
            dir = next.as_object_mut().expect("parent is not a directory");
        }
        files_of(dir).insert(name.to_string(), node);
        self
    }

    fn packed(&mut self, contents: &[u8]) -> Map<String, Value> {
        let offset = self.payload.len();
        self.payload.extend_from_slice(contents);
        let mut node = Map::new();
        node.insert("size".into(), json!(contents.len()));
        node.insert("offset".into(), json!(offset.to_string()));
        node
    }

    /// Adds an empty directory.
    pub fn dir(&mut self, path: &str) -> &mut Self {
        self.insert(path, json!({"files": {}}))
    }

    pub fn file(&mut self, path: &str, contents: &[u8]) -> &mut Self {
        let node = self.packed(contents);
        self.insert(path, Value::Object(node))
    }

    pub fn executable(&mut self, path: &str, contents: &[u8]) -> &mut Self {
        let mut node = self.packed(contents);
        node.insert("executable".into(), json!(true));
        self.insert(path, Value::Object(node))
    }

    /// Adds a packed file along with its integrity block.
    pub fn file_with_integrity(
        &mut self,
        path: &str,
        contents: &[u8],
        block_size: u32,
    ) -> &mut Self {
        let integrity = Integrity::compute(contents, block_size);
        self.file_with_given_integrity(path, contents, &integrity)
    }

    /// Adds a packed file with an arbitrary (possibly wrong) integrity block.
    pub fn file_with_given_integrity(
        &mut self,
        path: &str,
        contents: &[u8],
        integrity: &Integrity,
    ) -> &mut Self {
        let mut node = self.packed(contents);
        node.insert(
            "integrity".into(),
            json!({
                "algorithm": "SHA256",
                "hash": integrity.hash,
                "blockSize": integrity.block_size,
                "blocks": integrity.blocks,
            }),
        );
        self.insert(path, Value::Object(node))
    }

    /// Adds a file stored in the side-store rather than in the payload.
    pub fn unpacked(&mut self, path: &str, contents: &[u8]) -> &mut Self {
        self.unpacked.push((path.to_string(), contents.to_vec()));
        self.insert(path, json!({"size": contents.len(), "unpacked": true}))
    }

    pub fn link(&mut self, path: &str, target: &str) -> &mut Self {
        self.insert(path, json!({"link": target}))
    }

    pub fn index_json(&self) -> String {
        Value::Object(self.root.clone()).to_string()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = encode_index(&self.index_json());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Writes the archive to `path`, and any unpacked files next to it.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        write(path, self.to_bytes())?;

        let mut side_store = path.as_os_str().to_os_string();
        side_store.push(UNPACKED_SUFFIX);
        let side_store = PathBuf::from(side_store);
        for (name, contents) in &self.unpacked {
            let real = side_store.join(name);
            if let Some(parent) = real.parent() {
                create_dir_all(parent)?;
            }
            write(real, contents)?;
        }
        Ok(())
    }
}
