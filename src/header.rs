//! Decoding of the asar index block.
//!
//! An asar archive starts with two Chromium-style "pickles".  The first one is exactly 8 bytes
//! long and carries the size of the second one, which holds the JSON index as a length-prefixed
//! string.  The payload region starts right after the second pickle.
//!
//! ```text
//! 0          4              8          12          16            16+N      8+header_size
//! +----------+--------------+----------+-----------+--------------+-----+----------------
//! | 4 (u32)  | header_size  | pickle   | N (i32)   | JSON index   | pad | payload ...
//! |          |   (u32)      | len (u32)|           | (N bytes)    |     |
//! +----------+--------------+----------+-----------+--------------+-----+----------------
//! ```
//!
//! All integers are little-endian.

use std::{fs::File, io::ErrorKind};

use log::{debug, trace, warn};
use serde_json::{Map, Value};
use thiserror::Error;
use zerocopy::{
    little_endian::{I32, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

use crate::{
    integrity::{HashAlgorithm, Integrity},
    tree::{FileEntry, NodeId, Tree, TreeBuilder},
    util::pread_exact,
};

/// Payload length recorded in the leading size pickle.
const SIZE_PICKLE_PAYLOAD: u32 = 4;

/// Largest integrity block size accepted.  The packer uses 4 MiB.
const MAX_INTEGRITY_BLOCK_SIZE: u32 = 64 << 20;

/// The leading pickle: its own payload length (always 4) and the byte length of the index pickle.
#[derive(Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct SizePickle {
    pub payload_size: U32,
    pub header_size: U32,
}

/// Fixed part of the index pickle, followed by `string_len` bytes of JSON.
#[derive(Debug, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct IndexPickleHeader {
    pub payload_size: U32,
    pub string_len: I32,
}

#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("Corrupt archive header: {0}")]
    CorruptHeader(String),
    #[error("Invalid entry {path:?}: {reason}")]
    InvalidEntry { path: String, reason: &'static str },
}

type HeaderResult<T> = Result<T, HeaderError>;

fn corrupt(reason: impl Into<String>) -> HeaderError {
    HeaderError::CorruptHeader(reason.into())
}

fn invalid(path: &str, reason: &'static str) -> HeaderError {
    HeaderError::InvalidEntry {
        path: path.to_string(),
        reason,
    }
}

/// A decoded index: the path tree and the absolute offset of the payload region.
#[derive(Debug)]
pub struct Header {
    pub tree: Tree,
    pub base_offset: u64,
}

/// Reads and decodes the index of the archive open as `file`.
///
/// Only the two pickles at the start of the file are read.
pub fn read_header(file: &File) -> HeaderResult<Header> {
    let file_len = file
        .metadata()
        .map_err(|err| corrupt(format!("cannot stat archive: {err}")))?
        .len();

    let mut prefix = [0u8; size_of::<SizePickle>()];
    pread_exact(file, &mut prefix, 0).map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof => corrupt("file too short for size prefix"),
        _ => corrupt(format!("cannot read size prefix: {err}")),
    })?;
    let header_size = parse_size_pickle(&prefix)?;

    let base_offset = prefix.len() as u64 + header_size as u64;
    if base_offset > file_len {
        return Err(corrupt(format!(
            "index size {header_size} exceeds file length {file_len}"
        )));
    }

    let mut index = vec![0u8; header_size as usize];
    pread_exact(file, &mut index, prefix.len() as u64)
        .map_err(|err| corrupt(format!("cannot read index: {err}")))?;

    let tree = decode_index(&index)?;
    check_ranges(&tree, base_offset)?;
    debug!(
        "decoded asar index: {} bytes, {} nodes, payload at {base_offset}",
        header_size,
        tree.node_count()
    );
    Ok(Header { tree, base_offset })
}

/// Rejects entries whose absolute payload range does not fit in a `u64`.
fn check_ranges(tree: &Tree, base_offset: u64) -> HeaderResult<()> {
    for (path, entry) in tree.files() {
        let start = base_offset.checked_add(entry.offset);
        let end = match entry.unpacked {
            true => start,
            false => start.and_then(|start| start.checked_add(entry.size)),
        };
        if end.is_none() {
            return Err(invalid(&path, "offset out of range"));
        }
    }
    Ok(())
}

/// Decodes the 8-byte size pickle, returning the length of the index pickle.
pub fn parse_size_pickle(bytes: &[u8]) -> HeaderResult<u32> {
    let (pickle, _) =
        SizePickle::ref_from_prefix(bytes).map_err(|_| corrupt("file too short for size prefix"))?;
    if pickle.payload_size.get() != SIZE_PICKLE_PAYLOAD {
        return Err(corrupt(format!(
            "bad size pickle payload length {}",
            pickle.payload_size.get()
        )));
    }
    Ok(pickle.header_size.get())
}

/// Extracts the JSON string from the index pickle, validating the pickle framing.
pub fn index_json(index: &[u8]) -> HeaderResult<&[u8]> {
    let (header, rest) = IndexPickleHeader::ref_from_prefix(index)
        .map_err(|_| corrupt("index block too short"))?;

    let payload_size = header.payload_size.get() as usize;
    if payload_size > index.len() - size_of::<U32>() {
        return Err(corrupt(format!(
            "index pickle payload {payload_size} exceeds index block"
        )));
    }

    let string_len = usize::try_from(header.string_len.get())
        .map_err(|_| corrupt("negative index string length"))?;
    if string_len > rest.len() || string_len + size_of::<I32>() > payload_size {
        return Err(corrupt(format!(
            "index string length {string_len} exceeds pickle payload"
        )));
    }

    Ok(&rest[..string_len])
}

/// Decodes a complete index pickle into a path tree.
pub fn decode_index(index: &[u8]) -> HeaderResult<Tree> {
    let json = index_json(index)?;
    let root: Value =
        serde_json::from_slice(json).map_err(|err| corrupt(format!("malformed index: {err}")))?;

    let mut builder = TreeBuilder::new();
    match root {
        Value::Object(ref obj) => decode_directory(&mut builder, NodeId::ROOT, "", obj)?,
        _ => return Err(invalid("", "root is not an object")),
    }
    Ok(builder.build())
}

fn decode_directory(
    builder: &mut TreeBuilder,
    dir: NodeId,
    path: &str,
    obj: &Map<String, Value>,
) -> HeaderResult<()> {
    let Some(Value::Object(files)) = obj.get("files") else {
        return Err(invalid(path, "directory without children mapping"));
    };

    for (name, value) in files {
        let child_path = if path.is_empty() {
            name.clone()
        } else {
            format!("{path}/{name}")
        };
        if !valid_name(name) {
            return Err(invalid(&child_path, "invalid file name"));
        }
        let Value::Object(node) = value else {
            return Err(invalid(&child_path, "entry is not an object"));
        };
        trace!("index entry {child_path:?}");

        if node.contains_key("files") {
            let id = builder.add_directory(dir, name);
            decode_directory(builder, id, &child_path, node)?;
        } else if let Some(target) = node.get("link") {
            let Value::String(target) = target else {
                return Err(invalid(&child_path, "link target is not a string"));
            };
            builder.add_link(dir, name, target);
        } else if node.contains_key("size") {
            let entry = decode_file(&child_path, node)?;
            builder.add_file(dir, name, entry);
        } else {
            return Err(invalid(&child_path, "entry is not a file, directory or link"));
        }
    }
    Ok(())
}

fn valid_name(name: &str) -> bool {
    !(name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']))
}

fn decode_file(path: &str, node: &Map<String, Value>) -> HeaderResult<FileEntry> {
    let size = match node.get("size") {
        Some(Value::Number(n)) => n.as_u64(),
        _ => None,
    }
    .ok_or_else(|| invalid(path, "missing or negative size"))?;

    let unpacked = flag(path, node, "unpacked")?;
    let executable = flag(path, node, "executable")?;

    // The packer writes offsets as decimal strings since they may exceed 2^53.
    let offset = match node.get("offset") {
        Some(Value::String(s)) => s.parse::<u64>().ok(),
        Some(Value::Number(n)) => n.as_u64(),
        None if unpacked => Some(0),
        _ => None,
    }
    .ok_or_else(|| invalid(path, "missing or negative offset"))?;

    let integrity = match node.get("integrity") {
        Some(value) => decode_integrity(path, value)?,
        None => None,
    };

    Ok(FileEntry {
        size,
        offset,
        unpacked,
        executable,
        integrity,
    })
}

fn flag(path: &str, node: &Map<String, Value>, key: &str) -> HeaderResult<bool> {
    match node.get(key) {
        None => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(invalid(path, "flag is not a boolean")),
    }
}

fn decode_integrity(path: &str, value: &Value) -> HeaderResult<Option<Integrity>> {
    let Value::Object(obj) = value else {
        return Err(invalid(path, "integrity is not an object"));
    };

    let algorithm = match obj.get("algorithm").and_then(Value::as_str) {
        Some(name) => match name.parse::<HashAlgorithm>() {
            Ok(algorithm) => algorithm,
            Err(err) => {
                warn!("{path}: {err}, ignoring integrity data");
                return Ok(None);
            }
        },
        None => return Err(invalid(path, "integrity without algorithm")),
    };

    let hash = obj
        .get("hash")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(path, "integrity without hash"))?;

    let block_size = obj
        .get("blockSize")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| (1..=MAX_INTEGRITY_BLOCK_SIZE).contains(n))
        .ok_or_else(|| invalid(path, "integrity without valid blockSize"))?;

    let blocks = match obj.get("blocks") {
        Some(Value::Array(blocks)) => blocks
            .iter()
            .map(|b| b.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| invalid(path, "integrity block hash is not a string"))?,
        _ => return Err(invalid(path, "integrity without blocks")),
    };

    Ok(Some(Integrity {
        algorithm,
        hash: hash.to_string(),
        block_size,
        blocks,
    }))
}

/// Frames a JSON index the way the asar packer does: size pickle, then the index pickle padded
/// to a 4-byte boundary.
#[cfg(any(test, feature = "test"))]
pub fn encode_index(json: &str) -> Vec<u8> {
    let string_len = json.len();
    let padded = string_len.next_multiple_of(4);
    let payload_size = size_of::<I32>() + padded;
    let header_size = size_of::<U32>() + payload_size;

    let size_pickle = SizePickle {
        payload_size: SIZE_PICKLE_PAYLOAD.into(),
        header_size: (header_size as u32).into(),
    };
    let index_header = IndexPickleHeader {
        payload_size: (payload_size as u32).into(),
        string_len: (string_len as i32).into(),
    };

    let mut out = Vec::with_capacity(size_of::<SizePickle>() + header_size);
    out.extend_from_slice(size_pickle.as_bytes());
    out.extend_from_slice(index_header.as_bytes());
    out.extend_from_slice(json.as_bytes());
    out.resize(size_of::<SizePickle>() + header_size, 0);
    out
}
