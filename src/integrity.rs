//! Content integrity metadata recorded by the packer.
//!
//! Each file entry may carry a SHA-256 of the whole file plus one SHA-256 per `block_size` chunk.
//! Verification streams the file once and checks both.

use std::{io::Read, str::FromStr};

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unsupported hash algorithm {0:?}")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for HashAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, UnknownAlgorithm> {
        match s {
            "SHA256" => Ok(HashAlgorithm::Sha256),
            _ => Err(UnknownAlgorithm(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Integrity {
    pub algorithm: HashAlgorithm,
    /// Lowercase hex digest of the whole file.
    pub hash: String,
    pub block_size: u32,
    /// Lowercase hex digest of each block, in order.
    pub blocks: Vec<String>,
}

/// Which part of the content failed to match.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    #[error("block {0} hash mismatch")]
    Block(usize),
    #[error("expected {expected} blocks, found {found}")]
    BlockCount { expected: usize, found: usize },
    #[error("file hash mismatch")]
    Whole,
}

impl Integrity {
    /// Computes the integrity block for `data`.
    pub fn compute(data: &[u8], block_size: u32) -> Self {
        let blocks = data
            .chunks(block_size as usize)
            .map(|chunk| hex::encode(Sha256::digest(chunk)))
            .collect();
        Integrity {
            algorithm: HashAlgorithm::Sha256,
            hash: hex::encode(Sha256::digest(data)),
            block_size,
            blocks,
        }
    }

    /// Checks everything `reader` yields against the recorded hashes.
    pub fn verify(&self, reader: &mut impl Read) -> std::io::Result<Result<(), Mismatch>> {
        let mut whole = Sha256::new();
        let block_size = u64::from(self.block_size);
        let mut block = Vec::with_capacity(self.block_size as usize);
        let mut n_blocks = 0;

        loop {
            block.clear();
            let filled = (&mut *reader).take(block_size).read_to_end(&mut block)?;
            if filled == 0 {
                break;
            }
            let chunk = block.as_slice();
            whole.update(chunk);

            match self.blocks.get(n_blocks) {
                Some(expected) if eq_hex(expected, &Sha256::digest(chunk)) => {}
                Some(_) => return Ok(Err(Mismatch::Block(n_blocks))),
                None => {
                    return Ok(Err(Mismatch::BlockCount {
                        expected: self.blocks.len(),
                        found: n_blocks + 1,
                    }))
                }
            }
            n_blocks += 1;

            if (filled as u64) < block_size {
                break;
            }
        }

        // Some packers record a single hash of the empty string for empty files.
        let empty_with_block = n_blocks == 0
            && self.blocks.len() == 1
            && eq_hex(&self.blocks[0], &Sha256::digest(b""));
        if n_blocks != self.blocks.len() && !empty_with_block {
            return Ok(Err(Mismatch::BlockCount {
                expected: self.blocks.len(),
                found: n_blocks,
            }));
        }
        if !eq_hex(&self.hash, &whole.finalize()) {
            return Ok(Err(Mismatch::Whole));
        }
        Ok(Ok(()))
    }
}

fn eq_hex(expected: &str, digest: &[u8]) -> bool {
    expected.eq_ignore_ascii_case(&hex::encode(digest))
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_algorithm() {
        assert_eq!("SHA256".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Sha256));
        let err = "MD5".parse::<HashAlgorithm>().unwrap_err();
        assert_eq!(err, UnknownAlgorithm("MD5".to_string()));
        assert_eq!(err.to_string(), "Unsupported hash algorithm \"MD5\"");
        assert_eq!(
            Mismatch::BlockCount {
                expected: 2,
                found: 1
            }
            .to_string(),
            "expected 2 blocks, found 1"
        );
    }

    /// Hands out one byte per call, like a pipe under pressure.
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let Some((first, rest)) = self.0.split_first() else {
                return Ok(0);
            };
            match buf.first_mut() {
                Some(slot) => {
                    *slot = *first;
                    self.0 = rest;
                    Ok(1)
                }
                None => Ok(0),
            }
        }
    }

    #[test]
    fn test_short_reads() {
        let data = b"0123456789abcdef";
        let integrity = Integrity::compute(data, 5);
        assert_eq!(integrity.verify(&mut Trickle(data)).unwrap(), Ok(()));
    }

    #[test]
    fn test_compute() {
        let integrity = Integrity::compute(b"hello world", 4);
        assert_eq!(
            integrity.hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(integrity.blocks.len(), 3);
        assert_eq!(integrity.blocks[2], hex::encode(Sha256::digest(b"rld")));
    }

    #[test]
    fn test_verify() {
        let data = b"0123456789abcdef";
        for block_size in [1, 4, 5, 16, 1024] {
            let integrity = Integrity::compute(data, block_size);
            assert_eq!(integrity.verify(&mut &data[..]).unwrap(), Ok(()));
        }

        let integrity = Integrity::compute(data, 4);
        assert_eq!(
            integrity.verify(&mut &b"0123X56789abcdef"[..]).unwrap(),
            Err(Mismatch::Block(1))
        );
        assert_eq!(
            integrity.verify(&mut &data[..12]).unwrap(),
            Err(Mismatch::BlockCount {
                expected: 4,
                found: 3
            })
        );
        assert_eq!(
            integrity.verify(&mut &b"0123456789abcdefgh"[..]).unwrap(),
            Err(Mismatch::BlockCount {
                expected: 4,
                found: 5
            })
        );

        let mut tampered = integrity.clone();
        tampered.hash = hex::encode(Sha256::digest(b"other"));
        assert_eq!(tampered.verify(&mut &data[..]).unwrap(), Err(Mismatch::Whole));

        // uppercase digests are accepted
        let mut upper = integrity.clone();
        upper.hash = upper.hash.to_uppercase();
        assert_eq!(upper.verify(&mut &data[..]).unwrap(), Ok(()));
    }

    #[test]
    fn test_empty() {
        let integrity = Integrity::compute(b"", 4);
        assert!(integrity.blocks.is_empty());
        assert_eq!(integrity.verify(&mut &b""[..]).unwrap(), Ok(()));

        let mut one_block = integrity.clone();
        one_block.blocks = vec![integrity.hash.clone()];
        assert_eq!(one_block.verify(&mut &b""[..]).unwrap(), Ok(()));
    }
}
