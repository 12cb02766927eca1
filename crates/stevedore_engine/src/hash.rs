//! Content hashing capability.
//!
//! One streaming hasher per configured algorithm: sha256 for collision
//! resistance, xxhash64/xxhash3 for throughput. The worker only requires
//! that source and destination digests come from the same algorithm.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use stevedore_protocol::HashAlgorithm;
use xxhash_rust::xxh3::Xxh3;
use xxhash_rust::xxh64::Xxh64;

/// Streaming hasher over the configured algorithm.
pub enum ContentHasher {
    Sha256(Sha256),
    Xxh64(Xxh64),
    Xxh3(Box<Xxh3>),
}

impl ContentHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Xxhash64 => Self::Xxh64(Xxh64::new(0)),
            HashAlgorithm::Xxhash3 => Self::Xxh3(Box::new(Xxh3::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(data),
            Self::Xxh64(hasher) => hasher.update(data),
            Self::Xxh3(hasher) => hasher.update(data),
        }
    }

    /// Finish and return the lowercase hex digest.
    pub fn finish(self) -> String {
        match self {
            Self::Sha256(hasher) => format!("{:x}", hasher.finalize()),
            Self::Xxh64(hasher) => format!("{:016x}", hasher.digest()),
            Self::Xxh3(hasher) => format!("{:016x}", hasher.digest()),
        }
    }
}

/// Hash a file by streaming it through the configured algorithm.
pub fn hash_file(
    path: &Path,
    algorithm: HashAlgorithm,
    buffer_size: usize,
) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = ContentHasher::new(algorithm);
    let mut buf = vec![0u8; buffer_size.max(1)];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finish())
}
