//! Content Identity
//!
//! A `ContentKey` names a byte sequence independently of where it lives on disk.
//! Two files with the same key are the same signing unit: the key is the blake3
//! digest of the bytes together with their length.

use crate::types::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 64 * 1024;

/// Canonical identity of a file's bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentKey {
    digest: Hash,
    length: u64,
}

impl ContentKey {
    pub fn new(digest: Hash, length: u64) -> Self {
        Self { digest, length }
    }

    /// Compute the key of an in-memory buffer
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = ContentHasher::new();
        hasher.update(bytes);
        hasher.finalize()
    }

    pub fn digest(&self) -> &Hash {
        &self.digest
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// First 12 hex characters of the digest, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.digest[..6])
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.digest), self.length)
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({}..:{})", self.short(), self.length)
    }
}

/// Incremental hasher producing a `ContentKey`
pub struct ContentHasher {
    hasher: blake3::Hasher,
    length: u64,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentHasher {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            length: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.length += bytes.len() as u64;
    }

    pub fn finalize(&self) -> ContentKey {
        ContentKey::new(*self.hasher.finalize().as_bytes(), self.length)
    }
}

/// Hash everything a reader yields
pub async fn hash_reader<R>(reader: &mut R) -> std::io::Result<ContentKey>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hasher.finalize())
}

/// Hash a file on disk without loading it into memory
pub async fn hash_file(path: &Path) -> std::io::Result<ContentKey> {
    let mut file = tokio::fs::File::open(path).await?;
    hash_reader(&mut file).await
}
