//! File analysis contract.
//!
//! The analyzer computes the intrinsic metadata of a file: its content key
//! plus whatever attributes a signature policy needs to pick a certificate.

use crate::identity::{hash_file, ContentKey};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Intrinsic metadata of a file's bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub content_key: ContentKey,
    pub file_name: String,
    pub size: u64,
    /// Already carries a signature; policies normally skip these.
    #[serde(default)]
    pub already_signed: bool,
    /// Free-form attributes (executable type, target framework, ...)
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl FileMetadata {
    pub fn new(content_key: ContentKey, file_name: impl Into<String>) -> Self {
        Self {
            content_key,
            file_name: file_name.into(),
            size: content_key.length(),
            already_signed: false,
            attributes: BTreeMap::new(),
        }
    }

    /// Lowercased extension of the file name, without the dot
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.file_name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    }
}

/// Computes metadata for a file on disk.
#[async_trait]
pub trait FileAnalyzer: Send + Sync {
    async fn analyze(&self, path: &Path) -> anyhow::Result<FileMetadata>;
}

/// Analyzer that only hashes content; never reports a file as already signed.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentAnalyzer;

#[async_trait]
impl FileAnalyzer for ContentAnalyzer {
    async fn analyze(&self, path: &Path) -> anyhow::Result<FileMetadata> {
        let content_key = hash_file(path)
            .await
            .with_context(|| format!("Failed to hash {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(FileMetadata::new(content_key, file_name))
    }
}
