//! Container handlers
//!
//! A container is any file that embeds other files (archives, installers,
//! packages). Handlers stream the entries out of a container and write an
//! updated container once some entries have been replaced by signed copies.
//! The core never interprets container bytes; `ContainerMetadata` is threaded
//! from `read_entries` back to `write_container` untouched.

mod registry;

pub use registry::HandlerRegistry;

use crate::identity::ContentKey;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncRead;

/// One entry streamed out of a container
pub struct ContainerEntry {
    /// Relative path inside the container, `/`-separated
    pub entry_path: String,
    pub content: Pin<Box<dyn AsyncRead + Send>>,
    /// Precomputed content key, when the container format stores one.
    /// Lets duplicates be recognised without extracting them.
    pub content_key: Option<ContentKey>,
}

impl ContainerEntry {
    pub fn new(entry_path: impl Into<String>, content: impl AsyncRead + Send + 'static) -> Self {
        Self {
            entry_path: entry_path.into(),
            content: Box::pin(content),
            content_key: None,
        }
    }

    /// Entry backed by an in-memory buffer; its key is computed eagerly.
    pub fn from_bytes(entry_path: impl Into<String>, bytes: Vec<u8>) -> Self {
        let key = ContentKey::of_bytes(&bytes);
        Self {
            entry_path: entry_path.into(),
            content: Box::pin(Cursor::new(bytes)),
            content_key: Some(key),
        }
    }

    pub fn with_content_key(mut self, key: ContentKey) -> Self {
        self.content_key = Some(key);
        self
    }
}

impl fmt::Debug for ContainerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerEntry")
            .field("entry_path", &self.entry_path)
            .field("content_key", &self.content_key)
            .finish_non_exhaustive()
    }
}

pub type EntryStream = BoxStream<'static, anyhow::Result<ContainerEntry>>;

/// Container-level attributes needed to repack losslessly
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub format: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ContainerMetadata {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            attributes: BTreeMap::new(),
        }
    }
}

/// Entry to write back into a container: its path inside the container and
/// the file holding its (possibly signed) bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepackEntry {
    pub entry_path: String,
    pub content_path: PathBuf,
}

/// Reads and rewrites one container format.
#[async_trait]
pub trait ContainerHandler: Send + Sync {
    /// Stable name stored on container nodes
    fn name(&self) -> &str;

    fn can_handle(&self, path: &Path) -> bool;

    async fn read_entries(&self, path: &Path)
        -> anyhow::Result<(ContainerMetadata, EntryStream)>;

    /// Write a container to `destination` holding `entries`, using `source`
    /// (the current container) for anything not listed.
    async fn write_container(
        &self,
        destination: &Path,
        source: &Path,
        entries: &[RepackEntry],
        metadata: &ContainerMetadata,
    ) -> anyhow::Result<()>;
}
