//! Deduplicator
//!
//! Maps content keys to the first location they were seen at and, once
//! signed, to the signed copy. Every unique content is registered once at
//! discovery time and signed at most once; later occurrences reuse the
//! signed bytes instead of calling the signing backend again.

use crate::error::{Result, SigningError};
use crate::identity::ContentKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
struct DedupEntry {
    original: PathBuf,
    signed: Option<PathBuf>,
}

/// Outcome of an atomic registration attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The caller is the first to see this content.
    Registered,
    /// Someone else registered it first; this is where it lives.
    AlreadyRegistered { original: PathBuf },
}

/// Content-addressed registry scoped to one signing run
#[derive(Debug, Default)]
pub struct Deduplicator {
    entries: RwLock<HashMap<ContentKey, DedupEntry>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-insert under a single write lock.
    ///
    /// Concurrent claimants of the same key are serialized here: exactly one
    /// observes `Registered`, all others get the winner's path.
    pub fn claim(&self, key: ContentKey, path: &Path) -> Claim {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&key) {
            debug!(
                content_key = %key.short(),
                path = %path.display(),
                original = %existing.original.display(),
                "Content already registered"
            );
            return Claim::AlreadyRegistered {
                original: existing.original.clone(),
            };
        }
        entries.insert(
            key,
            DedupEntry {
                original: path.to_path_buf(),
                signed: None,
            },
        );
        Claim::Registered
    }

    /// Register the first-seen location of a content key.
    ///
    /// Fails with `DuplicateRegistration` if the key is already known.
    pub fn register_file(&self, key: ContentKey, path: &Path) -> Result<()> {
        match self.claim(key, path) {
            Claim::Registered => Ok(()),
            Claim::AlreadyRegistered { original } => Err(SigningError::DuplicateRegistration {
                key,
                existing: original,
            }),
        }
    }

    pub fn try_get_registered_file(&self, key: &ContentKey) -> Option<PathBuf> {
        self.entries.read().get(key).map(|e| e.original.clone())
    }

    pub fn try_get_signed_version(&self, key: &ContentKey) -> Option<PathBuf> {
        self.entries.read().get(key).and_then(|e| e.signed.clone())
    }

    /// Record where the signed copy of a content key lives.
    ///
    /// Called once per unique content after a successful sign.
    pub fn register_signed_file(&self, key: ContentKey, signed_path: &Path) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&key)
            .ok_or(SigningError::UnregisteredContent { key })?;
        if entry.signed.is_some() {
            return Err(SigningError::DuplicateSignedRegistration { key });
        }
        entry.signed = Some(signed_path.to_path_buf());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number of registered contents that have a signed version
    pub fn signed_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| e.signed.is_some())
            .count()
    }
}
