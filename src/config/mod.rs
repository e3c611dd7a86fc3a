//! Configuration
//!
//! `NestsignConfig` is assembled by `ConfigLoader` from defaults, an optional
//! `nestsign.toml` and `NESTSIGN__SECTION__KEY` environment variables.

mod loader;

pub use crate::logging::LoggingConfig;
pub use loader::ConfigLoader;

use crate::error::{Result, SigningError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestsignConfig {
    #[serde(default)]
    pub signing: SigningConfiguration,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NestsignConfig {
    pub fn validate(&self) -> Result<()> {
        self.signing.validate()
    }
}

/// Signing policy knobs; read-only for the duration of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningConfiguration {
    /// Certificate pool handed to signature policies
    #[serde(default)]
    pub certificate_pool: Option<String>,

    /// Lowercase file extension -> certificate name
    #[serde(default)]
    pub certificates: BTreeMap<String, String>,

    /// File names that never get a certificate: exact names or `*suffix`
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Parent directory of the per-run extraction workspace
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Keep extracted entries after the run
    #[serde(default)]
    pub keep_workspace: bool,

    /// Max targets per signing-provider call; 0 means one batch per round
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,

    /// Minimum delay between two batch dispatches
    #[serde(default)]
    pub batch_spacing_ms: Option<u64>,

    /// Containers expanded concurrently during discovery
    #[serde(default = "default_discovery_concurrency")]
    pub discovery_concurrency: usize,
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

pub(crate) fn default_max_batch_size() -> usize {
    64
}

pub(crate) fn default_max_concurrent_batches() -> usize {
    4
}

pub(crate) fn default_discovery_concurrency() -> usize {
    4
}

impl Default for SigningConfiguration {
    fn default() -> Self {
        Self {
            certificate_pool: None,
            certificates: BTreeMap::new(),
            exclude: Vec::new(),
            temp_dir: default_temp_dir(),
            keep_workspace: false,
            max_batch_size: default_max_batch_size(),
            max_concurrent_batches: default_max_concurrent_batches(),
            batch_spacing_ms: None,
            discovery_concurrency: default_discovery_concurrency(),
        }
    }
}

impl SigningConfiguration {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_batches == 0 {
            return Err(SigningError::Config(
                "signing.max_concurrent_batches must be at least 1".to_string(),
            ));
        }
        if self.discovery_concurrency == 0 {
            return Err(SigningError::Config(
                "signing.discovery_concurrency must be at least 1".to_string(),
            ));
        }
        if let Some(bad) = self.certificates.keys().find(|ext| {
            ext.starts_with('.') || ext.chars().any(|c| c.is_ascii_uppercase())
        }) {
            return Err(SigningError::Config(format!(
                "signing.certificates key '{}' must be a lowercase extension without a dot",
                bad
            )));
        }
        Ok(())
    }

    /// Whether a file name matches one of the `exclude` patterns.
    pub fn is_excluded(&self, file_name: &str) -> bool {
        let name = file_name.to_ascii_lowercase();
        self.exclude.iter().any(|pattern| {
            let pattern = pattern.to_ascii_lowercase();
            match pattern.strip_prefix('*') {
                Some(suffix) => name.ends_with(suffix),
                None => name == pattern,
            }
        })
    }
}
