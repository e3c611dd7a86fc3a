//! Layered configuration loading.
//!
//! Precedence: built-in defaults (lowest) -> `<root>/nestsign.toml` ->
//! environment `NESTSIGN__SECTION__KEY` (highest).

use super::{
    default_discovery_concurrency, default_max_batch_size, default_max_concurrent_batches,
    NestsignConfig,
};
use crate::error::Result;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use std::path::Path;
use tracing::debug;

pub const CONFIG_FILE_NAME: &str = "nestsign.toml";

/// Configuration loader facade.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load `<root>/nestsign.toml` (if present) with the environment overlay.
    pub fn load(root: &Path) -> Result<NestsignConfig> {
        let path = root.join(CONFIG_FILE_NAME);
        debug!(path = %path.display(), exists = path.exists(), "Loading configuration");
        let builder = builder_with_defaults()?
            .add_source(File::from(path).format(FileFormat::Toml).required(false));
        finish(builder)
    }

    /// Load a specific file (which must exist) with the environment overlay.
    pub fn load_from_file(path: &Path) -> Result<NestsignConfig> {
        debug!(path = %path.display(), "Loading configuration file");
        let builder = builder_with_defaults()?
            .add_source(File::from(path).format(FileFormat::Toml).required(true));
        finish(builder)
    }

    /// Create default configuration.
    pub fn default() -> NestsignConfig {
        NestsignConfig::default()
    }
}

fn builder_with_defaults() -> std::result::Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("signing.max_batch_size", default_max_batch_size() as u64)?
        .set_default(
            "signing.max_concurrent_batches",
            default_max_concurrent_batches() as u64,
        )?
        .set_default(
            "signing.discovery_concurrency",
            default_discovery_concurrency() as u64,
        )?
        .set_default("signing.keep_workspace", false)?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")?
        .set_default("logging.output", "stderr")
}

fn finish(builder: ConfigBuilder<DefaultState>) -> Result<NestsignConfig> {
    let config: NestsignConfig = builder
        .add_source(
            Environment::with_prefix("NESTSIGN")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    config.validate()?;
    Ok(config)
}
