//! Logging System
//!
//! Structured logging through the `tracing` crate. The library only emits
//! events; embedding applications call `init_logging` once to install a
//! subscriber with the configured level, format and destinations.

use crate::error::{Result, SigningError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Resolve the log file path: `NESTSIGN_LOG_FILE`, then config, then the
/// platform state directory.
pub fn resolve_log_file_path(config_file: Option<PathBuf>) -> Result<PathBuf> {
    if let Ok(env_path) = std::env::var("NESTSIGN_LOG_FILE") {
        if !env_path.is_empty() {
            return Ok(PathBuf::from(env_path));
        }
    }
    if let Some(p) = config_file {
        if !p.as_os_str().is_empty() {
            return Ok(p);
        }
    }
    default_log_file_path()
}

fn default_log_file_path() -> Result<PathBuf> {
    let project_dirs = directories::ProjectDirs::from("", "nestsign", "nestsign").ok_or_else(|| {
        SigningError::Config("Could not determine platform directories for log file".to_string())
    })?;
    let dir = project_dirs
        .state_dir()
        .unwrap_or_else(|| project_dirs.data_local_dir());
    Ok(dir.join("nestsign.log"))
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `false` installs a subscriber that drops everything
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Default level for every target (`off` silences the run)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `text` or `json`
    #[serde(default = "default_format")]
    pub format: String,

    /// `stderr`, `stdout`, `both`, `file` or `file+stderr`
    #[serde(default = "default_output")]
    pub output: String,

    /// Explicit log file; the platform state directory is used when unset
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Enable colored output (text format only, not for files)
    #[serde(default = "default_true")]
    pub color: bool,

    /// Per-target overrides, e.g. `nestsign::orchestrator = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "text".to_string()
}

fn default_output() -> String {
    "stderr".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            level: default_log_level(),
            format: default_format(),
            output: default_output(),
            file: None,
            color: default_true(),
            modules: HashMap::new(),
        }
    }
}

/// Install the global subscriber.
///
/// Precedence:
/// 1. Environment variables (NESTSIGN_LOG, NESTSIGN_LOG_FORMAT, ...)
/// 2. `config`
/// 3. Defaults
///
/// Returns a configuration error if a subscriber is already installed.
pub fn init_logging(config: Option<&LoggingConfig>) -> Result<()> {
    let disabled = config.map(|c| !c.enabled).unwrap_or(false);
    if disabled {
        return Registry::default()
            .with(EnvFilter::new("off"))
            .with(fmt::layer().with_writer(std::io::sink))
            .try_init()
            .map_err(already_installed);
    }

    let filter = build_env_filter(config)?;
    let json = determine_format(config)? == "json";
    let output = determine_output(config)?;
    let use_color = config.map(|c| c.color).unwrap_or(true) && !output.file;
    let writer = build_writer(&output, config.and_then(|c| c.file.clone()))?;

    let base_subscriber = Registry::default().with(filter);
    let installed = if json {
        base_subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(writer),
            )
            .try_init()
    } else {
        base_subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(use_color)
                    .with_writer(writer),
            )
            .try_init()
    };
    installed.map_err(already_installed)
}

fn already_installed(e: impl std::fmt::Display) -> SigningError {
    SigningError::Config(format!("Failed to install log subscriber: {}", e))
}

fn build_writer(output: &OutputDestinations, config_file: Option<PathBuf>) -> Result<BoxMakeWriter> {
    if output.file {
        let file = Arc::new(open_log_file(config_file)?);
        return Ok(if output.stderr {
            BoxMakeWriter::new(file.and(std::io::stderr))
        } else {
            BoxMakeWriter::new(file)
        });
    }
    Ok(match (output.stdout, output.stderr) {
        (true, true) => BoxMakeWriter::new(std::io::stdout.and(std::io::stderr)),
        (false, true) => BoxMakeWriter::new(std::io::stderr),
        _ => BoxMakeWriter::new(std::io::stdout),
    })
}

fn open_log_file(config_file: Option<PathBuf>) -> Result<std::fs::File> {
    let log_file = resolve_log_file_path(config_file)?;
    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            SigningError::Config(format!("Failed to create log directory: {}", e))
        })?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .map_err(|e| SigningError::Config(format!("Failed to open log file {:?}: {}", log_file, e)))
}

/// `NESTSIGN_LOG` wins; otherwise the configured level plus per-target overrides.
fn build_env_filter(config: Option<&LoggingConfig>) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_env("NESTSIGN_LOG") {
        return Ok(filter);
    }

    let level = config.map(|c| c.level.as_str()).unwrap_or("info");
    if level == "off" {
        return Ok(EnvFilter::new("off"));
    }

    let mut filter = EnvFilter::new(level);

    if let Some(config) = config {
        for (module, module_level) in &config.modules {
            let directive = format!("{}={}", module, module_level);
            filter = filter.add_directive(
                directive
                    .parse()
                    .map_err(|e| SigningError::Config(format!("Invalid log directive: {}", e)))?,
            );
        }
    }

    if let Ok(modules_str) = std::env::var("NESTSIGN_LOG_MODULES") {
        for directive in parse_module_directives(&modules_str) {
            filter = filter.add_directive(directive.parse().map_err(|e| {
                SigningError::Config(format!("Invalid log directive from env: {}", e))
            })?);
        }
    }

    Ok(filter)
}

/// `"a=debug, b = trace"` -> `["a=debug", "b=trace"]`; malformed pairs are dropped.
fn parse_module_directives(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|pair| {
            let (module, level) = pair.split_once('=')?;
            let (module, level) = (module.trim(), level.trim());
            if module.is_empty() || level.is_empty() || level.contains('=') {
                return None;
            }
            Some(format!("{}={}", module, level))
        })
        .collect()
}

fn determine_format(config: Option<&LoggingConfig>) -> Result<String> {
    if let Ok(format) = std::env::var("NESTSIGN_LOG_FORMAT") {
        if format == "json" || format == "text" {
            return Ok(format);
        }
    }

    let format = config.map(|c| c.format.as_str()).unwrap_or("text");
    if format != "json" && format != "text" {
        return Err(SigningError::Config(format!(
            "Invalid log format: {} (must be 'json' or 'text')",
            format
        )));
    }
    Ok(format.to_string())
}

/// Output destinations
#[derive(Debug, PartialEq, Eq)]
struct OutputDestinations {
    stdout: bool,
    stderr: bool,
    file: bool,
}

fn determine_output(config: Option<&LoggingConfig>) -> Result<OutputDestinations> {
    if let Ok(output) = std::env::var("NESTSIGN_LOG_OUTPUT") {
        return parse_output_destinations(&output);
    }
    let output = config.map(|c| c.output.as_str()).unwrap_or("stderr");
    parse_output_destinations(output)
}

fn parse_output_destinations(output: &str) -> Result<OutputDestinations> {
    let (stdout, stderr, file) = match output {
        "stdout" => (true, false, false),
        "stderr" => (false, true, false),
        "file" => (false, false, true),
        "file+stderr" => (false, true, true),
        "both" => (true, true, false),
        _ => {
            return Err(SigningError::Config(format!(
                "Invalid log output: {} (must be 'stdout', 'stderr', 'file', 'file+stderr', or 'both')",
                output
            )))
        }
    };
    Ok(OutputDestinations {
        stdout,
        stderr,
        file,
    })
}
