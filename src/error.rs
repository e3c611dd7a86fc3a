//! Error types for the signing engine.
//!
//! `SigningError` covers structural and invariant violations: they abort the
//! run. Operational problems (a batch that failed to sign, a container that
//! failed to repack) are recorded as `NodeFailure` values instead, so one bad
//! branch does not stop unrelated ones.

use crate::graph::NodeState;
use crate::identity::ContentKey;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors raised by the graph, the deduplicator, the handler registry
/// and the orchestrator.
#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Content {key} is already registered at {}", .existing.display())]
    DuplicateRegistration { key: ContentKey, existing: PathBuf },

    #[error("Content {key} already has a signed version")]
    DuplicateSignedRegistration { key: ContentKey },

    #[error("Content {key} was never registered")]
    UnregisteredContent { key: ContentKey },

    #[error("Cannot add nodes after discovery has been finalized")]
    DiscoveryFinalized,

    #[error("Discovery has already been finalized")]
    AlreadyFinalized,

    #[error("Discovery must be finalized before {0}")]
    DiscoveryNotFinalized(&'static str),

    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    #[error("Node {0} is not a canonical container and cannot have children")]
    NotAContainer(NodeId),

    #[error("Invalid state transition for node {node}: {from:?} -> {to:?}")]
    InvalidTransition {
        node: NodeId,
        from: NodeState,
        to: NodeState,
    },

    #[error("Duplicate node {node} has no canonical node for content {key}")]
    UnresolvedDuplicate { node: NodeId, key: ContentKey },

    #[error("Node {node} aliases its own ancestor {canonical}")]
    SelfContainingContainer { node: NodeId, canonical: NodeId },

    #[error("More than one container handler claims {}: {}", .path.display(), .handlers.join(", "))]
    AmbiguousHandler { path: PathBuf, handlers: Vec<String> },

    #[error("No container handler named '{0}' is registered")]
    UnknownHandler(String),

    #[error("A container handler named '{0}' is already registered")]
    DuplicateHandler(String),

    #[error("Signing batch limiter was closed")]
    LimiterClosed,

    #[error("Signing loop made no progress with {pending} node(s) still pending")]
    Stalled { pending: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to load configuration: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for signing operations.
pub type Result<T> = std::result::Result<T, SigningError>;

/// Phase of the run in which an operational failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Discovery,
    Analysis,
    Certificate,
    Signing,
    Repack,
    /// A descendant failed, so the container could not be repacked.
    Propagated,
    Cancelled,
}

/// An operational failure attached to a node (or to an input that never
/// became one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node: Option<NodeId>,
    pub path: PathBuf,
    pub entry_path: Option<String>,
    pub content_key: Option<ContentKey>,
    pub stage: Stage,
    pub message: String,
}

impl NodeFailure {
    pub fn new(stage: Stage, path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            node: None,
            path: path.into(),
            entry_path: None,
            content_key: None,
            stage,
            message: message.into(),
        }
    }

    /// Build a failure from an `anyhow` error, keeping its context chain.
    pub fn from_error(stage: Stage, path: impl Into<PathBuf>, error: &anyhow::Error) -> Self {
        Self::new(stage, path, format!("{:#}", error))
    }
}
