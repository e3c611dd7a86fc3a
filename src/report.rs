//! Output of a signing run.
//!
//! Everything here is plain data and serializes to JSON for audit trails.

use crate::certificate::CertificateId;
use crate::error::NodeFailure;
use crate::graph::{NodeState, Transition};
use crate::identity::ContentKey;
use crate::types::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A file that ended up carrying a signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedOutput {
    pub node: NodeId,
    /// Location of the signed bytes
    pub path: PathBuf,
    pub entry_path: Option<String>,
    pub content_key: ContentKey,
    pub certificate: Option<CertificateId>,
    /// Bytes were copied from an earlier signature instead of signed again
    pub reused: bool,
}

/// Final state of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: NodeId,
    pub path: PathBuf,
    pub entry_path: Option<String>,
    pub parent: Option<NodeId>,
    pub state: NodeState,
    pub content_key: ContentKey,
    pub container_format: Option<String>,
    pub certificate: Option<CertificateId>,
    /// Canonical node, for deduplicated nodes
    pub canonical: Option<NodeId>,
    pub signed_artifact: Option<PathBuf>,
    pub reused_signature: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub total_nodes: usize,
    pub signed: usize,
    pub reused: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deduplicated: usize,
    pub rounds: usize,
    pub batches: usize,
    pub repacked: usize,
}

/// Terminal output of `RecursiveSigning::sign`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SigningResult {
    pub success: bool,
    pub cancelled: bool,
    pub outputs: Vec<SignedOutput>,
    pub failures: Vec<NodeFailure>,
    pub nodes: Vec<NodeReport>,
    pub stats: RunStats,
    /// Every state change of the run, in order
    pub transitions: Vec<Transition>,
}

impl SigningResult {
    /// Report of the root node discovered at `path`
    pub fn root(&self, path: &Path) -> Option<&NodeReport> {
        self.nodes
            .iter()
            .find(|n| n.parent.is_none() && n.path == path)
    }

    /// Reports of the nodes found at `entry_path` in any container
    pub fn entries<'a>(&'a self, entry_path: &'a str) -> impl Iterator<Item = &'a NodeReport> + 'a {
        self.nodes
            .iter()
            .filter(move |n| n.entry_path.as_deref() == Some(entry_path))
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
