//! Signing graph nodes and their state machine.

use crate::analysis::FileMetadata;
use crate::certificate::CertificateId;
use crate::identity::ContentKey;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// State of a node in the signing process
///
/// Plain files: `Discovered -> PendingSignature -> Signing -> Signed | Skipped | Failed`.
/// Containers: `Discovered -> AwaitingChildren -> PendingRepack -> Repacked ->
/// PendingSignature -> ...`. Duplicates go `Discovered -> Deduplicated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Discovered,
    AwaitingChildren,
    PendingRepack,
    Repacked,
    PendingSignature,
    Signing,
    Signed,
    Skipped,
    Failed,
    /// Content belongs to another node; this one just aliases its output.
    Deduplicated,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Signed | NodeState::Skipped | NodeState::Failed | NodeState::Deduplicated
        )
    }

    /// Whether `self -> next` is a legal edge of the state machine.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, next),
            (Discovered, PendingSignature)
                | (Discovered, AwaitingChildren)
                | (Discovered, PendingRepack)
                | (Discovered, Deduplicated)
                | (AwaitingChildren, PendingRepack)
                | (AwaitingChildren, Failed)
                | (PendingRepack, Repacked)
                | (PendingRepack, Failed)
                | (Repacked, PendingSignature)
                | (PendingSignature, Signing)
                | (PendingSignature, Signed)
                | (PendingSignature, Skipped)
                | (PendingSignature, Failed)
                | (Signing, Signed)
                | (Signing, Failed)
        )
    }
}

/// Leaf file or a container that a registered handler can unpack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Container { handler: String },
}

/// Where a node's bytes live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLocation {
    /// Path of the bytes on disk (the input itself, or an extracted copy)
    pub path_on_disk: PathBuf,
    /// Path of the entry inside its parent container, for nested files
    pub entry_path: Option<String>,
}

impl FileLocation {
    pub fn root(path: impl Into<PathBuf>) -> Self {
        Self {
            path_on_disk: path.into(),
            entry_path: None,
        }
    }

    pub fn entry(path: impl Into<PathBuf>, entry_path: impl Into<String>) -> Self {
        Self {
            path_on_disk: path.into(),
            entry_path: Some(entry_path.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path_on_disk
    }
}

impl fmt::Display for FileLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entry_path {
            Some(entry) => write!(f, "{} ({})", entry, self.path_on_disk.display()),
            None => write!(f, "{}", self.path_on_disk.display()),
        }
    }
}

/// How a node entered the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// First occurrence of its content; owns the signing work.
    Canonical,
    /// Content already claimed elsewhere; resolved to the canonical node when
    /// discovery is finalized.
    Duplicate,
}

/// Node description handed to `SigningGraph::add_node`
#[derive(Debug, Clone)]
pub struct NewNode {
    pub location: FileLocation,
    pub metadata: FileMetadata,
    pub kind: NodeKind,
    pub origin: Origin,
}

impl NewNode {
    pub fn file(location: FileLocation, metadata: FileMetadata) -> Self {
        Self {
            location,
            metadata,
            kind: NodeKind::File,
            origin: Origin::Canonical,
        }
    }

    pub fn container(
        location: FileLocation,
        metadata: FileMetadata,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            location,
            metadata,
            kind: NodeKind::Container {
                handler: handler.into(),
            },
            origin: Origin::Canonical,
        }
    }

    pub fn duplicate(mut self) -> Self {
        self.origin = Origin::Duplicate;
        self
    }
}

/// Snapshot of a node owned by the signing graph
///
/// The graph hands out clones; state only changes through graph methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNode {
    pub id: NodeId,
    pub location: FileLocation,
    pub metadata: FileMetadata,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub state: NodeState,
    /// Canonical node for `Deduplicated` nodes
    pub canonical: Option<NodeId>,
    pub certificate: Option<CertificateId>,
    /// Where the signed bytes ended up, once `Signed`
    pub signed_output: Option<PathBuf>,
    /// Signed by copying an earlier signature of identical bytes
    pub reused_signature: bool,
}

impl FileNode {
    pub fn content_key(&self) -> ContentKey {
        self.metadata.content_key
    }

    pub fn is_container(&self) -> bool {
        matches!(self.kind, NodeKind::Container { .. })
    }

    pub fn handler(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Container { handler } => Some(handler),
            NodeKind::File => None,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.metadata.file_name
    }
}

impl fmt::Display for FileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({:?})", self.id, self.metadata.file_name, self.state)
    }
}

/// One recorded state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub node: NodeId,
    pub from: NodeState,
    pub to: NodeState,
}
