//! Signing Graph
//!
//! Flat node store indexed by `NodeId` plus the state machine driving every
//! node from discovery to a terminal state. Containers keep a counter of
//! unresolved children; each time a node becomes terminal the counters of its
//! parent (and of the parents of its aliases) are decremented, and a container
//! reaching zero becomes ready for repack.
//!
//! All mutation goes through the methods below under one lock, so the
//! orchestrator's concurrent batches can report results without coordinating.

mod node;

pub use node::{FileLocation, FileNode, NewNode, NodeKind, NodeState, Origin, Transition};

use crate::analysis::FileMetadata;
use crate::certificate::CertificateId;
use crate::error::{NodeFailure, Result, SigningError, Stage};
use crate::identity::ContentKey;
use crate::types::NodeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// How a node finished signing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Signed bytes live at `output`; `reused` when copied from an earlier
    /// signature of identical content.
    Signed { output: PathBuf, reused: bool },
    /// No certificate applies.
    Skipped,
}

#[derive(Debug, Default)]
struct GraphInner {
    nodes: Vec<FileNode>,
    origins: Vec<Origin>,
    finalized: bool,
    /// Unresolved children per container in `AwaitingChildren`
    remaining: HashMap<NodeId, usize>,
    /// Canonical node -> nodes aliasing it
    aliases: HashMap<NodeId, Vec<NodeId>>,
    transitions: Vec<Transition>,
    failures: Vec<NodeFailure>,
}

/// Node store and state machine for one signing run
#[derive(Debug, Default)]
pub struct SigningGraph {
    inner: Mutex<GraphInner>,
}

impl SigningGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node during discovery. `parent == None` marks a root.
    pub fn add_node(&self, new: NewNode, parent: Option<NodeId>) -> Result<NodeId> {
        let mut inner = self.inner.lock();
        if inner.finalized {
            return Err(SigningError::DiscoveryFinalized);
        }

        let id = NodeId(inner.nodes.len());
        if let Some(parent_id) = parent {
            let parent_origin = inner
                .origins
                .get(parent_id.index())
                .copied()
                .ok_or(SigningError::UnknownNode(parent_id))?;
            let parent_node = &mut inner.nodes[parent_id.index()];
            if !parent_node.is_container() || parent_origin != Origin::Canonical {
                return Err(SigningError::NotAContainer(parent_id));
            }
            parent_node.children.push(id);
        }

        debug!(
            node = %id,
            location = %new.location,
            content_key = %new.metadata.content_key.short(),
            parent = ?parent,
            origin = ?new.origin,
            "Node discovered"
        );

        inner.origins.push(new.origin);
        inner.nodes.push(FileNode {
            id,
            location: new.location,
            metadata: new.metadata,
            kind: new.kind,
            parent,
            children: Vec::new(),
            state: NodeState::Discovered,
            canonical: None,
            certificate: None,
            signed_output: None,
            reused_signature: false,
        });
        Ok(id)
    }

    /// Freeze the node set and compute every node's initial state.
    ///
    /// Duplicates are resolved to the canonical node holding the same content
    /// key. Calling this twice returns `AlreadyFinalized`.
    pub fn finalize_discovery(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.finalized {
            return Err(SigningError::AlreadyFinalized);
        }

        let mut canonical_by_key: HashMap<ContentKey, NodeId> = HashMap::new();
        for node in inner.nodes.iter() {
            if inner.origins[node.id.index()] != Origin::Canonical {
                continue;
            }
            if let Some(existing) = canonical_by_key.insert(node.content_key(), node.id) {
                return Err(SigningError::DuplicateRegistration {
                    key: node.content_key(),
                    existing: inner.nodes[existing.index()].location.path_on_disk.clone(),
                });
            }
        }

        // Validate every alias before touching any state.
        let mut resolved = Vec::new();
        for node in inner.nodes.iter() {
            if inner.origins[node.id.index()] != Origin::Duplicate {
                continue;
            }
            let canonical = *canonical_by_key.get(&node.content_key()).ok_or(
                SigningError::UnresolvedDuplicate {
                    node: node.id,
                    key: node.content_key(),
                },
            )?;
            let mut ancestor = node.parent;
            while let Some(a) = ancestor {
                if a == canonical {
                    return Err(SigningError::SelfContainingContainer {
                        node: node.id,
                        canonical,
                    });
                }
                ancestor = inner.nodes[a.index()].parent;
            }
            resolved.push((node.id, canonical));
        }

        for (alias, canonical) in resolved {
            inner.nodes[alias.index()].canonical = Some(canonical);
            inner.aliases.entry(canonical).or_default().push(alias);
            inner.transition(alias, NodeState::Deduplicated)?;
        }

        for index in 0..inner.nodes.len() {
            let id = NodeId(index);
            if inner.origins[index] != Origin::Canonical {
                continue;
            }
            let node = &inner.nodes[index];
            let next = match (node.is_container(), node.children.len()) {
                (false, _) => NodeState::PendingSignature,
                (true, 0) => NodeState::PendingRepack,
                (true, n) => {
                    inner.remaining.insert(id, n);
                    NodeState::AwaitingChildren
                }
            };
            inner.transition(id, next)?;
        }

        inner.finalized = true;
        debug!(
            nodes = inner.nodes.len(),
            aliases = inner.aliases.values().map(Vec::len).sum::<usize>(),
            "Discovery finalized"
        );
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.lock().finalized
    }

    /// Leaves and freshly repacked containers whose signature can be attempted now
    pub fn get_nodes_ready_for_signing(&self) -> Result<Vec<FileNode>> {
        self.collect_in_state(NodeState::PendingSignature, "querying nodes ready for signing")
    }

    /// Containers all of whose children are terminal
    pub fn get_containers_ready_for_repack(&self) -> Result<Vec<FileNode>> {
        self.collect_in_state(NodeState::PendingRepack, "querying containers ready for repack")
    }

    fn collect_in_state(&self, state: NodeState, action: &'static str) -> Result<Vec<FileNode>> {
        let inner = self.inner.lock();
        inner.require_finalized(action)?;
        Ok(inner
            .nodes
            .iter()
            .filter(|n| n.state == state)
            .cloned()
            .collect())
    }

    /// Move a ready node into `Signing` with the certificate chosen for it.
    pub fn begin_signing(&self, id: NodeId, certificate: CertificateId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.require_finalized("signing")?;
        inner.transition(id, NodeState::Signing)?;
        inner.nodes[id.index()].certificate = Some(certificate);
        Ok(())
    }

    /// Transition a node to `Signed` or `Skipped` and re-evaluate its parents.
    pub fn mark_as_complete(&self, id: NodeId, completion: Completion) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.require_finalized("completing nodes")?;
        match completion {
            Completion::Signed { output, reused } => {
                inner.transition(id, NodeState::Signed)?;
                let node = &mut inner.nodes[id.index()];
                node.signed_output = Some(output);
                node.reused_signature = reused;
            }
            Completion::Skipped => inner.transition(id, NodeState::Skipped)?,
        }
        inner.resolve(id)
    }

    /// Fail a node, record why, and fail every ancestor still waiting on it.
    pub fn mark_failed(&self, id: NodeId, mut failure: NodeFailure) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.require_finalized("failing nodes")?;
        inner.transition(id, NodeState::Failed)?;

        let node = &inner.nodes[id.index()];
        failure.node = Some(id);
        failure.content_key.get_or_insert(node.content_key());
        if failure.entry_path.is_none() {
            failure.entry_path = node.location.entry_path.clone();
        }
        warn!(
            node = %id,
            location = %node.location,
            stage = ?failure.stage,
            error = %failure.message,
            "Node failed"
        );
        inner.failures.push(failure);
        inner.resolve(id)
    }

    /// Record a successful repack; the container becomes signable again.
    ///
    /// `refreshed` carries the container's metadata after rewriting, when its
    /// bytes changed.
    pub fn mark_container_as_repacked(
        &self,
        id: NodeId,
        refreshed: Option<FileMetadata>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.require_finalized("repacking")?;
        inner.transition(id, NodeState::Repacked)?;
        if let Some(metadata) = refreshed {
            inner.nodes[id.index()].metadata = metadata;
        }
        inner.transition(id, NodeState::PendingSignature)
    }

    /// True iff every node is terminal
    pub fn is_complete(&self) -> Result<bool> {
        let inner = self.inner.lock();
        inner.require_finalized("checking completion")?;
        Ok(inner.nodes.iter().all(|n| n.state.is_terminal()))
    }

    /// Number of nodes not yet terminal
    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .nodes
            .iter()
            .filter(|n| !n.state.is_terminal())
            .count()
    }

    pub fn node(&self, id: NodeId) -> Result<FileNode> {
        self.inner
            .lock()
            .nodes
            .get(id.index())
            .cloned()
            .ok_or(SigningError::UnknownNode(id))
    }

    pub fn state(&self, id: NodeId) -> Result<NodeState> {
        self.inner
            .lock()
            .nodes
            .get(id.index())
            .map(|n| n.state)
            .ok_or(SigningError::UnknownNode(id))
    }

    pub fn nodes(&self) -> Vec<FileNode> {
        self.inner.lock().nodes.clone()
    }

    pub fn children(&self, id: NodeId) -> Result<Vec<FileNode>> {
        let inner = self.inner.lock();
        let node = inner
            .nodes
            .get(id.index())
            .ok_or(SigningError::UnknownNode(id))?;
        Ok(node
            .children
            .iter()
            .map(|c| inner.nodes[c.index()].clone())
            .collect())
    }

    /// Node that owns the signing work for `id`'s content
    pub fn canonical_of(&self, id: NodeId) -> Result<NodeId> {
        let inner = self.inner.lock();
        let node = inner
            .nodes
            .get(id.index())
            .ok_or(SigningError::UnknownNode(id))?;
        Ok(node.canonical.unwrap_or(id))
    }

    pub fn aliases_of(&self, id: NodeId) -> Vec<NodeId> {
        self.inner
            .lock()
            .aliases
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Signed bytes for a node, following aliases to their canonical node
    pub fn signed_artifact(&self, id: NodeId) -> Option<PathBuf> {
        let inner = self.inner.lock();
        let node = inner.nodes.get(id.index())?;
        let owner = node.canonical.unwrap_or(id);
        inner.nodes[owner.index()].signed_output.clone()
    }

    pub fn transitions(&self) -> Vec<Transition> {
        self.inner.lock().transitions.clone()
    }

    pub fn failures(&self) -> Vec<NodeFailure> {
        self.inner.lock().failures.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().nodes.is_empty()
    }
}

impl GraphInner {
    fn require_finalized(&self, action: &'static str) -> Result<()> {
        if self.finalized {
            Ok(())
        } else {
            Err(SigningError::DiscoveryNotFinalized(action))
        }
    }

    fn transition(&mut self, id: NodeId, to: NodeState) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id.index())
            .ok_or(SigningError::UnknownNode(id))?;
        let from = node.state;
        if !from.can_transition_to(to) {
            return Err(SigningError::InvalidTransition { node: id, from, to });
        }
        node.state = to;
        self.transitions.push(Transition { node: id, from, to });
        debug!(node = %id, file = %node.metadata.file_name, ?from, ?to, "Node state changed");
        Ok(())
    }

    /// Propagate a node becoming terminal to the containers waiting on it.
    ///
    /// Iterative so arbitrarily deep nesting cannot exhaust the stack.
    fn resolve(&mut self, id: NodeId) -> Result<()> {
        let mut work = vec![id];
        while let Some(done) = work.pop() {
            let failed = self.nodes[done.index()].state == NodeState::Failed;

            let mut parents: Vec<NodeId> = self.nodes[done.index()].parent.into_iter().collect();
            if let Some(aliases) = self.aliases.get(&done) {
                parents.extend(aliases.iter().filter_map(|a| self.nodes[a.index()].parent));
            }

            for parent in parents {
                match self.nodes[parent.index()].state {
                    NodeState::AwaitingChildren if failed => {
                        self.remaining.remove(&parent);
                        self.transition(parent, NodeState::Failed)?;
                        let child = &self.nodes[done.index()];
                        let message = format!("Descendant {} failed", child.location);
                        let container = &self.nodes[parent.index()];
                        let failure = NodeFailure {
                            node: Some(parent),
                            entry_path: container.location.entry_path.clone(),
                            content_key: Some(container.content_key()),
                            ..NodeFailure::new(
                                Stage::Propagated,
                                container.location.path_on_disk.clone(),
                                message,
                            )
                        };
                        self.failures.push(failure);
                        work.push(parent);
                    }
                    NodeState::AwaitingChildren => {
                        let left = self.remaining.entry(parent).or_insert(0);
                        *left = left.saturating_sub(1);
                        if *left == 0 {
                            self.remaining.remove(&parent);
                            self.transition(parent, NodeState::PendingRepack)?;
                        }
                    }
                    // Already failed through another child.
                    NodeState::Failed => {}
                    other => {
                        return Err(SigningError::InvalidTransition {
                            node: parent,
                            from: other,
                            to: NodeState::PendingRepack,
                        })
                    }
                }
            }
        }
        Ok(())
    }
}
