//! Discovery pass
//!
//! Roots are analysed first, then containers are expanded from an explicit
//! work stack, several at a time. Expansion futures only extract, analyse
//! and claim content; nodes are added to the graph by the coordinating loop,
//! so parent ids always exist before their children are inserted.

use super::Run;
use crate::analysis::FileMetadata;
use crate::container::{ContainerEntry, ContainerHandler, ContainerMetadata};
use crate::dedup::Claim;
use crate::error::{NodeFailure, Result, SigningError, Stage};
use crate::graph::{FileLocation, NewNode};
use crate::types::NodeId;
use anyhow::{anyhow, bail, Context};
use futures::stream::{FuturesUnordered, StreamExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub(super) struct Discovery {
    /// Failures to apply once the graph is finalized
    pub deferred: Vec<(NodeId, NodeFailure)>,
    pub cancelled: bool,
}

struct PendingExpansion {
    container: NodeId,
    path: PathBuf,
    handler: Arc<dyn ContainerHandler>,
}

struct ExpandedEntry {
    location: FileLocation,
    metadata: FileMetadata,
    handler: Option<Arc<dyn ContainerHandler>>,
    claim: Claim,
    failure: Option<NodeFailure>,
}

struct Expansion {
    container: NodeId,
    metadata: Option<ContainerMetadata>,
    entries: Vec<ExpandedEntry>,
    failure: Option<NodeFailure>,
    fatal: Option<SigningError>,
}

enum EntryError {
    Fatal(SigningError),
    Failed(anyhow::Error),
}

impl From<SigningError> for EntryError {
    fn from(e: SigningError) -> Self {
        EntryError::Fatal(e)
    }
}

impl From<anyhow::Error> for EntryError {
    fn from(e: anyhow::Error) -> Self {
        EntryError::Failed(e)
    }
}

pub(super) async fn discover(run: &Run<'_>, inputs: &[PathBuf]) -> Result<Discovery> {
    let mut deferred = Vec::new();
    let mut stack = Vec::new();

    for input in inputs {
        if run.cancel.is_cancelled() {
            return Ok(Discovery {
                deferred,
                cancelled: true,
            });
        }
        if let Some(pending) = discover_root(run, input).await? {
            stack.push(pending);
        }
    }

    let limit = run.config.discovery_concurrency.max(1);
    let mut in_flight = FuturesUnordered::new();
    loop {
        while in_flight.len() < limit {
            match stack.pop() {
                Some(pending) => in_flight.push(expand(run, pending)),
                None => break,
            }
        }
        let Some(expansion) = in_flight.next().await else {
            break;
        };

        if let Some(fatal) = expansion.fatal {
            return Err(fatal);
        }
        if let Some(metadata) = expansion.metadata {
            run.container_metadata
                .lock()
                .insert(expansion.container, metadata);
        }
        for entry in expansion.entries {
            let registered = entry.claim == Claim::Registered;
            let path = entry.location.path_on_disk.clone();
            let node = new_node(entry.location, entry.metadata, entry.handler.as_ref(), &entry.claim);
            let id = run.graph.add_node(node, Some(expansion.container))?;

            if let Some(failure) = entry.failure {
                deferred.push((id, failure));
            } else if let (true, Some(handler)) = (registered, entry.handler) {
                stack.push(PendingExpansion {
                    container: id,
                    path,
                    handler,
                });
            }
        }
        if let Some(failure) = expansion.failure {
            deferred.push((expansion.container, failure));
        }

        if run.cancel.is_cancelled() {
            return Ok(Discovery {
                deferred,
                cancelled: true,
            });
        }
    }

    info!(
        nodes = run.graph.len(),
        unique_contents = run.dedup.len(),
        deferred_failures = deferred.len(),
        "Discovery complete"
    );
    Ok(Discovery {
        deferred,
        cancelled: false,
    })
}

async fn discover_root(run: &Run<'_>, input: &Path) -> Result<Option<PendingExpansion>> {
    if tokio::fs::metadata(input).await.is_err() {
        warn!(path = %input.display(), "Input not found");
        run.loose_failures.lock().push(NodeFailure::new(
            Stage::Discovery,
            input,
            "Input file does not exist",
        ));
        return Ok(None);
    }

    let metadata = match run.signer.analyzer.analyze(input).await {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!(path = %input.display(), error = %e, "Failed to analyze input");
            run.loose_failures
                .lock()
                .push(NodeFailure::from_error(Stage::Analysis, input, &e));
            return Ok(None);
        }
    };

    let handler = run.signer.handlers.find_handler(input)?;
    let claim = run.dedup.claim(metadata.content_key, input);
    let node = new_node(FileLocation::root(input), metadata, handler.as_ref(), &claim);
    let id = run.graph.add_node(node, None)?;

    Ok(match (claim, handler) {
        (Claim::Registered, Some(handler)) => Some(PendingExpansion {
            container: id,
            path: input.to_path_buf(),
            handler,
        }),
        _ => None,
    })
}

fn new_node(
    location: FileLocation,
    metadata: FileMetadata,
    handler: Option<&Arc<dyn ContainerHandler>>,
    claim: &Claim,
) -> NewNode {
    let node = match handler {
        Some(handler) => NewNode::container(location, metadata, handler.name()),
        None => NewNode::file(location, metadata),
    };
    match claim {
        Claim::Registered => node,
        Claim::AlreadyRegistered { .. } => node.duplicate(),
    }
}

/// Stream a container's entries into the workspace.
///
/// Entries processed before an error are still returned: their content keys
/// are claimed and must become nodes.
async fn expand(run: &Run<'_>, pending: PendingExpansion) -> Expansion {
    let mut expansion = Expansion {
        container: pending.container,
        metadata: None,
        entries: Vec::new(),
        failure: None,
        fatal: None,
    };

    let (metadata, mut entries) = match pending.handler.read_entries(&pending.path).await {
        Ok(read) => read,
        Err(e) => {
            let e = e.context(format!("Failed to read {} container", pending.handler.name()));
            expansion.failure = Some(NodeFailure::from_error(Stage::Discovery, &pending.path, &e));
            return expansion;
        }
    };
    expansion.metadata = Some(metadata);

    let root = run.workspace.join(pending.container.index().to_string());
    let mut ordinal = 0usize;
    while let Some(item) = entries.next().await {
        if run.cancel.is_cancelled() {
            break;
        }
        let entry = match item {
            Ok(entry) => entry,
            Err(e) => {
                expansion.failure = Some(NodeFailure::from_error(Stage::Discovery, &pending.path, &e));
                break;
            }
        };
        let entry_path = entry.entry_path.clone();
        // One directory per entry: distinct entries may normalise to the same path.
        let entry_root = root.join(ordinal.to_string());
        ordinal += 1;
        match extract_entry(run, &entry_root, entry).await {
            Ok(extracted) => expansion.entries.push(extracted),
            Err(EntryError::Fatal(e)) => {
                expansion.fatal = Some(e);
                break;
            }
            Err(EntryError::Failed(e)) => {
                let mut failure = NodeFailure::from_error(Stage::Discovery, &pending.path, &e);
                failure.entry_path = Some(entry_path);
                expansion.failure = Some(failure);
                break;
            }
        }
    }

    debug!(
        container = %pending.container,
        handler = pending.handler.name(),
        entries = expansion.entries.len(),
        "Expanded container"
    );
    expansion
}

async fn extract_entry(
    run: &Run<'_>,
    root: &Path,
    entry: ContainerEntry,
) -> std::result::Result<ExpandedEntry, EntryError> {
    let ContainerEntry {
        entry_path,
        mut content,
        content_key,
    } = entry;

    let relative = safe_relative_path(&entry_path)?;
    let target = root.join(&relative);
    let file_name = relative
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let handler = run.signer.handlers.find_handler(&target)?;
    let location = FileLocation::entry(&target, entry_path.clone());

    // A key supplied by the container lets duplicates skip extraction.
    if let Some(key) = content_key {
        let claim = run.dedup.claim(key, &target);
        if claim != Claim::Registered {
            debug!(entry = %entry_path, content_key = %key.short(), "Duplicate entry not extracted");
            return Ok(ExpandedEntry {
                location,
                metadata: FileMetadata::new(key, file_name),
                handler,
                claim,
                failure: None,
            });
        }

        let mut failure = None;
        let metadata = match extract_and_analyze(run, &target, &mut content).await {
            Ok(metadata) if metadata.content_key == key => metadata,
            Ok(metadata) => {
                failure = Some(NodeFailure::new(
                    Stage::Analysis,
                    &target,
                    format!(
                        "Container reported content {} but the entry hashes to {}",
                        key, metadata.content_key
                    ),
                ));
                FileMetadata::new(key, file_name)
            }
            Err(e) => {
                failure = Some(NodeFailure::from_error(Stage::Analysis, &target, &e));
                FileMetadata::new(key, file_name)
            }
        };
        return Ok(ExpandedEntry {
            location,
            metadata,
            handler,
            claim,
            failure,
        });
    }

    let metadata = extract_and_analyze(run, &target, &mut content).await?;
    let claim = run.dedup.claim(metadata.content_key, &target);
    if claim != Claim::Registered {
        if let Err(e) = tokio::fs::remove_file(&target).await {
            debug!(path = %target.display(), error = %e, "Could not remove duplicate extraction");
        }
    }
    Ok(ExpandedEntry {
        location,
        metadata,
        handler,
        claim,
        failure: None,
    })
}

async fn extract_and_analyze(
    run: &Run<'_>,
    target: &Path,
    content: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
) -> anyhow::Result<FileMetadata> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut file = tokio::fs::File::create(target)
        .await
        .with_context(|| format!("Failed to create {}", target.display()))?;
    tokio::io::copy(content, &mut file)
        .await
        .with_context(|| format!("Failed to extract {}", target.display()))?;
    file.flush().await?;
    drop(file);

    run.signer.analyzer.analyze(target).await
}

/// Entry path as a relative path that cannot leave the extraction directory
fn safe_relative_path(entry_path: &str) -> anyhow::Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(entry_path).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => bail!("Entry path '{}' escapes its container", entry_path),
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(anyhow!("Container entry has an empty path"));
    }
    Ok(relative)
}
