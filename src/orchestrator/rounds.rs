//! Sign and repack rounds
//!
//! Each round signs everything ready for signing (chunked into batches that
//! run concurrently under the `BatchLimiter`), then repacks every container
//! whose children are all terminal. A round that changes nothing while the
//! graph is incomplete means the bookkeeping is broken, and the run stops
//! with `Stalled`.

use super::Run;
use crate::certificate::CertificateId;
use crate::container::RepackEntry;
use crate::error::{NodeFailure, Result, SigningError, Stage};
use crate::graph::{Completion, FileNode};
use crate::identity::ContentKey;
use crate::provider::SignTarget;
use anyhow::{anyhow, Context};
use futures::stream::{self, FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Loop until the graph is complete. Returns whether the run was cancelled.
pub(super) async fn run_to_completion(run: &Run<'_>) -> Result<bool> {
    loop {
        if run.graph.is_complete()? {
            return Ok(false);
        }
        if run.cancel.is_cancelled() {
            info!(pending = run.graph.pending_count(), "Signing cancelled");
            return Ok(true);
        }

        let round = {
            let mut counters = run.counters.lock();
            counters.rounds += 1;
            counters.rounds
        };

        let signed = sign_ready(run).await?;
        if run.cancel.is_cancelled() {
            info!(pending = run.graph.pending_count(), "Signing cancelled");
            return Ok(true);
        }
        let repacked = repack_ready(run).await?;

        debug!(round, signed, repacked, pending = run.graph.pending_count(), "Round finished");
        if signed == 0 && repacked == 0 && !run.graph.is_complete()? {
            let pending = run.graph.pending_count();
            tracing::error!(round, pending, "Signing loop made no progress");
            return Err(SigningError::Stalled { pending });
        }
    }
}

enum BatchOutcome {
    Signed,
    Failed(anyhow::Error),
    Cancelled,
}

/// Settle every node ready for signing. Returns how many were processed.
async fn sign_ready(run: &Run<'_>) -> Result<usize> {
    let ready = run.graph.get_nodes_ready_for_signing()?;
    if ready.is_empty() {
        return Ok(0);
    }
    let processed = ready.len();

    let mut targets = Vec::new();
    let mut followers: HashMap<ContentKey, Vec<FileNode>> = HashMap::new();
    for node in ready {
        let key = node.content_key();

        if let Some(signed) = run.dedup.try_get_signed_version(&key) {
            complete_from_copy(run, &node, &signed).await?;
            continue;
        }

        let certificate = match run.signer.calculator.certificate_for(&node, &run.config) {
            Ok(certificate) => certificate,
            Err(e) => {
                run.fail(
                    node.id,
                    NodeFailure::from_error(Stage::Certificate, node.location.path(), &e),
                )?;
                continue;
            }
        };
        let Some(certificate) = certificate else {
            debug!(node = %node.id, file = node.file_name(), "No certificate applies");
            run.graph.mark_as_complete(node.id, Completion::Skipped)?;
            continue;
        };

        if let Some(waiting) = followers.get_mut(&key) {
            waiting.push(node);
            continue;
        }
        followers.insert(key, Vec::new());
        run.graph.begin_signing(node.id, certificate.clone())?;
        targets.push(sign_target(&node, certificate));
    }

    if targets.is_empty() {
        return Ok(processed);
    }

    let chunk_size = match run.config.max_batch_size {
        0 => targets.len(),
        n => n,
    };
    let mut batches: FuturesUnordered<_> = targets
        .chunks(chunk_size)
        .map(|batch| dispatch(run, batch))
        .collect();
    while let Some((batch, outcome)) = batches.next().await {
        settle(run, batch, outcome, &mut followers).await?;
    }
    Ok(processed)
}

fn sign_target(node: &FileNode, certificate: CertificateId) -> SignTarget {
    SignTarget {
        node: node.id,
        path: node.location.path_on_disk.clone(),
        certificate,
        content_key: node.content_key(),
        file_name: node.file_name().to_string(),
    }
}

async fn dispatch<'b>(run: &Run<'_>, batch: &'b [SignTarget]) -> (&'b [SignTarget], BatchOutcome) {
    let permit = tokio::select! {
        permit = run.limiter.acquire() => permit,
        _ = run.cancel.cancelled() => return (batch, BatchOutcome::Cancelled),
    };
    let _permit = match permit {
        Ok(permit) => permit,
        Err(e) => return (batch, BatchOutcome::Failed(e.into())),
    };

    run.counters.lock().batches += 1;
    info!(batch_size = batch.len(), "Dispatching signing batch");

    let outcome = tokio::select! {
        signed = run.signer.provider.sign_batch(batch, &run.cancel) => match signed {
            Ok(()) => BatchOutcome::Signed,
            Err(e) => BatchOutcome::Failed(e),
        },
        _ = run.cancel.cancelled() => BatchOutcome::Cancelled,
    };
    (batch, outcome)
}

async fn settle(
    run: &Run<'_>,
    batch: &[SignTarget],
    outcome: BatchOutcome,
    followers: &mut HashMap<ContentKey, Vec<FileNode>>,
) -> Result<()> {
    match outcome {
        BatchOutcome::Signed => {
            for target in batch {
                run.dedup.register_signed_file(target.content_key, &target.path)?;
                run.graph.mark_as_complete(
                    target.node,
                    Completion::Signed {
                        output: target.path.clone(),
                        reused: false,
                    },
                )?;
                run.mark_changed(target.node);
                for follower in followers.remove(&target.content_key).unwrap_or_default() {
                    complete_from_copy(run, &follower, &target.path).await?;
                }
            }
        }
        BatchOutcome::Failed(e) => {
            warn!(batch_size = batch.len(), error = %format!("{:#}", e), "Signing batch failed");
            for target in batch {
                run.fail(target.node, NodeFailure::from_error(Stage::Signing, &target.path, &e))?;
                fail_followers(run, followers, target, Stage::Signing)?;
            }
        }
        BatchOutcome::Cancelled => {
            for target in batch {
                run.fail(
                    target.node,
                    NodeFailure::new(Stage::Cancelled, &target.path, "Signing cancelled"),
                )?;
                fail_followers(run, followers, target, Stage::Cancelled)?;
            }
        }
    }
    Ok(())
}

fn fail_followers(
    run: &Run<'_>,
    followers: &mut HashMap<ContentKey, Vec<FileNode>>,
    target: &SignTarget,
    stage: Stage,
) -> Result<()> {
    for follower in followers.remove(&target.content_key).unwrap_or_default() {
        run.fail(
            follower.id,
            NodeFailure::new(
                stage,
                follower.location.path(),
                format!("Signing identical content at {} failed", target.path.display()),
            ),
        )?;
    }
    Ok(())
}

/// Give `node` the already signed bytes at `signed` instead of signing again.
async fn complete_from_copy(run: &Run<'_>, node: &FileNode, signed: &Path) -> Result<()> {
    let destination = node.location.path();
    if let Err(e) = copy_if_distinct(signed, destination).await {
        return run.fail(node.id, NodeFailure::from_error(Stage::Signing, destination, &e));
    }
    debug!(node = %node.id, source = %signed.display(), "Reused existing signature");
    run.graph.mark_as_complete(
        node.id,
        Completion::Signed {
            output: destination.to_path_buf(),
            reused: true,
        },
    )?;
    run.mark_changed(node.id);
    Ok(())
}

pub(super) async fn copy_if_distinct(source: &Path, destination: &Path) -> anyhow::Result<()> {
    if source == destination {
        return Ok(());
    }
    tokio::fs::copy(source, destination).await.with_context(|| {
        format!(
            "Failed to copy signed bytes from {} to {}",
            source.display(),
            destination.display()
        )
    })?;
    Ok(())
}

/// Repack every container whose children are all terminal.
async fn repack_ready(run: &Run<'_>) -> Result<usize> {
    let containers = run.graph.get_containers_ready_for_repack()?;
    let count = containers.len();
    let limit = run.config.discovery_concurrency.max(1);

    let results: Vec<Result<()>> = stream::iter(containers)
        .map(|container| repack_one(run, container))
        .buffer_unordered(limit)
        .collect()
        .await;
    for result in results {
        result?;
    }
    Ok(count)
}

async fn repack_one(run: &Run<'_>, container: FileNode) -> Result<()> {
    let mut entries = Vec::with_capacity(container.children.len());
    let mut changed = false;
    for child in run.graph.children(container.id)? {
        let owner = child.canonical.unwrap_or(child.id);
        changed |= run.is_changed(owner);
        let content_path = if owner == child.id {
            child.location.path_on_disk.clone()
        } else {
            run.graph.node(owner)?.location.path_on_disk
        };
        entries.push(RepackEntry {
            entry_path: child
                .location
                .entry_path
                .clone()
                .unwrap_or_else(|| child.file_name().to_string()),
            content_path,
        });
    }

    if !changed {
        debug!(container = %container.id, "No entry changed, keeping container bytes");
        return run.graph.mark_container_as_repacked(container.id, None);
    }

    let handler_name = container
        .handler()
        .ok_or(SigningError::NotAContainer(container.id))?;
    let handler = run.signer.handlers.handler_named(handler_name)?;
    let metadata = run
        .container_metadata
        .lock()
        .get(&container.id)
        .cloned()
        .unwrap_or_default();

    let path = container.location.path();
    let staging = staging_path(path);
    let written = tokio::select! {
        written = handler.write_container(&staging, path, &entries, &metadata) => {
            written.map_err(|e| (Stage::Repack, e))
        }
        _ = run.cancel.cancelled() => Err((Stage::Cancelled, anyhow!("Repack cancelled"))),
    };
    let moved = match written {
        Ok(()) => tokio::fs::rename(&staging, path)
            .await
            .context("Failed to move repacked container into place")
            .map_err(|e| (Stage::Repack, e)),
        Err(e) => Err(e),
    };
    if let Err((stage, e)) = moved {
        if let Err(remove) = tokio::fs::remove_file(&staging).await {
            debug!(path = %staging.display(), error = %remove, "No staging file to remove");
        }
        return run.fail(container.id, NodeFailure::from_error(stage, path, &e));
    }

    let mut refreshed = match run.signer.analyzer.analyze(path).await {
        Ok(metadata) => metadata,
        Err(e) => {
            return run.fail(container.id, NodeFailure::from_error(Stage::Analysis, path, &e));
        }
    };
    refreshed.file_name = container.metadata.file_name.clone();
    run.dedup.claim(refreshed.content_key, path);

    info!(
        container = %container.id,
        handler = handler.name(),
        entries = entries.len(),
        content_key = %refreshed.content_key.short(),
        "Container repacked"
    );
    run.counters.lock().repacked += 1;
    run.mark_changed(container.id);
    run.graph.mark_container_as_repacked(container.id, Some(refreshed))
}

/// Hidden sibling of `path` that a handler writes the new container to
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.nestsign-repack", name))
}
