//! Result assembly.

use super::rounds::copy_if_distinct;
use super::Run;
use crate::error::{NodeFailure, Result, Stage};
use crate::graph::{FileNode, NodeState};
use crate::report::{NodeReport, RunStats, SignedOutput, SigningResult};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

pub(super) async fn build_result(
    run: &Run<'_>,
    cancelled: bool,
    started_at: DateTime<Utc>,
    elapsed: Duration,
) -> Result<SigningResult> {
    if !cancelled && run.graph.is_finalized() {
        copy_to_duplicate_roots(run).await?;
    }

    let nodes = run.graph.nodes();
    let mut failures = run.graph.failures();
    failures.extend(run.loose_failures.lock().iter().cloned());

    let reports: Vec<NodeReport> = nodes.iter().map(|n| node_report(run, n)).collect();
    let outputs: Vec<SignedOutput> = nodes
        .iter()
        .filter_map(|n| signed_output(&nodes, n))
        .collect();

    let counters = run.counters.lock();
    let count = |state: NodeState| nodes.iter().filter(|n| n.state == state).count();
    let stats = RunStats {
        started_at: Some(started_at),
        duration_ms: elapsed.as_millis() as u64,
        total_nodes: nodes.len(),
        signed: nodes
            .iter()
            .filter(|n| n.state == NodeState::Signed && !n.reused_signature)
            .count(),
        reused: nodes
            .iter()
            .filter(|n| n.state == NodeState::Signed && n.reused_signature)
            .count(),
        skipped: count(NodeState::Skipped),
        failed: count(NodeState::Failed),
        deduplicated: count(NodeState::Deduplicated),
        rounds: counters.rounds,
        batches: counters.batches,
        repacked: counters.repacked,
    };

    let all_terminal = nodes.iter().all(|n| n.state.is_terminal());
    Ok(SigningResult {
        success: !cancelled && all_terminal && failures.is_empty(),
        cancelled,
        outputs,
        failures,
        nodes: reports,
        stats,
        transitions: run.graph.transitions(),
    })
}

/// Duplicate root inputs get a copy of their canonical node's signed bytes.
async fn copy_to_duplicate_roots(run: &Run<'_>) -> Result<()> {
    let nodes = run.graph.nodes();
    for alias in nodes
        .iter()
        .filter(|n| n.parent.is_none() && n.state == NodeState::Deduplicated)
    {
        let Some(canonical) = alias.canonical.map(|c| &nodes[c.index()]) else {
            continue;
        };
        if canonical.state != NodeState::Signed {
            continue;
        }
        let source = canonical.location.path();
        let destination = alias.location.path();
        match copy_if_distinct(source, destination).await {
            Ok(()) => debug!(node = %alias.id, canonical = %canonical.id, "Copied signature to duplicate input"),
            Err(e) => {
                let mut failure = NodeFailure::from_error(Stage::Signing, destination, &e);
                failure.node = Some(alias.id);
                failure.content_key = Some(alias.content_key());
                run.loose_failures.lock().push(failure);
            }
        }
    }
    Ok(())
}

fn node_report(run: &Run<'_>, node: &FileNode) -> NodeReport {
    NodeReport {
        id: node.id,
        path: node.location.path_on_disk.clone(),
        entry_path: node.location.entry_path.clone(),
        parent: node.parent,
        state: node.state,
        content_key: node.content_key(),
        container_format: node.handler().map(str::to_string),
        certificate: node.certificate.clone(),
        canonical: node.canonical,
        signed_artifact: run.graph.signed_artifact(node.id),
        reused_signature: node.reused_signature,
    }
}

fn signed_output(nodes: &[FileNode], node: &FileNode) -> Option<SignedOutput> {
    match node.state {
        NodeState::Signed => Some(SignedOutput {
            node: node.id,
            path: node.location.path_on_disk.clone(),
            entry_path: node.location.entry_path.clone(),
            content_key: node.content_key(),
            certificate: node.certificate.clone(),
            reused: node.reused_signature,
        }),
        NodeState::Deduplicated => {
            let canonical = &nodes[node.canonical?.index()];
            if canonical.state != NodeState::Signed {
                return None;
            }
            // Nested duplicates are never extracted; their bytes live with the canonical node.
            let path = match node.parent {
                None => node.location.path_on_disk.clone(),
                Some(_) => canonical.location.path_on_disk.clone(),
            };
            Some(SignedOutput {
                node: node.id,
                path,
                entry_path: node.location.entry_path.clone(),
                content_key: node.content_key(),
                certificate: canonical.certificate.clone(),
                reused: true,
            })
        }
        _ => None,
    }
}
