//! Recursive Signing Orchestrator
//!
//! Entry point of the core. One call to `sign` owns a fresh graph,
//! deduplicator and extraction workspace, then:
//!
//! 1. discovers every root input and, iteratively, every nested entry
//!    (`discovery`);
//! 2. finalizes discovery;
//! 3. alternates signing rounds and repack rounds until the graph is complete
//!    (`rounds`);
//! 4. copies signatures to duplicate roots and builds the result (`finalize`).

mod discovery;
mod finalize;
mod rounds;

use crate::analysis::FileAnalyzer;
use crate::certificate::SignatureCalculator;
use crate::concurrency::BatchLimiter;
use crate::config::SigningConfiguration;
use crate::container::{ContainerMetadata, HandlerRegistry};
use crate::dedup::Deduplicator;
use crate::error::{NodeFailure, Result};
use crate::graph::{NodeState, SigningGraph};
use crate::provider::SigningProvider;
use crate::report::SigningResult;
use crate::request::SigningRequest;
use crate::types::NodeId;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The boundary the core exposes.
#[async_trait]
pub trait RecursiveSigning: Send + Sync {
    /// Sign every input and everything nested inside it.
    ///
    /// Operational failures are reported in the result; `Err` is reserved for
    /// structural errors (ambiguous handlers, bookkeeping violations, a
    /// stalled loop).
    async fn sign(
        &self,
        request: SigningRequest,
        cancel: CancellationToken,
    ) -> Result<SigningResult>;
}

/// `RecursiveSigning` over pluggable collaborators
pub struct RecursiveSigner {
    handlers: Arc<HandlerRegistry>,
    analyzer: Arc<dyn FileAnalyzer>,
    calculator: Arc<dyn SignatureCalculator>,
    provider: Arc<dyn SigningProvider>,
}

impl RecursiveSigner {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        analyzer: Arc<dyn FileAnalyzer>,
        calculator: Arc<dyn SignatureCalculator>,
        provider: Arc<dyn SigningProvider>,
    ) -> Self {
        Self {
            handlers,
            analyzer,
            calculator,
            provider,
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }
}

#[async_trait]
impl RecursiveSigning for RecursiveSigner {
    async fn sign(
        &self,
        request: SigningRequest,
        cancel: CancellationToken,
    ) -> Result<SigningResult> {
        let config = request.configuration.clone();
        config.validate()?;

        let started_at = Utc::now();
        let clock = Instant::now();
        info!(inputs = request.inputs.len(), "Signing run started");

        tokio::fs::create_dir_all(&config.temp_dir).await?;
        let workspace = tempfile::Builder::new()
            .prefix("nestsign-")
            .tempdir_in(&config.temp_dir)?;

        let run = Run {
            signer: self,
            config: config.clone(),
            graph: SigningGraph::new(),
            dedup: Deduplicator::new(),
            workspace: workspace.path().to_path_buf(),
            cancel,
            limiter: BatchLimiter::new(config.max_concurrent_batches, config.batch_spacing_ms),
            container_metadata: Mutex::new(HashMap::new()),
            changed: Mutex::new(HashSet::new()),
            loose_failures: Mutex::new(Vec::new()),
            counters: Mutex::new(Counters::default()),
        };

        let outcome = execute(&run, &request.inputs).await;

        if config.keep_workspace {
            let kept = workspace.keep();
            info!(workspace = %kept.display(), "Keeping extraction workspace");
        } else if let Err(e) = workspace.close() {
            warn!(error = %e, "Failed to remove extraction workspace");
        }

        let cancelled = outcome?;
        let result = finalize::build_result(&run, cancelled, started_at, clock.elapsed()).await?;
        info!(
            success = result.success,
            cancelled = result.cancelled,
            nodes = result.stats.total_nodes,
            signed = result.stats.signed,
            reused = result.stats.reused,
            skipped = result.stats.skipped,
            failed = result.stats.failed,
            rounds = result.stats.rounds,
            duration_ms = result.stats.duration_ms,
            "Signing run finished"
        );
        Ok(result)
    }
}

/// Discovery plus the sign/repack loop. Returns whether the run was cancelled.
async fn execute(run: &Run<'_>, inputs: &[PathBuf]) -> Result<bool> {
    let discovered = discovery::discover(run, inputs).await?;
    if discovered.cancelled {
        info!(nodes = run.graph.len(), "Cancelled during discovery");
        return Ok(true);
    }

    run.graph.finalize_discovery()?;
    for (id, failure) in discovered.deferred {
        run.fail(id, failure)?;
    }

    rounds::run_to_completion(run).await
}

#[derive(Debug, Default)]
struct Counters {
    rounds: usize,
    batches: usize,
    repacked: usize,
}

/// State scoped to one `sign` call
struct Run<'a> {
    signer: &'a RecursiveSigner,
    config: Arc<SigningConfiguration>,
    graph: SigningGraph,
    dedup: Deduplicator,
    workspace: PathBuf,
    cancel: CancellationToken,
    limiter: BatchLimiter,
    container_metadata: Mutex<HashMap<NodeId, ContainerMetadata>>,
    /// Nodes whose bytes on disk differ from what discovery saw
    changed: Mutex<HashSet<NodeId>>,
    /// Failures with no node to attach to, or for nodes already terminal
    loose_failures: Mutex<Vec<NodeFailure>>,
    counters: Mutex<Counters>,
}

impl Run<'_> {
    /// Fail a node, tolerating one already failed through a descendant.
    fn fail(&self, id: NodeId, mut failure: NodeFailure) -> Result<()> {
        if self.graph.state(id)? == NodeState::Failed {
            failure.node = Some(id);
            self.loose_failures.lock().push(failure);
            return Ok(());
        }
        self.graph.mark_failed(id, failure)
    }

    fn mark_changed(&self, id: NodeId) {
        self.changed.lock().insert(id);
    }

    fn is_changed(&self, id: NodeId) -> bool {
        self.changed.lock().contains(&id)
    }
}
