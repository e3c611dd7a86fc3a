//! Nestsign: recursive signing of nested artifacts
//!
//! Signs files that may contain other signable files (archives, installers,
//! packages) to arbitrary depth. Every unique content is signed once; nested
//! containers are repacked with their signed entries before they are signed
//! themselves.
//!
//! The core owns discovery, deduplication, ordering and failure propagation.
//! Container formats, file analysis, certificate choice and the signing
//! backend are collaborators behind traits.

pub mod analysis;
pub mod certificate;
pub mod concurrency;
pub mod config;
pub mod container;
pub mod dedup;
pub mod error;
pub mod graph;
pub mod identity;
pub mod logging;
pub mod orchestrator;
pub mod provider;
pub mod report;
pub mod request;
pub mod types;

pub use analysis::{ContentAnalyzer, FileAnalyzer, FileMetadata};
pub use certificate::{CertificateId, ExtensionPolicy, SignatureCalculator};
pub use config::{ConfigLoader, NestsignConfig, SigningConfiguration};
pub use container::{ContainerEntry, ContainerHandler, ContainerMetadata, HandlerRegistry, RepackEntry};
pub use error::{NodeFailure, SigningError, Stage};
pub use graph::{NodeState, SigningGraph};
pub use identity::ContentKey;
pub use orchestrator::{RecursiveSigner, RecursiveSigning};
pub use provider::{SignTarget, SigningProvider};
pub use report::{NodeReport, RunStats, SignedOutput, SigningResult};
pub use request::SigningRequest;
pub use tokio_util::sync::CancellationToken;
pub use types::NodeId;
