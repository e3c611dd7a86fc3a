//! Signing provider contract.
//!
//! The provider receives a batch of targets and signs each file in place at
//! `path`. It may parallelize or bulk the batch however it likes; the core
//! only sees overall success or failure of the call.

use crate::certificate::CertificateId;
use crate::identity::ContentKey;
use crate::types::NodeId;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// One file to sign
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignTarget {
    pub node: NodeId,
    /// File to sign; the signed bytes replace it.
    pub path: PathBuf,
    pub certificate: CertificateId,
    pub content_key: ContentKey,
    pub file_name: String,
}

/// External signing backend.
#[async_trait]
pub trait SigningProvider: Send + Sync {
    /// Sign every target of the batch. An `Err` fails the whole batch.
    async fn sign_batch(
        &self,
        batch: &[SignTarget],
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}
