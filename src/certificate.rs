//! Certificate selection
//!
//! A `SignatureCalculator` decides which certificate, if any, applies to a
//! node. `None` is a policy skip, not an error.

use crate::config::SigningConfiguration;
use crate::graph::FileNode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a signing certificate as understood by the signing provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CertificateId(String);

impl CertificateId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CertificateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Chooses the certificate for a node.
pub trait SignatureCalculator: Send + Sync {
    fn certificate_for(
        &self,
        node: &FileNode,
        configuration: &SigningConfiguration,
    ) -> anyhow::Result<Option<CertificateId>>;
}

/// Picks certificates from `SigningConfiguration::certificates` by file
/// extension.
///
/// Excluded names and files that already carry a signature get nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtensionPolicy;

impl SignatureCalculator for ExtensionPolicy {
    fn certificate_for(
        &self,
        node: &FileNode,
        configuration: &SigningConfiguration,
    ) -> anyhow::Result<Option<CertificateId>> {
        if node.metadata.already_signed || configuration.is_excluded(node.file_name()) {
            return Ok(None);
        }
        Ok(node
            .metadata
            .extension()
            .and_then(|ext| configuration.certificates.get(&ext))
            .map(CertificateId::new))
    }
}
