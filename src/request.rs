//! Input of a signing run.

use crate::config::SigningConfiguration;
use std::path::PathBuf;
use std::sync::Arc;

/// Root inputs plus the policy they are signed under
///
/// Inputs are files on disk and are signed in place.
#[derive(Debug, Clone)]
pub struct SigningRequest {
    pub inputs: Vec<PathBuf>,
    pub configuration: Arc<SigningConfiguration>,
}

impl SigningRequest {
    pub fn new<I, P>(inputs: I, configuration: SigningConfiguration) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            configuration: Arc::new(configuration),
        }
    }

    /// Share one configuration between several requests.
    pub fn with_shared_configuration(
        inputs: Vec<PathBuf>,
        configuration: Arc<SigningConfiguration>,
    ) -> Self {
        Self {
            inputs,
            configuration,
        }
    }
}
