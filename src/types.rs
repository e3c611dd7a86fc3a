//! Core types shared by every layer of the signing engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hash: Generic 256-bit hash value
pub type Hash = [u8; 32];

/// NodeId: Stable index of a node inside one signing graph
///
/// Ids are handed out in discovery order and are only meaningful for the
/// graph that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
