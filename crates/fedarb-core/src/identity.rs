//! # Node Identity Newtypes
//!
//! Newtype wrappers for the identifiers that flow through arbitration.
//! A `NodeId` names a federation node across restarts, a `NodeInstance`
//! names one incarnation of it, and a `PartnerRef` is the routable handle
//! the routing layer attaches to an inbound message.
//!
//! ## Invariant
//!
//! Instance numbers only ever grow for a given node. Consumers compare
//! instances to discard stale retries; nothing in this module enforces
//! ordering on its own.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

/// 128-bit federation node identifier.
///
/// Rendered as lowercase hex without leading zeros (`0` for the zero id),
/// matching the ring's token notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(u128);

impl NodeId {
    /// Create a node identifier from its raw value.
    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    /// Access the raw 128-bit value.
    pub fn value(&self) -> u128 {
        self.0
    }

    /// Parse a node identifier from hex.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidNodeId`] if the string is empty,
    /// longer than 32 digits, or contains non-hex characters.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        if digits.is_empty() || digits.len() > 32 {
            return Err(IdentityError::InvalidNodeId {
                value: s.to_string(),
                reason: "expected 1 to 32 hex digits".into(),
            });
        }
        u128::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|e| IdentityError::InvalidNodeId {
                value: s.to_string(),
                reason: e.to_string(),
            })
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

/// One incarnation of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeInstance {
    /// The node.
    pub id: NodeId,
    /// Incarnation number; a restarted node advertises a larger one.
    pub instance: u64,
}

impl NodeInstance {
    /// Create a node instance.
    pub const fn new(id: NodeId, instance: u64) -> Self {
        Self { id, instance }
    }
}

impl fmt::Display for NodeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.instance)
    }
}

/// Routable reference to a message sender.
///
/// Supplied by the routing layer alongside every inbound arbitration
/// message and used as the destination for deferred replies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartnerRef {
    /// The sending node incarnation.
    pub node: NodeInstance,
    /// Transport address of the sender.
    pub address: String,
    /// Whether the routing layer already knows this node is shutting down.
    #[serde(default)]
    pub shutdown: bool,
}

impl PartnerRef {
    /// Create a reference to a live sender.
    pub fn new(node: NodeInstance, address: impl Into<String>) -> Self {
        Self {
            node,
            address: address.into(),
            shutdown: false,
        }
    }

    /// Mark the sender as known to be shutting down.
    pub fn shutting_down(mut self) -> Self {
        self.shutdown = true;
        self
    }
}

impl fmt::Display for PartnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node, self.address)?;
        if self.shutdown {
            f.write_str("(shutdown)")?;
        }
        Ok(())
    }
}
