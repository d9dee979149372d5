//! # Error Types: Structured Error Hierarchy
//!
//! Errors for the parts of the system that can fail recoverably:
//! configuration loading and identifier parsing. All errors use
//! `thiserror` for derive-based `Display` and `Error` implementations.
//!
//! ## Design
//!
//! Arbitration outcomes (Grant, Reject, Neutral, Delay) are business
//! results, not errors, and never appear here. Broken internal invariants
//! in the decision engine are logic defects and panic instead.

use thiserror::Error;

/// Top-level error type for the arbitration workspace.
#[derive(Error, Debug)]
pub enum FedArbError {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An identifier could not be parsed.
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error loading or validating an [`ArbitrationConfig`](crate::config::ArbitrationConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The YAML document did not parse into a configuration.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The configuration file could not be read.
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        /// Path that was being read.
        path: String,
        /// Underlying IO failure.
        source: std::io::Error,
    },

    /// A value is outside its permitted range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Error parsing a node identifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The string is not a valid hex node id.
    #[error("invalid node id {value:?}: {reason}")]
    InvalidNodeId {
        /// The rejected input.
        value: String,
        /// Why it was rejected.
        reason: String,
    },
}
