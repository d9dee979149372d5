//! # fedarb-core: Foundational Types for Federation Arbitration
//!
//! This crate is the leaf of the arbitration workspace. It defines the
//! primitives every other crate shares:
//!
//! 1. **Node identity newtypes.** `NodeId`, `NodeInstance`, `PartnerRef`;
//!    no bare integers or strings for node identity.
//!
//! 2. **Monotonic time.** `MonoTime` and the `Clock` trait. Decisions read
//!    time only through an injected clock, so every window can be driven
//!    deterministically in tests via `ManualClock`.
//!
//! 3. **Configuration.** `ArbitrationConfig` with YAML loading and
//!    validation, and `ConfigHandle` for hot reload.
//!
//! 4. **Errors.** A `thiserror` hierarchy for the recoverable failures
//!    (configuration, identifier parsing).
//!
//! ## Crate Policy
//!
//! - No dependencies on other `fedarb-*` crates.
//! - No `unsafe` code.
//! - No `panic!()` or `.unwrap()` outside tests.

pub mod config;
pub mod error;
pub mod identity;
pub mod temporal;

// Re-export primary types for ergonomic imports.
pub use config::{ArbitrationConfig, ConfigHandle};
pub use error::{ConfigError, FedArbError, IdentityError};
pub use identity::{NodeId, NodeInstance, PartnerRef};
pub use temporal::{Clock, ManualClock, MonoTime, SystemClock, Timestamp};
