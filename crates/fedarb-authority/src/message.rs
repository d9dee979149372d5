//! # Arbitration Messages
//!
//! Requests the routing layer hands to the authority, the synchronous
//! replies it gets back, and the one-way messages the authority sends on
//! its own when a deferred decision resolves.
//!
//! Durations serialize as milliseconds under an `_ms` key; an infinite
//! duration is `Duration::MAX` in memory and `u64::MAX` on the wire.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fedarb_core::NodeInstance;

use crate::record::{Decision, ReplyFlags};

/// "Forever", for granted TTLs and revert windows.
pub const INFINITE: Duration = Duration::MAX;

/// Kind of arbitration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationType {
    /// How long since the subject last won a case.
    Query,
    /// Liveness only; never answered.
    KeepAlive,
    /// Counter-based arbitration between implicit lease partners.
    Implicit,
    /// The monitor claims the subject is gone; no mirror grant possible.
    OneWay,
    /// Two-way arbitration without lease instances.
    TwoWaySimple,
    /// Two-way arbitration with lease instances and deferred replies.
    TwoWayExtended,
    /// Turn a prior grant into a reject.
    RevertToReject,
    /// Turn a prior grant into neutral.
    RevertToNeutral,
}

impl ArbitrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::KeepAlive => "keep_alive",
            Self::Implicit => "implicit",
            Self::OneWay => "one_way",
            Self::TwoWaySimple => "two_way_simple",
            Self::TwoWayExtended => "two_way_extended",
            Self::RevertToReject => "revert_to_reject",
            Self::RevertToNeutral => "revert_to_neutral",
        }
    }

    /// Whether this is one of the two revert kinds.
    pub fn is_revert(&self) -> bool {
        matches!(self, Self::RevertToReject | Self::RevertToNeutral)
    }
}

impl fmt::Display for ArbitrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound arbitration request.
///
/// Build with [`ArbitrationRequest::new`] and the `with_*` setters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitrationRequest {
    #[serde(rename = "type")]
    pub kind: ArbitrationType,
    /// The node asking.
    pub monitor: NodeInstance,
    /// The node it is in dispute with.
    pub subject: NodeInstance,
    #[serde(default)]
    pub monitor_lease_instance: i64,
    #[serde(default)]
    pub subject_lease_instance: i64,
    /// How long the monitor wants the subject's lease honored if granted.
    #[serde(
        rename = "subject_ttl_ms",
        default,
        with = "fedarb_core::temporal::serde_millis"
    )]
    pub subject_ttl: Duration,
    /// How much history the monitor needs; `None` uses the configured default.
    #[serde(
        rename = "history_needed_ms",
        default,
        skip_serializing_if = "Option::is_none",
        with = "fedarb_core::temporal::serde_millis_opt"
    )]
    pub history_needed: Option<Duration>,
    #[serde(default)]
    pub implicit_arbitration1: i64,
    #[serde(default)]
    pub implicit_arbitration2: i64,
}

impl ArbitrationRequest {
    /// A request with no lease instances, zero TTL, and default history.
    pub fn new(kind: ArbitrationType, monitor: NodeInstance, subject: NodeInstance) -> Self {
        Self {
            kind,
            monitor,
            subject,
            monitor_lease_instance: 0,
            subject_lease_instance: 0,
            subject_ttl: Duration::ZERO,
            history_needed: None,
            implicit_arbitration1: 0,
            implicit_arbitration2: 0,
        }
    }

    pub fn with_lease_instances(mut self, monitor: i64, subject: i64) -> Self {
        self.monitor_lease_instance = monitor;
        self.subject_lease_instance = subject;
        self
    }

    pub fn with_subject_ttl(mut self, ttl: Duration) -> Self {
        self.subject_ttl = ttl;
        self
    }

    pub fn with_history_needed(mut self, history: Duration) -> Self {
        self.history_needed = Some(history);
        self
    }

    pub fn with_implicit_counters(mut self, first: i64, second: i64) -> Self {
        self.implicit_arbitration1 = first;
        self.implicit_arbitration2 = second;
        self
    }
}

/// Synchronous answer to an arbitration request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitrationReply {
    pub decision: Decision,
    /// TTL the subject's lease is honored for; [`INFINITE`] unless granted.
    #[serde(rename = "subject_granted_ttl_ms", with = "fedarb_core::temporal::serde_millis")]
    pub subject_granted_ttl: Duration,
    /// How long the monitor may still revert; zero once rejected.
    #[serde(rename = "revert_allowed_until_ms", with = "fedarb_core::temporal::serde_millis")]
    pub revert_allowed_until: Duration,
    /// Whether the subject had already been decided on this case.
    pub subject_already_present: bool,
    pub flags: ReplyFlags,
}

/// Answer to a [`ArbitrationType::Query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryReply {
    /// Time since the subject last won a case, or since the authority
    /// started if it never has.
    #[serde(rename = "elapsed_since_success_ms", with = "fedarb_core::temporal::serde_millis")]
    pub elapsed_since_success: Duration,
}

/// What [`process_request`](crate::ArbitrationAuthority::process_request)
/// hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArbitrationOutcome {
    Reply(ArbitrationReply),
    Query(QueryReply),
}

impl ArbitrationOutcome {
    /// The arbitration reply, if this is one.
    pub fn reply(&self) -> Option<&ArbitrationReply> {
        match self {
            Self::Reply(reply) => Some(reply),
            Self::Query(_) => None,
        }
    }

    /// The decision carried, if any.
    pub fn decision(&self) -> Option<Decision> {
        self.reply().map(|reply| reply.decision)
    }
}

/// Deferred verdict pushed to a participant after its synchronous reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayedArbitrateReply {
    /// Recipient, as the monitor of its own record.
    pub monitor: NodeInstance,
    pub subject: NodeInstance,
    pub monitor_lease_instance: i64,
    pub subject_lease_instance: i64,
    pub decision: Decision,
    #[serde(rename = "subject_granted_ttl_ms", with = "fedarb_core::temporal::serde_millis")]
    pub subject_granted_ttl: Duration,
    pub flags: ReplyFlags,
}

/// One-way message from the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundMessage {
    DelayedArbitrateReply(DelayedArbitrateReply),
}

impl OutboundMessage {
    /// Decision carried by the message.
    pub fn decision(&self) -> Decision {
        match self {
            Self::DelayedArbitrateReply(reply) => reply.decision,
        }
    }
}
