//! # fedarb-authority: Federation Arbitration Authority
//!
//! When two federation nodes lose contact, each may ask the authority for
//! permission to act as if the other were gone. The authority answers so
//! that at most one side of a dispute is ever granted, using what it has
//! seen of both nodes: which incarnation each is running, when each last
//! spoke, and how often each has accused or been accused by others.
//!
//! - **Records** (`record.rs`): one record per participant per case, held
//!   in a generation-checked arena.
//! - **Ledgers** (`ledger.rs`): per-node incarnation, liveness, reply
//!   address, and suspicion counters.
//! - **Table** (`table.rs`): all ledgers and records, state transitions,
//!   deferred decisions, and retention-bounded compaction.
//! - **Decisions** (`decision.rs`): two-way, one-way, implicit, revert, and
//!   query handling.
//! - **Authority** (`authority.rs`): the locked, clock- and
//!   transport-injected entry point.
//! - **Scheduler** (`scheduler.rs`): the background compaction task.
//!
//! ## Crate Policy
//!
//! - Depends on `fedarb-core` internally.
//! - All state sits behind one lock; outbound sends happen after it is
//!   released.
//! - Broken counter invariants panic; they are logic defects, not
//!   recoverable conditions.

pub mod authority;
mod decision;
pub mod ledger;
pub mod message;
mod observability;
pub mod record;
pub mod retention;
pub mod scheduler;
pub mod table;
pub mod transport;

pub use authority::ArbitrationAuthority;
pub use ledger::{SuspicionLedger, TierCounts};
pub use message::{
    ArbitrationOutcome, ArbitrationReply, ArbitrationRequest, ArbitrationType,
    DelayedArbitrateReply, OutboundMessage, QueryReply, INFINITE,
};
pub use record::{Decision, DisputeRecord, RecordId, RecordState, ReplyFlags};
pub use retention::RetentionPolicy;
pub use scheduler::spawn_compaction_task;
pub use table::{ArbitrationTable, CompactionReport, TableStats};
pub use transport::{ChannelTransport, DelayedResponseBuffer, MemoryTransport, Transport};
