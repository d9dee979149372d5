//! # Arbitration Authority
//!
//! The public face of the crate. An [`ArbitrationAuthority`] owns one
//! [`ArbitrationTable`] behind a `parking_lot` mutex, reads time from an
//! injected [`Clock`], reads configuration from a [`ConfigHandle`], and
//! sends deferred verdicts through an injected [`Transport`].
//!
//! ## Locking
//!
//! Every public operation takes the table lock once, works from a single
//! configuration snapshot and a single clock reading, and releases the
//! lock before handing queued messages to the transport. The lock is never
//! held across an `.await`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use fedarb_core::{Clock, ConfigHandle, PartnerRef};

use crate::message::{ArbitrationOutcome, ArbitrationRequest};
use crate::observability;
use crate::table::{ArbitrationTable, CompactionReport, TableStats};
use crate::transport::{DelayedResponseBuffer, Transport};

/// Decides lease disputes between federation nodes.
pub struct ArbitrationAuthority {
    table: Mutex<ArbitrationTable>,
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for ArbitrationAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbitrationAuthority")
            .field("stats", &self.stats())
            .finish()
    }
}

impl ArbitrationAuthority {
    /// Create an authority with an empty table whose history starts now.
    pub fn new(config: ConfigHandle, clock: Arc<dyn Clock>, transport: Arc<dyn Transport>) -> Self {
        let table = ArbitrationTable::new(clock.now());
        Self {
            table: Mutex::new(table),
            config,
            clock,
            transport,
        }
    }

    /// The configuration handle; replacing its contents takes effect on
    /// the next call.
    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Handle one inbound request from `sender`.
    ///
    /// Returns `None` for keep-alives, reverts, and requests from a
    /// superseded instance of the monitor.
    pub fn process_request(
        &self,
        request: &ArbitrationRequest,
        sender: &PartnerRef,
    ) -> Option<ArbitrationOutcome> {
        let config = self.config.snapshot();
        let mut out = DelayedResponseBuffer::new();
        let outcome = {
            let mut table = self.table.lock();
            let now = self.clock.now();
            table.process(request, sender, now, &config, &mut out)
        };

        if let Some(decision) = outcome.as_ref().and_then(|o| o.decision()) {
            observability::record_decision(decision);
            tracing::debug!(
                kind = %request.kind,
                monitor = %request.monitor,
                subject = %request.subject,
                decision = %decision,
                "arbitration decided"
            );
        }
        observability::record_delayed_replies(out.flush(self.transport.as_ref()));
        outcome
    }

    /// Finalize deferred decisions that are due and run a retention sweep
    /// if one is due. Returns the time until the next deferred decision is
    /// due, if any is pending.
    pub fn compact(&self) -> Option<Duration> {
        self.compact_with_report().next_due
    }

    /// [`compact`](Self::compact), returning everything it did.
    pub fn compact_with_report(&self) -> CompactionReport {
        let config = self.config.snapshot();
        let mut out = DelayedResponseBuffer::new();
        let (report, ledgers) = {
            let mut table = self.table.lock();
            let now = self.clock.now();
            let report = table.compact(now, &config, &mut out);
            (report, table.stats().ledgers)
        };

        if report.swept {
            observability::record_compaction(report.records_removed, ledgers);
            tracing::debug!(
                removed = report.records_removed,
                ledgers_dropped = report.ledgers_dropped,
                complete = report.complete,
                "retention sweep"
            );
        }
        if report.finalized > 0 {
            tracing::debug!(finalized = report.finalized, "deferred decisions granted");
        }
        observability::record_delayed_replies(out.flush(self.transport.as_ref()));
        report
    }

    /// Human-readable rendering of the whole table.
    pub fn dump(&self) -> String {
        let table = self.table.lock();
        table.dump(self.clock.now())
    }

    pub fn stats(&self) -> TableStats {
        self.table.lock().stats()
    }

    /// Run `f` against the table under the lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&ArbitrationTable) -> R) -> R {
        f(&self.table.lock())
    }
}
