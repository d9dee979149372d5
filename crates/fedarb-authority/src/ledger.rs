//! # Suspicion Ledger
//!
//! Per-node bookkeeping: the highest incarnation seen, when the node last
//! spoke to the authority, where deferred replies for it go, and the
//! records it owns. The ledger also keeps running counts of its records
//! per [`SuspicionTier`] and the weighted suspicion level derived from
//! them.
//!
//! The counters are updated incrementally on every state change. They are
//! never recomputed from the record list during normal operation;
//! [`SuspicionLedger::recount`] exists for verification.

use std::collections::VecDeque;
use std::time::Duration;

use fedarb_core::{ArbitrationConfig, MonoTime, NodeId, PartnerRef};

use crate::record::{RecordArena, RecordId, RecordState, SuspicionTier};

/// Number of owned records per suspicion tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierCounts {
    /// Pending and Reported2 records.
    pub weak: usize,
    /// Reported records.
    pub strong: usize,
    /// Rejected records.
    pub reject: usize,
}

impl TierCounts {
    /// Weighted suspicion level for these counts.
    pub fn level(&self, config: &ArbitrationConfig) -> i64 {
        weighted(self.weak, config.weak_suspicion_level)
            + weighted(self.strong, config.strong_suspicion_level)
            + weighted(self.reject, config.reject_suspicion_level)
    }

    fn slot(&mut self, tier: SuspicionTier) -> &mut usize {
        match tier {
            SuspicionTier::Weak => &mut self.weak,
            SuspicionTier::Strong => &mut self.strong,
            SuspicionTier::Reject => &mut self.reject,
        }
    }
}

fn weighted(count: usize, weight: i64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX).saturating_mul(weight)
}

/// Everything the authority knows about one node.
#[derive(Debug)]
pub struct SuspicionLedger {
    node: NodeId,
    instance: u64,
    last_received: Option<MonoTime>,
    from: Option<PartnerRef>,
    /// Newest first.
    records: VecDeque<RecordId>,
    counts: TierCounts,
    suspicion_level: i64,
}

impl SuspicionLedger {
    /// An empty ledger for `node` at instance 0.
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            instance: 0,
            last_received: None,
            from: None,
            records: VecDeque::new(),
            counts: TierCounts::default(),
            suspicion_level: 0,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Highest incarnation observed for the node.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// When the node last sent the authority anything.
    pub fn last_received(&self) -> Option<MonoTime> {
        self.last_received
    }

    /// Destination for deferred replies owed to the node.
    pub fn from(&self) -> Option<&PartnerRef> {
        self.from.as_ref()
    }

    pub fn counts(&self) -> TierCounts {
        self.counts
    }

    /// Cached weighted suspicion level. Records whose state is stale by
    /// time are only reclassified by the table's sweep.
    pub fn suspicion_level(&self) -> i64 {
        self.suspicion_level
    }

    /// Owned record ids, newest first.
    pub fn records(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.records.iter().copied()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Whether the node sent something within `window` of `now`.
    pub fn is_recently_live(&self, now: MonoTime, window: Duration) -> bool {
        self.last_received
            .is_some_and(|at| now.duration_since(at) < window)
    }

    /// Recompute tier counts from the records themselves.
    pub fn recount(&self, arena: &RecordArena) -> TierCounts {
        let mut counts = TierCounts::default();
        for record in self.records.iter().filter_map(|id| arena.get(*id)) {
            if let Some(tier) = record.state().tier() {
                *counts.slot(tier) += 1;
            }
        }
        counts
    }

    /// Note an inbound message from `sender`.
    ///
    /// The reply destination is replaced only by the first sender seen or
    /// by a strictly newer incarnation.
    pub(crate) fn receive_request(&mut self, sender: &PartnerRef, now: MonoTime) {
        self.last_received = Some(now);
        let replace = match &self.from {
            None => true,
            Some(current) => sender.node.instance > current.node.instance,
        };
        if replace {
            self.from = Some(sender.clone());
        }
    }

    /// Raise the recorded incarnation. Returns `false` if `instance` is not
    /// newer than the current one.
    pub(crate) fn raise_instance(&mut self, instance: u64) -> bool {
        if instance <= self.instance {
            return false;
        }
        self.instance = instance;
        true
    }

    pub(crate) fn push_record(&mut self, id: RecordId) {
        self.records.push_front(id);
    }

    /// Move `id` to the front after its process time was refreshed, so the
    /// list stays ordered newest first.
    pub(crate) fn touch_record(&mut self, id: RecordId) {
        if let Some(pos) = self.records.iter().position(|r| *r == id) {
            if let Some(id) = self.records.remove(pos) {
                self.records.push_front(id);
            }
        }
    }

    /// Move tier counts from `old` to `new` and refresh the level.
    ///
    /// Returns `true` when this change made the strong count reach the
    /// report threshold from below.
    ///
    /// # Panics
    ///
    /// Panics if `old` counts toward a tier whose counter is already zero;
    /// the counters are out of sync with the records.
    pub(crate) fn update_record_state(
        &mut self,
        old: RecordState,
        new: RecordState,
        config: &ArbitrationConfig,
    ) -> bool {
        if let Some(tier) = old.tier() {
            let slot = self.counts.slot(tier);
            assert!(
                *slot > 0,
                "ledger {} has no {:?} record to leave state {old}",
                self.node,
                tier
            );
            *slot -= 1;
        }
        let strong_before = self.counts.strong;
        if let Some(tier) = new.tier() {
            *self.counts.slot(tier) += 1;
        }
        self.suspicion_level = self.counts.level(config);

        let threshold = config.suspicion_report_threshold;
        strong_before < threshold && self.counts.strong >= threshold
    }

    /// Remove every owned record processed before `time_bound`, clearing
    /// the surviving peer's back-reference.
    ///
    /// Returns the number of records removed and whether the ledger is now
    /// empty and has heard nothing since `time_bound`.
    pub(crate) fn compact(
        &mut self,
        arena: &mut RecordArena,
        time_bound: MonoTime,
        config: &ArbitrationConfig,
    ) -> (usize, bool) {
        let records = std::mem::take(&mut self.records);
        let mut removed = 0;
        for id in records {
            let stale = match arena.get(id) {
                Some(record) => record.process_time < time_bound,
                None => continue,
            };
            if !stale {
                self.records.push_back(id);
                continue;
            }
            if let Some(record) = arena.remove(id) {
                self.update_record_state(record.state(), RecordState::None, config);
                if let Some(peer) = record.peer.and_then(|peer| arena.get_mut(peer)) {
                    peer.peer = None;
                }
                removed += 1;
            }
        }
        let idle = self.last_received.map_or(true, |at| at < time_bound);
        (removed, self.records.is_empty() && idle)
    }
}
