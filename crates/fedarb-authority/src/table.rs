//! # Arbitration Table
//!
//! All mutable arbitration state: the ledgers keyed by node, the record
//! arena, the list of deferred decisions, and the history watermark.
//! The table is owned by one [`ArbitrationAuthority`](crate::ArbitrationAuthority)
//! behind a single lock; nothing here synchronizes on its own.
//!
//! Every record state change goes through [`ArbitrationTable::set_state`],
//! which keeps the owning ledger's tier counters exact and escalates
//! corroborated reports to Reported2 when a node's strong count reaches the
//! report threshold.
//!
//! ## History Watermark
//!
//! `history_start` is the earliest instant the table still has complete
//! records for. It starts at construction time and is raised, never
//! lowered, by each retention sweep.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use fedarb_core::{ArbitrationConfig, MonoTime, NodeId, NodeInstance, PartnerRef, Timestamp};

use crate::ledger::SuspicionLedger;
use crate::message::{DelayedArbitrateReply, OutboundMessage, INFINITE};
use crate::record::{Decision, DisputeRecord, RecordArena, RecordId, RecordState};
use crate::retention::RetentionPolicy;
use crate::transport::DelayedResponseBuffer;

/// The monitor and subject records of one case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordPair {
    pub monitor: RecordId,
    pub subject: RecordId,
    /// Another record for the same participants exists with different
    /// lease instances.
    pub continuous: bool,
}

/// What one call to [`ArbitrationTable::compact`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Deferred decisions finalized to Grant.
    pub finalized: usize,
    /// Whether a retention sweep ran.
    pub swept: bool,
    /// Whether the sweep covered every ledger within its budget.
    pub complete: bool,
    pub records_removed: usize,
    pub ledgers_dropped: usize,
    /// Time until the next deferred decision is due.
    pub next_due: Option<Duration>,
}

/// Point-in-time size of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TableStats {
    pub ledgers: usize,
    pub records: usize,
    pub delayed: usize,
    pub history_start: MonoTime,
    pub last_compact: MonoTime,
}

/// Ledgers, records, and deferred decisions of one authority.
#[derive(Debug)]
pub struct ArbitrationTable {
    ledgers: BTreeMap<NodeId, SuspicionLedger>,
    records: RecordArena,
    delayed: Vec<RecordId>,
    start_time: MonoTime,
    history_start: MonoTime,
    last_compact: MonoTime,
    /// Where an over-budget sweep stopped.
    compact_cursor: Option<NodeId>,
}

impl ArbitrationTable {
    /// An empty table whose history starts at `now`.
    pub fn new(now: MonoTime) -> Self {
        Self {
            ledgers: BTreeMap::new(),
            records: RecordArena::new(),
            delayed: Vec::new(),
            start_time: now,
            history_start: now,
            last_compact: now,
            compact_cursor: None,
        }
    }

    // ── Read access ────────────────────────────────────────────────────

    pub fn ledger(&self, node: NodeId) -> Option<&SuspicionLedger> {
        self.ledgers.get(&node)
    }

    /// All ledgers in node order.
    pub fn ledgers(&self) -> impl Iterator<Item = &SuspicionLedger> {
        self.ledgers.values()
    }

    pub fn record(&self, id: RecordId) -> Option<&DisputeRecord> {
        self.records.get(id)
    }

    /// Deferred decisions awaiting finalization.
    pub fn delayed(&self) -> &[RecordId] {
        &self.delayed
    }

    pub fn start_time(&self) -> MonoTime {
        self.start_time
    }

    pub fn history_start(&self) -> MonoTime {
        self.history_start
    }

    pub fn last_compact(&self) -> MonoTime {
        self.last_compact
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            ledgers: self.ledgers.len(),
            records: self.records.len(),
            delayed: self.delayed.len(),
            history_start: self.history_start,
            last_compact: self.last_compact,
        }
    }

    /// Find `monitor`'s record of the case against `subject`, searching
    /// records processed at or after `time_bound`.
    pub fn find_record(
        &self,
        monitor: NodeInstance,
        subject: NodeInstance,
        monitor_lease_instance: i64,
        subject_lease_instance: i64,
        time_bound: MonoTime,
    ) -> Option<RecordId> {
        self.lookup(
            monitor,
            subject,
            monitor_lease_instance,
            subject_lease_instance,
            time_bound,
        )
        .0
    }

    /// Compare every ledger's cached counters with a recount of its
    /// records. Returns one line per discrepancy.
    pub fn audit(&self, config: &ArbitrationConfig) -> Vec<String> {
        let mut problems = Vec::new();
        for ledger in self.ledgers.values() {
            let recount = ledger.recount(&self.records);
            if recount != ledger.counts() {
                problems.push(format!(
                    "ledger {}: cached {:?}, recounted {:?}",
                    ledger.node(),
                    ledger.counts(),
                    recount
                ));
            }
            let level = recount.level(config);
            if level != ledger.suspicion_level() {
                problems.push(format!(
                    "ledger {}: cached level {}, recounted {}",
                    ledger.node(),
                    ledger.suspicion_level(),
                    level
                ));
            }
        }
        problems
    }

    // ── Ledger maintenance ─────────────────────────────────────────────

    fn ledger_mut(&mut self, node: NodeId) -> &mut SuspicionLedger {
        self.ledgers
            .entry(node)
            .or_insert_with(|| SuspicionLedger::new(node))
    }

    /// Adopt `instance` for `node` if it is newer. A node that restarted
    /// no longer stands behind its old rejected claims, so they count as
    /// reports.
    ///
    /// # Panics
    ///
    /// Panics if a Rejected record survives the adoption.
    pub(crate) fn update_instance(&mut self, node: NodeId, instance: u64, config: &ArbitrationConfig) {
        let ledger = self
            .ledgers
            .entry(node)
            .or_insert_with(|| SuspicionLedger::new(node));
        if !ledger.raise_instance(instance) {
            return;
        }
        let rejected: Vec<RecordId> = ledger
            .records()
            .filter(|id| {
                self.records
                    .get(*id)
                    .is_some_and(|r| r.state() == RecordState::Rejected)
            })
            .collect();
        for id in rejected {
            self.set_state(id, RecordState::Reported, config);
        }
        let remaining = self.ledgers.get(&node).map_or(0, |l| l.counts().reject);
        assert_eq!(
            remaining, 0,
            "node {node} still has rejected records after adopting instance {instance}"
        );
    }

    /// Note that `monitor` spoke, through `sender`.
    pub(crate) fn touch(
        &mut self,
        monitor: NodeInstance,
        sender: &PartnerRef,
        now: MonoTime,
        config: &ArbitrationConfig,
    ) {
        self.update_instance(monitor.id, monitor.instance, config);
        self.ledger_mut(monitor.id).receive_request(sender, now);
    }

    /// Whether the ledger for `node` has seen a newer incarnation than
    /// `instance`.
    pub(crate) fn is_stale(&self, node: NodeInstance) -> bool {
        self.ledgers
            .get(&node.id)
            .is_some_and(|l| l.instance() > node.instance)
    }

    pub(crate) fn is_recently_live(&self, node: NodeId, now: MonoTime, config: &ArbitrationConfig) -> bool {
        self.ledgers
            .get(&node)
            .is_some_and(|l| l.is_recently_live(now, config.max_lease_duration))
    }

    /// Reclassify `node`'s records that have gone stale by time, then
    /// return its suspicion level.
    pub(crate) fn suspicion_level(&mut self, node: NodeId, now: MonoTime, config: &ArbitrationConfig) -> i64 {
        let Some(ledger) = self.ledgers.get(&node) else {
            return 0;
        };
        let expire_bound = now - config.record_suspicion_expire_interval;
        let reject_bound = now - config.max_arbitration_timeout;
        let mut changes = Vec::new();
        for id in ledger.records() {
            let Some(record) = self.records.get(id) else {
                continue;
            };
            let next = match record.state() {
                RecordState::Implicit | RecordState::Expired => None,
                _ if record.process_time < expire_bound => Some(RecordState::Expired),
                RecordState::Pending if record.subject_expire_time <= now => Some(RecordState::Confirmed),
                RecordState::Rejected if record.process_time < reject_bound => Some(RecordState::Reported),
                _ => None,
            };
            if let Some(next) = next {
                changes.push((id, next));
            }
        }
        for (id, next) in changes {
            self.set_state(id, next, config);
        }
        self.ledgers.get(&node).map_or(0, |l| l.suspicion_level())
    }

    /// Whether `node` is at or above its suspicion threshold. The cached
    /// level is checked first; the sweep only lowers levels, so a node
    /// under the threshold stays under it.
    pub(crate) fn is_suspicious(
        &mut self,
        node: NodeId,
        keep_alive: bool,
        now: MonoTime,
        config: &ArbitrationConfig,
    ) -> bool {
        let threshold = if keep_alive {
            config.keep_alive_suspicion_level_threshold
        } else {
            config.suspicion_level_threshold
        };
        let cached = self.ledgers.get(&node).map_or(0, |l| l.suspicion_level());
        if cached < threshold {
            return false;
        }
        self.suspicion_level(node, now, config) >= threshold
    }

    // ── Record state ───────────────────────────────────────────────────

    /// Move a record to `new`, keeping its owner's counters exact.
    ///
    /// # Panics
    ///
    /// Panics on a transition into or out of `Implicit`, or if the
    /// record's owner has no ledger.
    pub(crate) fn set_state(&mut self, id: RecordId, new: RecordState, config: &ArbitrationConfig) {
        let Some(record) = self.records.get_mut(id) else {
            return;
        };
        let old = record.state;
        if old == new {
            return;
        }
        assert!(
            old != RecordState::Implicit && new != RecordState::Implicit,
            "record {id}: implicit records never change state ({old} -> {new})"
        );
        record.state = new;
        let owner = record.owner;
        let Some(ledger) = self.ledgers.get_mut(&owner) else {
            panic!("record {id} is owned by {owner}, which has no ledger");
        };
        if ledger.update_record_state(old, new, config) {
            self.escalate_reports(owner, config);
        }
    }

    /// `node` now holds enough Reported records to be corroborated by
    /// independent reporters: every peer of one of those records that is
    /// itself Reported escalates to Reported2.
    fn escalate_reports(&mut self, node: NodeId, config: &ArbitrationConfig) {
        let Some(ledger) = self.ledgers.get(&node) else {
            return;
        };
        let peers: Vec<RecordId> = ledger
            .records()
            .filter_map(|id| self.records.get(id))
            .filter(|r| r.state() == RecordState::Reported)
            .filter_map(|r| r.peer)
            .collect();
        let mut escalated = 0;
        for peer in peers {
            if self.records.get(peer).is_some_and(|r| r.state() == RecordState::Reported) {
                self.set_state(peer, RecordState::Reported2, config);
                escalated += 1;
            }
        }
        tracing::debug!(node = %node, escalated, "report threshold reached");
    }

    /// Record a decision on a record, with its state side effects.
    ///
    /// A Reject puts a non-implicit record in Rejected; any other decision
    /// lifts a Rejected record back to Reported. A Grant forces an
    /// undecided peer to Reject.
    pub(crate) fn set_decision(&mut self, id: RecordId, decision: Decision, config: &ArbitrationConfig) {
        let Some(record) = self.records.get(id) else {
            return;
        };
        let state = record.state();
        if decision == Decision::Reject {
            if state != RecordState::Implicit {
                self.set_state(id, RecordState::Rejected, config);
            }
        } else if state == RecordState::Rejected {
            self.set_state(id, RecordState::Reported, config);
        }
        let Some(record) = self.records.get_mut(id) else {
            return;
        };
        record.decision = decision;
        let peer = record.peer;
        if decision == Decision::Grant {
            if let Some(peer) = peer.filter(|p| self.records.get(*p).is_some_and(|r| !r.is_present())) {
                self.set_decision(peer, Decision::Reject, config);
            }
        }
    }

    pub(crate) fn record_mut(&mut self, id: RecordId) -> Option<&mut DisputeRecord> {
        self.records.get_mut(id)
    }

    /// Store a record in its owner's ledger.
    pub(crate) fn insert_record(&mut self, record: DisputeRecord) -> RecordId {
        let owner = record.owner;
        let id = self.records.insert(record);
        self.ledger_mut(owner).push_record(id);
        id
    }

    // ── Case lookup ────────────────────────────────────────────────────

    fn lookup(
        &self,
        monitor: NodeInstance,
        subject: NodeInstance,
        monitor_lease_instance: i64,
        subject_lease_instance: i64,
        time_bound: MonoTime,
    ) -> (Option<RecordId>, bool) {
        let Some(ledger) = self.ledgers.get(&monitor.id) else {
            return (None, false);
        };
        let mut found = None;
        let mut other = false;
        for id in ledger.records() {
            let Some(record) = self.records.get(id) else {
                continue;
            };
            if record.process_time < time_bound {
                break;
            }
            if record.is_implicit()
                || record.monitor_instance != monitor.instance
                || record.subject != subject
            {
                continue;
            }
            if record.matches(
                monitor.instance,
                subject,
                monitor_lease_instance,
                subject_lease_instance,
            ) {
                found = found.or(Some(id));
            } else {
                other = true;
            }
        }
        (found, other)
    }

    /// Find the monitor's record of a case, creating it if absent, and make
    /// sure it has a linked mirror in the subject's ledger.
    pub(crate) fn find_or_create_pair(
        &mut self,
        monitor: NodeInstance,
        subject: NodeInstance,
        monitor_lease_instance: i64,
        subject_lease_instance: i64,
        time_bound: MonoTime,
        now: MonoTime,
    ) -> RecordPair {
        let (found, continuous) = self.lookup(
            monitor,
            subject,
            monitor_lease_instance,
            subject_lease_instance,
            time_bound,
        );
        let monitor_id = match found {
            Some(id) => {
                if let Some(record) = self.records.get_mut(id) {
                    record.adopt_lease_instances(monitor_lease_instance, subject_lease_instance);
                }
                id
            }
            None => self.insert_record(DisputeRecord::new(
                monitor,
                subject,
                monitor_lease_instance,
                subject_lease_instance,
                now,
            )),
        };

        let existing_peer = self
            .records
            .get(monitor_id)
            .and_then(|r| r.peer)
            .filter(|p| self.records.contains(*p));
        let subject_id = match existing_peer {
            Some(peer) => {
                if let Some(record) = self.records.get_mut(peer) {
                    record.adopt_lease_instances(subject_lease_instance, monitor_lease_instance);
                }
                peer
            }
            None => {
                let mut mirror = DisputeRecord::new(
                    subject,
                    monitor,
                    subject_lease_instance,
                    monitor_lease_instance,
                    now,
                );
                mirror.peer = Some(monitor_id);
                let peer = self.insert_record(mirror);
                if let Some(record) = self.records.get_mut(monitor_id) {
                    record.peer = Some(peer);
                }
                peer
            }
        };

        RecordPair {
            monitor: monitor_id,
            subject: subject_id,
            continuous,
        }
    }

    /// Refresh a monitor record for a new claim and move both sides of the
    /// case into their accusation states.
    pub(crate) fn update_on_new_request(
        &mut self,
        id: RecordId,
        subject_ttl: Duration,
        now: MonoTime,
        config: &ArbitrationConfig,
    ) {
        let Some(record) = self.records.get_mut(id) else {
            return;
        };
        record.process_time = now;
        record.subject_expire_time = now + subject_ttl;
        record.subject_ttl = subject_ttl;
        let owner = record.owner;
        let peer_id = record.peer;
        self.ledger_mut(owner).touch_record(id);
        let peer = peer_id.and_then(|p| self.records.get(p).map(|r| (p, r.is_present(), r.state())));

        let claim = if subject_ttl.is_zero() {
            RecordState::Confirmed
        } else {
            RecordState::Pending
        };
        match peer {
            Some((peer, false, peer_state)) => {
                self.set_state(id, claim, config);
                // Confirmed and Expired peers have no path back to Reported.
                if matches!(peer_state, RecordState::None | RecordState::Pending) {
                    self.set_state(peer, RecordState::Reported, config);
                }
            }
            Some((peer, true, RecordState::Pending)) => {
                self.set_state(peer, RecordState::Reported, config);
            }
            Some(_) => {}
            None => self.set_state(id, claim, config),
        }
    }

    /// Newest implicit record between `a` and `b`, from either side,
    /// processed at or after `time_bound`. On a tie the record from `b`'s
    /// ledger wins.
    pub(crate) fn latest_implicit(&self, a: NodeId, b: NodeId, time_bound: MonoTime) -> Option<RecordId> {
        let mine = self.scan_implicit(a, b, time_bound);
        let theirs = self.scan_implicit(b, a, time_bound);
        match (mine, theirs) {
            (Some(m), Some(t)) => {
                let time = |id| self.records.get(id).map(|r| r.process_time);
                if time(t) >= time(m) {
                    Some(t)
                } else {
                    Some(m)
                }
            }
            (m, t) => m.or(t),
        }
    }

    fn scan_implicit(&self, owner: NodeId, other: NodeId, time_bound: MonoTime) -> Option<RecordId> {
        let ledger = self.ledgers.get(&owner)?;
        ledger
            .records()
            .map_while(|id| {
                self.records
                    .get(id)
                    .filter(|r| r.process_time >= time_bound)
                    .map(|r| (id, r))
            })
            .find(|(_, r)| r.is_implicit() && r.subject.id == other)
            .map(|(id, _)| id)
    }

    // ── Deferred decisions ─────────────────────────────────────────────

    pub(crate) fn push_delayed(&mut self, id: RecordId) {
        if !self.delayed.contains(&id) {
            self.delayed.push(id);
        }
    }

    pub(crate) fn remove_delayed(&mut self, id: RecordId) {
        self.delayed.retain(|d| *d != id);
    }

    /// Queue a one-way verdict for the owner of `id` at its last known
    /// address.
    pub(crate) fn queue_delayed_reply(&self, id: RecordId, decision: Decision, out: &mut DelayedResponseBuffer) {
        let Some(record) = self.records.get(id) else {
            return;
        };
        let Some(destination) = self.ledgers.get(&record.owner).and_then(|l| l.from()) else {
            tracing::warn!(
                owner = %record.owner,
                decision = %decision,
                "no known address for delayed reply, dropping it"
            );
            return;
        };
        let subject_granted_ttl = if decision == Decision::Grant {
            record.subject_ttl
        } else {
            INFINITE
        };
        out.push(
            OutboundMessage::DelayedArbitrateReply(DelayedArbitrateReply {
                monitor: NodeInstance::new(record.owner, record.monitor_instance),
                subject: record.subject,
                monitor_lease_instance: record.monitor_lease_instance,
                subject_lease_instance: record.subject_lease_instance,
                decision,
                subject_granted_ttl,
                flags: record.flags,
            }),
            destination.clone(),
        );
    }

    /// Finalize every deferred decision whose delay has elapsed. Returns
    /// how many were finalized and the time until the next one is due.
    fn drain_delayed(
        &mut self,
        now: MonoTime,
        config: &ArbitrationConfig,
        out: &mut DelayedResponseBuffer,
    ) -> (usize, Option<Duration>) {
        let mut finalized = 0;
        let mut next_due: Option<Duration> = None;
        let mut waiting = Vec::new();
        for id in std::mem::take(&mut self.delayed) {
            let Some(record) = self.records.get(id) else {
                continue;
            };
            if record.decision != Decision::Delay {
                continue;
            }
            let due = record.process_time + config.delay_interval;
            if now >= due {
                self.set_decision(id, Decision::Grant, config);
                self.queue_delayed_reply(id, Decision::Grant, out);
                finalized += 1;
            } else {
                let wait = due.duration_since(now);
                next_due = Some(next_due.map_or(wait, |n| n.min(wait)));
                waiting.push(id);
            }
        }
        self.delayed = waiting;
        (finalized, next_due)
    }

    // ── Compaction ─────────────────────────────────────────────────────

    /// Finalize due deferred decisions and, if one is due, run a retention
    /// sweep bounded by the configured wall-clock budget.
    pub(crate) fn compact(
        &mut self,
        now: MonoTime,
        config: &ArbitrationConfig,
        out: &mut DelayedResponseBuffer,
    ) -> CompactionReport {
        let (finalized, next_due) = self.drain_delayed(now, config, out);
        let mut report = CompactionReport {
            finalized,
            next_due,
            ..CompactionReport::default()
        };

        let policy = RetentionPolicy::from_config(config);
        if !policy.sweep_due(self.last_compact, now) {
            return report;
        }

        let time_bound = policy.time_bound(now);
        let started = Instant::now();
        let nodes: Vec<NodeId> = match self.compact_cursor.take() {
            Some(cursor) => self.ledgers.range(cursor..).map(|(node, _)| *node).collect(),
            None => self.ledgers.keys().copied().collect(),
        };
        let mut complete = true;
        for (i, node) in nodes.iter().enumerate() {
            if let Some(ledger) = self.ledgers.get_mut(node) {
                let (removed, drop) = ledger.compact(&mut self.records, time_bound, config);
                report.records_removed += removed;
                if drop {
                    self.ledgers.remove(node);
                    report.ledgers_dropped += 1;
                }
            }
            if started.elapsed() > policy.budget() {
                if let Some(next) = nodes.get(i + 1) {
                    self.compact_cursor = Some(*next);
                    complete = false;
                }
                break;
            }
        }

        if complete {
            self.last_compact = now;
        } else {
            tracing::warn!(
                budget_ms = policy.budget().as_millis() as u64,
                resume_at = ?self.compact_cursor,
                "retention sweep exceeded its budget, resuming on next call"
            );
        }
        self.history_start = self.history_start.max(time_bound);
        report.swept = true;
        report.complete = complete;
        report
    }

    // ── Diagnostics ────────────────────────────────────────────────────

    /// Human-readable rendering of the whole table.
    pub fn dump(&self, now: MonoTime) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "arbitration table @ {} now={} start={} history_start={} last_compact={} ledgers={} records={} delayed={}",
            Timestamp::now(),
            now,
            self.start_time,
            self.history_start,
            self.last_compact,
            self.ledgers.len(),
            self.records.len(),
            self.delayed.len()
        );
        for ledger in self.ledgers.values() {
            let counts = ledger.counts();
            let _ = writeln!(
                out,
                "ledger {} instance={} last_received={} from={} weak={} strong={} reject={} level={}",
                ledger.node(),
                ledger.instance(),
                ledger
                    .last_received()
                    .map_or_else(|| "never".to_string(), |t| t.to_string()),
                ledger.from().map_or_else(|| "-".to_string(), |p| p.to_string()),
                counts.weak,
                counts.strong,
                counts.reject,
                ledger.suspicion_level()
            );
            for id in ledger.records() {
                let Some(r) = self.records.get(id) else {
                    continue;
                };
                let _ = writeln!(
                    out,
                    "  {id} monitor_instance={} subject={} lease={}/{} processed={} expires={} decision={} state={} flags={} peer={} implicit={}/{}",
                    r.monitor_instance,
                    r.subject,
                    r.monitor_lease_instance,
                    r.subject_lease_instance,
                    r.process_time,
                    r.subject_expire_time,
                    r.decision,
                    r.state(),
                    r.flags,
                    r.peer.map_or_else(|| "-".to_string(), |p| p.to_string()),
                    r.implicit_arbitration1,
                    r.implicit_arbitration2
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(id: u128) -> NodeInstance {
        NodeInstance::new(NodeId::new(id), 1)
    }

    fn pair(table: &mut ArbitrationTable, monitor: u128, subject: u128) -> RecordPair {
        table.ledger_mut(NodeId::new(monitor));
        table.ledger_mut(NodeId::new(subject));
        table.find_or_create_pair(node(monitor), node(subject), 1, 1, MonoTime::ZERO, MonoTime::ZERO)
    }

    fn state(table: &ArbitrationTable, id: RecordId) -> RecordState {
        table.record(id).map(|r| r.state()).unwrap_or(RecordState::None)
    }

    #[test]
    fn pair_records_mirror_each_other() {
        let mut table = ArbitrationTable::new(MonoTime::ZERO);
        let p = pair(&mut table, 1, 2);
        let m = table.record(p.monitor).unwrap();
        let s = table.record(p.subject).unwrap();
        assert_eq!(m.owner, NodeId::new(1));
        assert_eq!(s.owner, NodeId::new(2));
        assert_eq!(s.subject, node(1));
        assert_eq!(m.peer, Some(p.subject));
        assert_eq!(s.peer, Some(p.monitor));

        // A second lookup finds the same pair.
        let again = pair(&mut table, 1, 2);
        assert_eq!(again, p);
    }

    #[test]
    fn different_lease_instance_is_a_new_continuous_case() {
        let config = ArbitrationConfig::default();
        let mut table = ArbitrationTable::new(MonoTime::ZERO);
        let first = pair(&mut table, 1, 2);
        let second = table.find_or_create_pair(node(1), node(2), 2, 1, MonoTime::ZERO, MonoTime::ZERO);
        assert_ne!(first.monitor, second.monitor);
        assert!(second.continuous);
        assert!(table.audit(&config).is_empty());
    }

    #[test]
    fn new_request_moves_both_sides() {
        let config = ArbitrationConfig::default();
        let mut table = ArbitrationTable::new(MonoTime::ZERO);
        let p = pair(&mut table, 1, 2);
        table.update_on_new_request(p.monitor, Duration::from_secs(10), MonoTime::ZERO, &config);
        assert_eq!(state(&table, p.monitor), RecordState::Pending);
        assert_eq!(state(&table, p.subject), RecordState::Reported);
        assert_eq!(table.ledger(NodeId::new(1)).unwrap().suspicion_level(), 1);
        assert_eq!(table.ledger(NodeId::new(2)).unwrap().suspicion_level(), 3);
    }

    #[test]
    fn settled_peer_is_not_reported_again() {
        let config = ArbitrationConfig::default();
        for settled in [RecordState::Expired, RecordState::Confirmed] {
            let mut table = ArbitrationTable::new(MonoTime::ZERO);
            let p = pair(&mut table, 1, 2);
            table.set_state(p.subject, settled, &config);
            table.update_on_new_request(p.monitor, Duration::from_secs(10), MonoTime::ZERO, &config);
            assert_eq!(state(&table, p.monitor), RecordState::Pending);
            assert_eq!(state(&table, p.subject), settled);
            assert_eq!(table.ledger(NodeId::new(2)).unwrap().counts().strong, 0);
            assert!(table.audit(&config).is_empty());
        }
    }

    #[test]
    fn pending_peer_is_reported() {
        let config = ArbitrationConfig::default();
        let mut table = ArbitrationTable::new(MonoTime::ZERO);
        let p = pair(&mut table, 1, 2);
        table.set_state(p.subject, RecordState::Pending, &config);
        table.update_on_new_request(p.monitor, Duration::ZERO, MonoTime::ZERO, &config);
        assert_eq!(state(&table, p.subject), RecordState::Reported);
    }

    #[test]
    fn zero_ttl_claim_is_confirmed() {
        let config = ArbitrationConfig::default();
        let mut table = ArbitrationTable::new(MonoTime::ZERO);
        let p = pair(&mut table, 1, 2);
        table.update_on_new_request(p.monitor, Duration::ZERO, MonoTime::ZERO, &config);
        assert_eq!(state(&table, p.monitor), RecordState::Confirmed);
    }

    #[test]
    fn grant_forces_undecided_peer_to_reject() {
        let config = ArbitrationConfig::default();
        let mut table = ArbitrationTable::new(MonoTime::ZERO);
        let p = pair(&mut table, 1, 2);
        table.update_on_new_request(p.monitor, Duration::ZERO, MonoTime::ZERO, &config);
        table.set_decision(p.monitor, Decision::Grant, &config);
        let s = table.record(p.subject).unwrap();
        assert_eq!(s.decision, Decision::Reject);
        assert_eq!(s.state(), RecordState::Rejected);
        assert_eq!(table.ledger(NodeId::new(2)).unwrap().counts().reject, 1);
    }

    #[test]
    fn non_reject_decision_lifts_rejected_record() {
        let config = ArbitrationConfig::default();
        let mut table = ArbitrationTable::new(MonoTime::ZERO);
        let p = pair(&mut table, 1, 2);
        table.set_decision(p.monitor, Decision::Reject, &config);
        assert_eq!(state(&table, p.monitor), RecordState::Rejected);
        table.set_decision(p.monitor, Decision::Neutral, &config);
        assert_eq!(state(&table, p.monitor), RecordState::Reported);
    }

    #[test]
    fn newer_instance_clears_rejections() {
        let config = ArbitrationConfig::default();
        let mut table = ArbitrationTable::new(MonoTime::ZERO);
        let p = pair(&mut table, 1, 2);
        table.set_decision(p.monitor, Decision::Reject, &config);
        table.update_instance(NodeId::new(1), 2, &config);
        let ledger = table.ledger(NodeId::new(1)).unwrap();
        assert_eq!(ledger.instance(), 2);
        assert_eq!(ledger.counts().reject, 0);
        assert_eq!(state(&table, p.monitor), RecordState::Reported);
    }

    #[test]
    fn report_threshold_escalates_reported_peers() {
        let config = ArbitrationConfig::default();
        let mut table = ArbitrationTable::new(MonoTime::ZERO);
        let accused = 1;
        let mut pairs = Vec::new();
        for accuser in 2..=5u128 {
            let p = pair(&mut table, accuser, accused);
            table.set_state(p.monitor, RecordState::Reported, &config);
            pairs.push(p);
        }
        for p in &pairs[..3] {
            table.set_state(p.subject, RecordState::Reported, &config);
        }
        for p in &pairs[..3] {
            assert_eq!(state(&table, p.monitor), RecordState::Reported2);
            let ledger = table.ledger(table.record(p.monitor).unwrap().owner).unwrap();
            assert_eq!(ledger.counts().weak, 1);
            assert_eq!(ledger.counts().strong, 0);
        }

        // Already at the threshold: no second escalation.
        table.set_state(pairs[3].subject, RecordState::Reported, &config);
        assert_eq!(state(&table, pairs[3].monitor), RecordState::Reported);
        assert!(table.audit(&config).is_empty());
    }

    #[test]
    fn sweep_reclassifies_by_age() {
        let config = ArbitrationConfig::default();
        let mut table = ArbitrationTable::new(MonoTime::ZERO);
        let p = pair(&mut table, 1, 2);
        table.update_on_new_request(p.monitor, Duration::from_secs(10), MonoTime::ZERO, &config);
        let q = pair(&mut table, 1, 3);
        table.set_decision(q.monitor, Decision::Reject, &config);

        // 10s: the pending claim's subject TTL elapsed.
        table.suspicion_level(NodeId::new(1), MonoTime::from_millis(10_000), &config);
        assert_eq!(state(&table, p.monitor), RecordState::Confirmed);
        assert_eq!(state(&table, q.monitor), RecordState::Rejected);

        // 41s: the rejection is older than one arbitration timeout.
        table.suspicion_level(NodeId::new(1), MonoTime::from_millis(41_000), &config);
        assert_eq!(state(&table, q.monitor), RecordState::Reported);

        // 301s: everything has expired.
        let level = table.suspicion_level(NodeId::new(1), MonoTime::from_millis(301_000), &config);
        assert_eq!(level, 0);
        assert_eq!(state(&table, q.monitor), RecordState::Expired);
    }

    #[test]
    fn cheap_suspicion_test_skips_sweep_below_threshold() {
        let config = ArbitrationConfig::default();
        let mut table = ArbitrationTable::new(MonoTime::ZERO);
        assert!(!table.is_suspicious(NodeId::new(9), false, MonoTime::ZERO, &config));
        let p = pair(&mut table, 1, 2);
        table.update_on_new_request(p.monitor, Duration::from_secs(10), MonoTime::ZERO, &config);
        assert!(table.is_suspicious(NodeId::new(2), false, MonoTime::ZERO, &config));
        assert!(!table.is_suspicious(NodeId::new(2), true, MonoTime::ZERO, &config));
    }

    #[test]
    fn compaction_waits_for_cleanup_interval() {
        let config = ArbitrationConfig::default();
        let mut table = ArbitrationTable::new(MonoTime::ZERO);
        let mut out = DelayedResponseBuffer::new();
        let report = table.compact(MonoTime::from_millis(29_000), &config, &mut out);
        assert!(!report.swept);
        let report = table.compact(MonoTime::from_millis(30_000), &config, &mut out);
        assert!(report.swept && report.complete);
        assert_eq!(table.last_compact(), MonoTime::from_millis(30_000));
    }

    #[test]
    fn compaction_drops_old_records_and_raises_history() {
        let config = ArbitrationConfig::default();
        let mut table = ArbitrationTable::new(MonoTime::ZERO);
        let p = pair(&mut table, 1, 2);
        table.update_on_new_request(p.monitor, Duration::from_secs(1), MonoTime::ZERO, &config);
        let mut out = DelayedResponseBuffer::new();
        let now = MonoTime::from_millis(400_000);
        let report = table.compact(now, &config, &mut out);
        assert_eq!(report.records_removed, 2);
        assert_eq!(report.ledgers_dropped, 2);
        assert_eq!(table.history_start(), MonoTime::from_millis(100_000));
        assert!(table.record(p.monitor).is_none());
        assert!(table.ledger(NodeId::new(1)).is_none());
    }

    #[test]
    fn over_budget_sweep_resumes() {
        let config = ArbitrationConfig {
            compaction_budget: Duration::ZERO,
            ..ArbitrationConfig::default()
        };
        let mut table = ArbitrationTable::new(MonoTime::ZERO);
        for id in 1..=4 {
            table.ledger_mut(NodeId::new(id));
        }
        let mut out = DelayedResponseBuffer::new();
        let now = MonoTime::from_millis(400_000);
        let mut passes = 0;
        loop {
            passes += 1;
            let report = table.compact(now, &config, &mut out);
            assert!(report.swept);
            if report.complete {
                break;
            }
            assert!(passes < 10, "sweep never completed");
        }
        assert!(table.ledgers().next().is_none());
        assert_eq!(table.last_compact(), now);
    }

    #[derive(Debug, Clone)]
    enum Op {
        State(usize, RecordState),
        Decide(usize, Decision),
        Restart(u128),
        Sweep(u128, u64),
    }

    fn arb_state() -> impl Strategy<Value = RecordState> {
        prop_oneof![
            Just(RecordState::None),
            Just(RecordState::Pending),
            Just(RecordState::Confirmed),
            Just(RecordState::Reported),
            Just(RecordState::Reported2),
            Just(RecordState::Rejected),
            Just(RecordState::Expired),
        ]
    }

    fn arb_decision() -> impl Strategy<Value = Decision> {
        prop_oneof![
            Just(Decision::Grant),
            Just(Decision::Reject),
            Just(Decision::Neutral),
            Just(Decision::Delay),
        ]
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..24, arb_state()).prop_map(|(i, s)| Op::State(i, s)),
            (0usize..24, arb_decision()).prop_map(|(i, d)| Op::Decide(i, d)),
            (1u128..=4).prop_map(Op::Restart),
            (1u128..=4, 0u64..400).prop_map(|(n, s)| Op::Sweep(n, s)),
        ]
    }

    proptest! {
        #[test]
        fn counters_match_records(ops in proptest::collection::vec(arb_op(), 1..80)) {
            let config = ArbitrationConfig::default();
            let mut table = ArbitrationTable::new(MonoTime::ZERO);
            let mut ids = Vec::new();
            for monitor in 1..=4u128 {
                for subject in 1..=4u128 {
                    if monitor != subject {
                        let p = pair(&mut table, monitor, subject);
                        ids.push(p.monitor);
                        ids.push(p.subject);
                    }
                }
            }
            let mut instance = 1;
            for op in ops {
                match op {
                    Op::State(i, s) => table.set_state(ids[i % ids.len()], s, &config),
                    Op::Decide(i, d) => table.set_decision(ids[i % ids.len()], d, &config),
                    Op::Restart(n) => {
                        instance += 1;
                        table.update_instance(NodeId::new(n), instance, &config);
                    }
                    Op::Sweep(n, secs) => {
                        table.suspicion_level(NodeId::new(n), MonoTime::from_millis(secs * 1_000), &config);
                    }
                }
                let problems = table.audit(&config);
                prop_assert!(problems.is_empty(), "{:?}", problems);
            }
        }

        #[test]
        fn instance_never_decreases(instances in proptest::collection::vec(0u64..50, 1..40)) {
            let config = ArbitrationConfig::default();
            let mut table = ArbitrationTable::new(MonoTime::ZERO);
            let node = NodeId::new(1);
            let mut highest = 0;
            for instance in instances {
                table.update_instance(node, instance, &config);
                highest = highest.max(instance);
                prop_assert_eq!(table.ledger(node).map(|l| l.instance()), Some(highest));
            }
        }
    }
}
