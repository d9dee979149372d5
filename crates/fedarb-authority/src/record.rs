//! # Dispute Records
//!
//! One [`DisputeRecord`] exists per participant of one arbitration case:
//! the monitor's record lives in the monitor's ledger, its mirror lives in
//! the subject's ledger, and the two point at each other through `peer`.
//! Implicit arbitration records stand alone.
//!
//! Records live in a [`RecordArena`] and are addressed by generation-stamped
//! [`RecordId`]s. A removed record's id never resolves again, so a stale
//! peer or delayed-list reference reads as "gone" instead of aliasing a
//! newer record.
//!
//! ## Record State Machine
//!
//! ```text
//! None ──▶ Pending ──▶ Confirmed
//!   │         └──────▶ Expired
//!   ├────▶ Reported ──▶ Reported2 ──▶ Rejected ──▶ Reported
//!   │         └──────▶ Rejected          └──────▶ Expired
//!   ├────▶ Rejected
//!   └────▶ Implicit   (absorbing; entered only at creation)
//! ```
//!
//! State drives the owning ledger's suspicion counters (see
//! [`RecordState::tier`]); it is changed only through the table so the
//! counters stay exact.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use fedarb_core::{MonoTime, NodeId, NodeInstance};

// ── Decision ───────────────────────────────────────────────────────────

/// The authority's verdict on one participant's claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Not decided yet.
    None,
    /// The claimant may break the lease.
    Grant,
    /// The claimant must not break the lease.
    Reject,
    /// Neither side wins; the claimant keeps its lease semantics.
    Neutral,
    /// Deferred; finalized to Grant after the delay interval unless
    /// resolved earlier.
    Delay,
}

impl Decision {
    /// The canonical string name of this decision.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Grant => "grant",
            Self::Reject => "reject",
            Self::Neutral => "neutral",
            Self::Delay => "delay",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Record State ───────────────────────────────────────────────────────

/// Suspicion tier a record state counts toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuspicionTier {
    /// Pending, Reported2.
    Weak,
    /// Reported.
    Strong,
    /// Rejected.
    Reject,
}

/// Lifecycle state of a record, from the owning node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Freshly created mirror; nothing known yet.
    None,
    /// The owner asked for arbitration and is waiting out the subject's TTL.
    Pending,
    /// The owner's wait elapsed (or was never needed).
    Confirmed,
    /// Another node reported the owner as unreachable.
    Reported,
    /// Reported, escalated when the peer record's owner reached the report threshold.
    Reported2,
    /// The owner's claim was rejected.
    Rejected,
    /// Too old to count.
    Expired,
    /// Implicit-arbitration log entry.
    Implicit,
}

impl RecordState {
    /// The suspicion tier this state counts toward, if any.
    pub fn tier(&self) -> Option<SuspicionTier> {
        match self {
            Self::Pending | Self::Reported2 => Some(SuspicionTier::Weak),
            Self::Reported => Some(SuspicionTier::Strong),
            Self::Rejected => Some(SuspicionTier::Reject),
            Self::None | Self::Confirmed | Self::Expired | Self::Implicit => None,
        }
    }

    /// The canonical string name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Reported => "reported",
            Self::Reported2 => "reported2",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
            Self::Implicit => "implicit",
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Reply Flags ────────────────────────────────────────────────────────

bitflags::bitflags! {
    /// Auxiliary reply metadata carried alongside a decision.
    ///
    /// Not part of the decision state machine. Serialized as its raw bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReplyFlags: u8 {
        /// The decision came from the extended two-way protocol.
        const EXTENDED = 0x1;
        /// The decision is backed by mature history or a conservative override.
        const STRONG = 0x2;
        /// The case has unbroken history back to its origin.
        const CONTINUOUS = 0x4;
        /// The decision was deferred; a delayed reply will follow.
        const DELAYED = 0x8;
    }
}

impl Default for ReplyFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl Serialize for ReplyFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ReplyFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u8::deserialize(deserializer).map(Self::from_bits_retain)
    }
}

impl fmt::Display for ReplyFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("-");
        }
        for (i, (name, _)) in self.iter_names().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            f.write_str(&name.to_ascii_lowercase())?;
        }
        Ok(())
    }
}

// ── Record ─────────────────────────────────────────────────────────────

/// Handle to a record in a [`RecordArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    index: u32,
    generation: u32,
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// One participant's side of one arbitration case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisputeRecord {
    /// Node whose ledger owns this record.
    pub owner: NodeId,
    /// Incarnation of the owner when it acted as monitor.
    pub monitor_instance: u64,
    /// The other participant.
    pub subject: NodeInstance,
    /// Owner-side lease instance; 0 means unspecified.
    pub monitor_lease_instance: i64,
    /// Subject-side lease instance; 0 means unspecified.
    pub subject_lease_instance: i64,
    /// When the record was created or last refreshed.
    pub process_time: MonoTime,
    /// When the subject's lease expires; meaningful while Pending.
    pub subject_expire_time: MonoTime,
    /// TTL the owner asked to grant the subject.
    pub subject_ttl: Duration,
    /// Current verdict on the owner's claim.
    pub decision: Decision,
    /// Reply metadata.
    pub flags: ReplyFlags,
    /// Current state; changed only through the table.
    pub(crate) state: RecordState,
    /// Mirror record on the other participant's ledger.
    pub peer: Option<RecordId>,
    /// First implicit-arbitration counter.
    pub implicit_arbitration1: i64,
    /// Second implicit-arbitration counter.
    pub implicit_arbitration2: i64,
}

impl DisputeRecord {
    /// A fresh, undecided record in state `None`.
    pub fn new(
        owner: NodeInstance,
        subject: NodeInstance,
        monitor_lease_instance: i64,
        subject_lease_instance: i64,
        now: MonoTime,
    ) -> Self {
        Self {
            owner: owner.id,
            monitor_instance: owner.instance,
            subject,
            monitor_lease_instance,
            subject_lease_instance,
            process_time: now,
            subject_expire_time: now,
            subject_ttl: Duration::ZERO,
            decision: Decision::None,
            flags: ReplyFlags::empty(),
            state: RecordState::None,
            peer: None,
            implicit_arbitration1: 0,
            implicit_arbitration2: 0,
        }
    }

    /// A standalone implicit-arbitration record.
    pub fn implicit(
        owner: NodeInstance,
        subject: NodeInstance,
        counters: (i64, i64),
        decision: Decision,
        now: MonoTime,
    ) -> Self {
        let mut record = Self::new(owner, subject, 0, 0, now);
        record.state = RecordState::Implicit;
        record.decision = decision;
        record.implicit_arbitration1 = counters.0;
        record.implicit_arbitration2 = counters.1;
        record
    }

    /// Current state.
    pub fn state(&self) -> RecordState {
        self.state
    }

    /// Whether a decision has been made.
    pub fn is_present(&self) -> bool {
        self.decision != Decision::None
    }

    /// Whether the owner used the extended two-way protocol.
    pub fn is_extended(&self) -> bool {
        self.monitor_lease_instance > 0
    }

    /// Whether the record is an implicit-arbitration entry.
    pub fn is_implicit(&self) -> bool {
        self.state == RecordState::Implicit
    }

    /// Whether this record describes the case `(monitor_instance, subject,
    /// lease instances)`. A lease instance of 0 on either side matches
    /// anything.
    pub fn matches(
        &self,
        monitor_instance: u64,
        subject: NodeInstance,
        monitor_lease_instance: i64,
        subject_lease_instance: i64,
    ) -> bool {
        self.monitor_instance == monitor_instance
            && self.subject == subject
            && lease_instance_compatible(self.monitor_lease_instance, monitor_lease_instance)
            && lease_instance_compatible(self.subject_lease_instance, subject_lease_instance)
    }

    /// Fill in lease instances the record left unspecified.
    pub fn adopt_lease_instances(&mut self, monitor_lease_instance: i64, subject_lease_instance: i64) {
        if self.monitor_lease_instance == 0 {
            self.monitor_lease_instance = monitor_lease_instance;
        }
        if self.subject_lease_instance == 0 {
            self.subject_lease_instance = subject_lease_instance;
        }
    }
}

fn lease_instance_compatible(stored: i64, requested: i64) -> bool {
    stored == 0 || requested == 0 || stored == requested
}

// ── Arena ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<DisputeRecord>,
}

/// Generation-stamped storage for every record of an authority.
///
/// Freed slots are reused with a bumped generation, so ids held after a
/// removal never resolve to the slot's next occupant.
#[derive(Debug, Default)]
pub struct RecordArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl RecordArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record and return its id.
    pub fn insert(&mut self, record: DisputeRecord) -> RecordId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            return RecordId {
                index,
                generation: slot.generation,
            };
        }
        let index = u32::try_from(self.slots.len()).unwrap_or_else(|_| {
            panic!("record arena exhausted: more than {} live slots", u32::MAX)
        });
        self.slots.push(Slot {
            generation: 0,
            record: Some(record),
        });
        RecordId {
            index,
            generation: 0,
        }
    }

    /// Look up a record.
    pub fn get(&self, id: RecordId) -> Option<&DisputeRecord> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    /// Look up a record mutably.
    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut DisputeRecord> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_mut())
    }

    /// Whether `id` still resolves.
    pub fn contains(&self, id: RecordId) -> bool {
        self.get(id).is_some()
    }

    /// Remove a record, invalidating its id.
    pub fn remove(&mut self, id: RecordId) -> Option<DisputeRecord> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(record)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena holds no records.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u128, instance: u64) -> NodeInstance {
        NodeInstance::new(NodeId::new(id), instance)
    }

    fn record(monitor_lease: i64, subject_lease: i64) -> DisputeRecord {
        DisputeRecord::new(node(1, 1), node(2, 1), monitor_lease, subject_lease, MonoTime::ZERO)
    }

    #[test]
    fn tiers_follow_state() {
        assert_eq!(RecordState::Pending.tier(), Some(SuspicionTier::Weak));
        assert_eq!(RecordState::Reported2.tier(), Some(SuspicionTier::Weak));
        assert_eq!(RecordState::Reported.tier(), Some(SuspicionTier::Strong));
        assert_eq!(RecordState::Rejected.tier(), Some(SuspicionTier::Reject));
        for state in [
            RecordState::None,
            RecordState::Confirmed,
            RecordState::Expired,
            RecordState::Implicit,
        ] {
            assert_eq!(state.tier(), None, "{state} must not count");
        }
    }

    #[test]
    fn presence_and_extension() {
        let mut r = record(0, 0);
        assert!(!r.is_present());
        assert!(!r.is_extended());
        r.decision = Decision::Delay;
        assert!(r.is_present());
        assert!(record(4, 0).is_extended());
    }

    #[test]
    fn zero_lease_instance_matches_anything() {
        let r = record(0, 7);
        assert!(r.matches(1, node(2, 1), 3, 7));
        assert!(r.matches(1, node(2, 1), 3, 0));
        assert!(!r.matches(1, node(2, 1), 3, 8));
        assert!(!r.matches(2, node(2, 1), 3, 7), "monitor instance must match");
        assert!(!r.matches(1, node(2, 2), 3, 7), "subject instance must match");
    }

    #[test]
    fn adopt_fills_only_unspecified() {
        let mut r = record(0, 7);
        r.adopt_lease_instances(3, 9);
        assert_eq!(r.monitor_lease_instance, 3);
        assert_eq!(r.subject_lease_instance, 7);
    }

    #[test]
    fn implicit_record_is_implicit() {
        let r = DisputeRecord::implicit(node(1, 1), node(2, 1), (5, 0), Decision::Grant, MonoTime::ZERO);
        assert!(r.is_implicit());
        assert_eq!(r.implicit_arbitration1, 5);
        assert_eq!(r.decision, Decision::Grant);
        assert!(r.peer.is_none());
    }

    #[test]
    fn flags_set_and_clear() {
        let mut flags = ReplyFlags::EXTENDED | ReplyFlags::DELAYED;
        assert!(flags.contains(ReplyFlags::DELAYED));
        flags.remove(ReplyFlags::DELAYED);
        assert!(!flags.contains(ReplyFlags::DELAYED));
        flags.insert(ReplyFlags::STRONG);
        assert_eq!(flags.to_string(), "extended|strong");
        assert_eq!(ReplyFlags::empty().to_string(), "-");
        assert_eq!(ReplyFlags::default(), ReplyFlags::empty());
    }

    #[test]
    fn flags_serialize_as_bits() {
        let flags = ReplyFlags::STRONG | ReplyFlags::DELAYED;
        assert_eq!(serde_json::to_value(flags).unwrap(), serde_json::json!(10));
        let back: ReplyFlags = serde_json::from_str("10").unwrap();
        assert_eq!(back, flags);
    }

    #[test]
    fn arena_ids_go_stale_after_remove() {
        let mut arena = RecordArena::new();
        let a = arena.insert(record(0, 0));
        assert!(arena.contains(a));
        assert!(arena.remove(a).is_some());
        assert!(!arena.contains(a));
        assert!(arena.remove(a).is_none());

        // The slot is reused, but the old id does not see the new occupant.
        let b = arena.insert(record(1, 1));
        assert_ne!(a, b);
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b).map(|r| r.monitor_lease_instance), Some(1));
        assert_eq!(arena.len(), 1);
    }
}
