//! # Decision Engine
//!
//! Turns one request into at most one synchronous reply, applying its
//! effects to the table. Runs entirely under the authority's lock; any
//! deferred verdicts it produces are queued in the caller's
//! [`DelayedResponseBuffer`].
//!
//! ## Two-way arbitration
//!
//! 1. Stale monitor incarnations are ignored. A sender the routing layer
//!    knows is shutting down is rejected outright.
//! 2. Liveness of both sides is read before this request is recorded.
//! 3. The case's record pair is found or created, and a new claim moves
//!    both sides into their accusation states.
//! 4. If the table's history does not reach back as far as the monitor
//!    needs, an undecided claim is rejected.
//! 5. Otherwise the verdict follows the subject's own claim if it made one,
//!    compares suspicion levels on a continuous case, and on a fresh case
//!    grants at once or defers.
//!
//! ## Implicit arbitration
//!
//! Implicit partners exchange two monotone counters. A counter that moved
//! two or more steps past the other side's last report means the reporter
//! kept running while the other side believed it gone, and loses.

use std::time::Duration;

use fedarb_core::{ArbitrationConfig, MonoTime, NodeInstance, PartnerRef};

use crate::message::{
    ArbitrationOutcome, ArbitrationReply, ArbitrationRequest, ArbitrationType, QueryReply,
    INFINITE,
};
use crate::observability::record_ignored;
use crate::record::{Decision, DisputeRecord, ReplyFlags};
use crate::retention::RetentionPolicy;
use crate::table::{ArbitrationTable, RecordPair};
use crate::transport::DelayedResponseBuffer;

/// Liveness of both participants, read before the request is recorded.
#[derive(Debug, Clone, Copy)]
struct Liveness {
    monitor: bool,
    subject: bool,
}

impl ArbitrationTable {
    /// Apply one request. Returns the synchronous reply, or `None` when the
    /// request gets none.
    pub(crate) fn process(
        &mut self,
        request: &ArbitrationRequest,
        sender: &PartnerRef,
        now: MonoTime,
        config: &ArbitrationConfig,
        out: &mut DelayedResponseBuffer,
    ) -> Option<ArbitrationOutcome> {
        match request.kind {
            ArbitrationType::Query => Some(ArbitrationOutcome::Query(self.query(request, now))),
            ArbitrationType::KeepAlive => {
                if self.is_stale(request.monitor) {
                    record_ignored("stale_instance");
                } else {
                    self.touch(request.monitor, sender, now, config);
                }
                None
            }
            ArbitrationType::Implicit => Some(ArbitrationOutcome::Reply(
                self.arbitrate_implicit(request, sender, now, config),
            )),
            ArbitrationType::RevertToReject | ArbitrationType::RevertToNeutral => {
                self.revert(request, now, config, out);
                None
            }
            ArbitrationType::OneWay
            | ArbitrationType::TwoWaySimple
            | ArbitrationType::TwoWayExtended => self
                .arbitrate(request, sender, now, config, out)
                .map(ArbitrationOutcome::Reply),
        }
    }

    // ── Two-way arbitration ────────────────────────────────────────────

    fn arbitrate(
        &mut self,
        request: &ArbitrationRequest,
        sender: &PartnerRef,
        now: MonoTime,
        config: &ArbitrationConfig,
        out: &mut DelayedResponseBuffer,
    ) -> Option<ArbitrationReply> {
        if self.is_stale(request.monitor) {
            tracing::debug!(
                monitor = %request.monitor,
                subject = %request.subject,
                "ignoring request from a superseded instance"
            );
            record_ignored("stale_instance");
            return None;
        }
        if sender.shutdown {
            tracing::info!(
                monitor = %request.monitor,
                subject = %request.subject,
                "rejecting request from a node that is shutting down"
            );
            return Some(ArbitrationReply {
                decision: Decision::Reject,
                subject_granted_ttl: INFINITE,
                revert_allowed_until: Duration::ZERO,
                subject_already_present: false,
                flags: ReplyFlags::STRONG,
            });
        }

        let history_needed = request
            .history_needed
            .unwrap_or_else(|| config.default_history_needed());
        let time_bound = now.checked_sub(history_needed);
        let live = Liveness {
            monitor: self.is_recently_live(request.monitor.id, now, config),
            subject: self.is_recently_live(request.subject.id, now, config),
        };

        self.touch(request.monitor, sender, now, config);
        self.update_instance(request.subject.id, request.subject.instance, config);

        let pair = self.find_or_create_pair(
            request.monitor,
            request.subject,
            request.monitor_lease_instance,
            request.subject_lease_instance,
            time_bound.unwrap_or(MonoTime::ZERO),
            now,
        );
        if let Some(record) = self.record_mut(pair.monitor) {
            if pair.continuous {
                record.flags.insert(ReplyFlags::CONTINUOUS);
            }
            if record.is_extended() {
                record.flags.insert(ReplyFlags::EXTENDED);
            }
        }
        let monitor_present = self.record(pair.monitor).is_some_and(|r| r.is_present());
        if !monitor_present {
            self.update_on_new_request(pair.monitor, request.subject_ttl, now, config);
        }
        let subject_already_present = self.record(pair.subject).is_some_and(|r| r.is_present());

        let history_complete = time_bound.is_some_and(|bound| self.history_start() <= bound);
        if !history_complete {
            if !monitor_present {
                tracing::debug!(
                    monitor = %request.monitor,
                    history_needed_ms = history_needed.as_millis() as u64,
                    history_start = %self.history_start(),
                    "not enough history, rejecting"
                );
                self.set_decision(pair.monitor, Decision::Reject, config);
            }
        } else {
            self.make_decision(request, pair, live, now, config, out);
        }

        let record = self.record(pair.monitor)?;
        Some(ArbitrationReply {
            decision: record.decision,
            subject_granted_ttl: if record.decision == Decision::Grant {
                record.subject_ttl
            } else {
                INFINITE
            },
            revert_allowed_until: if record.decision == Decision::Reject {
                Duration::ZERO
            } else {
                INFINITE
            },
            subject_already_present,
            flags: record.flags,
        })
    }

    fn make_decision(
        &mut self,
        request: &ArbitrationRequest,
        pair: RecordPair,
        live: Liveness,
        now: MonoTime,
        config: &ArbitrationConfig,
        out: &mut DelayedResponseBuffer,
    ) {
        let Some(subject) = self.record(pair.subject).cloned() else {
            return;
        };
        let Some(monitor) = self.record(pair.monitor) else {
            return;
        };
        let monitor_present = monitor.is_present();

        if subject.is_present() {
            self.follow_subject(request.kind, pair, &subject, config, out);
            return;
        }
        if request.kind == ArbitrationType::OneWay {
            self.set_decision(pair.monitor, Decision::Neutral, config);
            return;
        }
        if monitor_present {
            return;
        }

        let monitor_id = request.monitor.id;
        let subject_id = request.subject.id;
        if pair.continuous || request.kind == ArbitrationType::TwoWaySimple {
            let monitor_level = self.suspicion_level(monitor_id, now, config);
            let subject_level = self.suspicion_level(subject_id, now, config);
            let subject_clearly_worse =
                subject_level > monitor_level.saturating_add(config.suspicion_level_comparison_threshold);
            // A quiet monitor never wins against a subject that is still talking.
            if !subject_clearly_worse || (!live.monitor && live.subject) {
                self.set_decision(pair.monitor, Decision::Reject, config);
            } else {
                self.set_decision(pair.monitor, Decision::Grant, config);
                let mature = now.duration_since(self.history_start()) >= config.record_suspicion_expire_interval;
                if mature {
                    if let Some(record) = self.record_mut(pair.monitor) {
                        record.flags.insert(ReplyFlags::STRONG);
                    }
                }
            }
            return;
        }

        let subject_suspicious = self.is_suspicious(subject_id, live.subject, now, config);
        let monitor_suspicious = self.is_suspicious(monitor_id, live.monitor, now, config);
        if (live.subject && !subject_suspicious) || monitor_suspicious {
            self.set_decision(pair.monitor, Decision::Delay, config);
            if let Some(record) = self.record_mut(pair.monitor) {
                record.flags.insert(ReplyFlags::DELAYED);
            }
            self.push_delayed(pair.monitor);
        } else {
            self.set_decision(pair.monitor, Decision::Grant, config);
        }
    }

    /// The subject already claimed this case: the monitor gets the mirror
    /// of that verdict.
    fn follow_subject(
        &mut self,
        kind: ArbitrationType,
        pair: RecordPair,
        subject: &DisputeRecord,
        config: &ArbitrationConfig,
        out: &mut DelayedResponseBuffer,
    ) {
        match subject.decision {
            Decision::Grant => self.set_decision(pair.monitor, Decision::Reject, config),
            Decision::Reject if kind != ArbitrationType::OneWay => {
                self.set_decision(pair.monitor, Decision::Grant, config)
            }
            Decision::Delay => {
                // Both sides claim the case at once: nobody wins, and the
                // subject learns that without waiting out its delay.
                self.set_decision(pair.monitor, Decision::Neutral, config);
                self.set_decision(pair.subject, Decision::Neutral, config);
                if let Some(record) = self.record_mut(pair.subject) {
                    record.flags.remove(ReplyFlags::DELAYED);
                }
                self.remove_delayed(pair.subject);
                self.queue_delayed_reply(pair.subject, Decision::Neutral, out);
            }
            _ => self.set_decision(pair.monitor, Decision::Neutral, config),
        }
        if subject.flags.contains(ReplyFlags::STRONG) {
            if let Some(record) = self.record_mut(pair.monitor) {
                record.flags.insert(ReplyFlags::STRONG);
            }
        }
    }

    // ── Reverts ────────────────────────────────────────────────────────

    fn revert(
        &mut self,
        request: &ArbitrationRequest,
        now: MonoTime,
        config: &ArbitrationConfig,
        out: &mut DelayedResponseBuffer,
    ) {
        let history_needed = request
            .history_needed
            .unwrap_or_else(|| config.default_history_needed());
        let time_bound = now - history_needed;
        let Some(id) = self.find_record(
            request.monitor,
            request.subject,
            request.monitor_lease_instance,
            request.subject_lease_instance,
            time_bound,
        ) else {
            tracing::debug!(monitor = %request.monitor, subject = %request.subject, "revert for unknown case");
            record_ignored("unknown_case");
            return;
        };
        let Some(record) = self.record(id) else {
            return;
        };
        if record.decision != Decision::Grant {
            tracing::debug!(
                monitor = %request.monitor,
                decision = %record.decision,
                "revert of a claim that was not granted"
            );
            record_ignored("not_granted");
            return;
        }
        let peer = record
            .peer
            .filter(|p| self.record(*p).is_some_and(|r| r.is_present()));

        let (mine, theirs) = match request.kind {
            ArbitrationType::RevertToReject => (Decision::Reject, Decision::Grant),
            _ => (Decision::Neutral, Decision::Neutral),
        };
        self.set_decision(id, mine, config);
        let Some(peer) = peer else {
            return;
        };
        self.set_decision(peer, theirs, config);
        if theirs == Decision::Neutral {
            if let Some(record) = self.record_mut(peer) {
                record.flags.remove(ReplyFlags::DELAYED);
            }
        }
        if self.record(peer).is_some_and(|r| r.is_extended()) {
            self.queue_delayed_reply(peer, theirs, out);
        }
    }

    // ── Query ──────────────────────────────────────────────────────────

    fn query(&self, request: &ArbitrationRequest, now: MonoTime) -> QueryReply {
        let last_success = self.ledger(request.subject.id).and_then(|ledger| {
            ledger
                .records()
                .filter_map(|id| self.record(id))
                .find(|r| !r.is_implicit() && r.is_present() && r.decision != Decision::Reject)
                .map(|r| r.process_time)
        });
        QueryReply {
            elapsed_since_success: now.duration_since(last_success.unwrap_or(self.start_time())),
        }
    }

    // ── Implicit arbitration ───────────────────────────────────────────

    fn arbitrate_implicit(
        &mut self,
        request: &ArbitrationRequest,
        sender: &PartnerRef,
        now: MonoTime,
        config: &ArbitrationConfig,
    ) -> ArbitrationReply {
        self.touch(request.monitor, sender, now, config);
        self.update_instance(request.subject.id, request.subject.instance, config);

        let window = RetentionPolicy::from_config(config).implicit_window();
        let stored = self
            .latest_implicit(request.monitor.id, request.subject.id, now - window)
            .and_then(|id| self.record(id).cloned());
        let incoming = (request.implicit_arbitration1, request.implicit_arbitration2);

        let decision = match stored.as_ref().and_then(|s| mirror_of(s, request.monitor)) {
            Some(mirrored) => mirrored,
            None => stored
                .as_ref()
                .and_then(|s| ratchet(incoming, (s.implicit_arbitration1, s.implicit_arbitration2)))
                .unwrap_or_else(|| self.implicit_fallback(request, now, config)),
        };
        tracing::debug!(
            monitor = %request.monitor,
            subject = %request.subject,
            counters = ?incoming,
            decision = %decision,
            "implicit arbitration"
        );

        self.insert_record(DisputeRecord::implicit(
            request.monitor,
            request.subject,
            incoming,
            decision,
            now,
        ));
        ArbitrationReply {
            decision,
            subject_granted_ttl: if decision == Decision::Grant {
                request.subject_ttl
            } else {
                INFINITE
            },
            revert_allowed_until: if decision == Decision::Reject {
                Duration::ZERO
            } else {
                INFINITE
            },
            subject_already_present: stored.is_some(),
            flags: ReplyFlags::empty(),
        }
    }

    /// No counter evidence either way: reject only a monitor that is
    /// clearly more suspicious than its subject.
    fn implicit_fallback(&mut self, request: &ArbitrationRequest, now: MonoTime, config: &ArbitrationConfig) -> Decision {
        let monitor = self.suspicion_level(request.monitor.id, now, config);
        let subject = self.suspicion_level(request.subject.id, now, config);
        if monitor > subject.saturating_add(config.suspicion_level_comparison_threshold) {
            Decision::Reject
        } else {
            Decision::Grant
        }
    }
}

/// The other side already got a verdict on this exact pairing: the
/// requester gets the opposite.
fn mirror_of(stored: &DisputeRecord, requester: NodeInstance) -> Option<Decision> {
    if stored.subject != requester {
        return None;
    }
    match stored.decision {
        Decision::Grant => Some(Decision::Reject),
        Decision::Reject => Some(Decision::Grant),
        _ => None,
    }
}

/// Compare incoming implicit counters against the last stored pair.
/// `None` when the counters say nothing.
pub(crate) fn ratchet(incoming: (i64, i64), stored: (i64, i64)) -> Option<Decision> {
    let (i1, i2) = incoming;
    let (s1, s2) = stored;

    // A counter reset to zero while its partner kept moving.
    if (i1 == 0 && s1 > 0 && i2 > s2) || (i2 == 0 && s2 > 0 && i1 > s1) {
        return Some(Decision::Reject);
    }
    if i1 >= s1.saturating_add(2) || i2 >= s2.saturating_add(2) {
        return Some(Decision::Reject);
    }
    if s1 >= i1.saturating_add(2) || s2 >= i2.saturating_add(2) {
        return Some(Decision::Grant);
    }
    if i2 > 0 && s2 == 0 {
        return Some(Decision::Reject);
    }
    if i2 == 0 && s2 > 0 {
        return Some(Decision::Grant);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedarb_core::NodeId;

    #[test]
    fn ratchet_lead_of_two_rejects() {
        assert_eq!(ratchet((7, 0), (5, 0)), Some(Decision::Reject));
        assert_eq!(ratchet((5, 3), (5, 0)), Some(Decision::Reject));
    }

    #[test]
    fn ratchet_lag_of_two_grants() {
        assert_eq!(ratchet((3, 0), (5, 0)), Some(Decision::Grant));
        assert_eq!(ratchet((5, 1), (5, 4)), Some(Decision::Grant));
    }

    #[test]
    fn ratchet_regression_rejects() {
        // First counter reset while the second advanced.
        assert_eq!(ratchet((0, 4), (6, 3)), Some(Decision::Reject));
    }

    #[test]
    fn ratchet_second_counter_appearing() {
        assert_eq!(ratchet((5, 1), (5, 0)), Some(Decision::Reject));
        assert_eq!(ratchet((5, 0), (5, 1)), Some(Decision::Grant));
    }

    #[test]
    fn ratchet_within_one_is_silent() {
        assert_eq!(ratchet((5, 0), (5, 0)), None);
        assert_eq!(ratchet((6, 2), (5, 2)), None);
        assert_eq!(ratchet((5, 2), (6, 3)), None);
    }

    #[test]
    fn mirror_only_for_same_incarnation() {
        let a = NodeInstance::new(NodeId::new(1), 1);
        let b = NodeInstance::new(NodeId::new(2), 1);
        let stored = DisputeRecord::implicit(b, a, (1, 0), Decision::Grant, MonoTime::ZERO);
        assert_eq!(mirror_of(&stored, a), Some(Decision::Reject));
        assert_eq!(mirror_of(&stored, NodeInstance::new(a.id, 2)), None);

        let neutral = DisputeRecord::implicit(b, a, (1, 0), Decision::Neutral, MonoTime::ZERO);
        assert_eq!(mirror_of(&neutral, a), None);
    }
}
