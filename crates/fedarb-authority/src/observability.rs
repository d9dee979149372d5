//! # Metrics
//!
//! Thin helpers over the `metrics` facade. Nothing is exported unless the
//! host installs a recorder; without one every call is a no-op.
//!
//! | Name | Kind | Labels |
//! |------|------|--------|
//! | `fedarb_decisions_total` | counter | `decision` |
//! | `fedarb_delayed_replies_total` | counter | |
//! | `fedarb_requests_ignored_total` | counter | `reason` |
//! | `fedarb_records_compacted_total` | counter | |
//! | `fedarb_ledgers` | gauge | |

use crate::record::Decision;

pub(crate) fn record_decision(decision: Decision) {
    metrics::counter!("fedarb_decisions_total", "decision" => decision.as_str()).increment(1);
}

pub(crate) fn record_delayed_replies(count: usize) {
    if count > 0 {
        metrics::counter!("fedarb_delayed_replies_total").increment(count as u64);
    }
}

pub(crate) fn record_ignored(reason: &'static str) {
    metrics::counter!("fedarb_requests_ignored_total", "reason" => reason).increment(1);
}

pub(crate) fn record_compaction(records_removed: usize, ledgers: usize) {
    if records_removed > 0 {
        metrics::counter!("fedarb_records_compacted_total").increment(records_removed as u64);
    }
    metrics::gauge!("fedarb_ledgers").set(ledgers as f64);
}
