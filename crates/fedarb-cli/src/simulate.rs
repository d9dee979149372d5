//! # Simulate Subcommand
//!
//! Replays a scripted scenario against a fresh authority whose clock only
//! moves when the scenario says so. Deferred replies are captured by an
//! in-memory transport instead of being sent anywhere.
//!
//! ## Scenario format
//!
//! ```yaml
//! start_ms: 0
//! steps:
//!   - request:
//!       type: two_way_extended
//!       monitor: { id: "a1", instance: 1 }
//!       subject: { id: "b2", instance: 1 }
//!       monitor_lease_instance: 1
//!       subject_lease_instance: 1
//!       subject_ttl_ms: 10000
//!       history_needed_ms: 0
//!   - advance_ms: 5000
//!     compact: true
//! ```
//!
//! Within a step the clock advances first, then the request is processed,
//! then compaction runs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};

use fedarb_authority::{
    ArbitrationAuthority, ArbitrationOutcome, ArbitrationRequest, MemoryTransport,
    OutboundMessage, TableStats, Transport,
};
use fedarb_core::{ArbitrationConfig, Clock, ConfigHandle, ManualClock, MonoTime, PartnerRef};

/// Arguments for the simulate subcommand.
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Path to the scenario YAML file.
    #[arg(long)]
    pub scenario: PathBuf,

    /// Print the whole run as one JSON document.
    #[arg(long)]
    pub json: bool,
}

/// Execute the simulate subcommand.
pub fn run_simulate(args: &SimulateArgs, config: ArbitrationConfig) -> Result<u8> {
    let scenario = Scenario::from_yaml_file(&args.scenario)?;
    tracing::info!(
        scenario = %args.scenario.display(),
        steps = scenario.steps.len(),
        "replaying scenario"
    );
    let simulation = simulate(&scenario, config);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&simulation)?);
    } else {
        for event in &simulation.events {
            println!("{event}");
        }
        println!();
        print!("{}", simulation.dump);
    }
    Ok(0)
}

// ── Scenario ───────────────────────────────────────────────────────────

/// A scripted run.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Clock reading, in milliseconds, when the authority is created.
    #[serde(default)]
    pub start_ms: u64,
    pub steps: Vec<Step>,
}

impl Scenario {
    /// Parse a scenario, rejecting steps that do nothing.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let scenario: Self = serde_yaml::from_str(yaml).context("parsing scenario")?;
        for (index, step) in scenario.steps.iter().enumerate() {
            if step.is_empty() {
                bail!("step {index} has no advance_ms, request, or compact");
            }
        }
        Ok(scenario)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("in scenario {}", path.display()))
    }
}

/// One step of a scenario.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Step {
    pub advance_ms: Option<u64>,
    pub request: Option<ArbitrationRequest>,
    /// Address the request arrives from; defaults to the monitor's node id.
    pub sender_address: Option<String>,
    /// Whether the routing layer reports the sender as shutting down.
    pub sender_shutdown: bool,
    pub compact: bool,
}

impl Step {
    fn is_empty(&self) -> bool {
        self.advance_ms.is_none() && self.request.is_none() && !self.compact
    }
}

// ── Run ────────────────────────────────────────────────────────────────

/// Something observable that happened during a run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A request was processed.
    Processed {
        step: usize,
        at_ms: u64,
        request: ArbitrationRequest,
        outcome: Option<ArbitrationOutcome>,
    },
    /// The authority sent a one-way message.
    Sent {
        step: usize,
        at_ms: u64,
        destination: String,
        message: OutboundMessage,
    },
    /// Compaction ran.
    Compacted {
        step: usize,
        at_ms: u64,
        finalized: usize,
        swept: bool,
        records_removed: usize,
        next_due_ms: Option<u64>,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Processed {
                step,
                at_ms,
                request,
                outcome,
            } => {
                write!(
                    f,
                    "[{step} @ {at_ms}ms] {} {} -> {}: ",
                    request.kind, request.monitor, request.subject
                )?;
                match outcome {
                    None => f.write_str("no reply"),
                    Some(ArbitrationOutcome::Reply(reply)) => write!(
                        f,
                        "{} flags={} subject_already_present={}",
                        reply.decision, reply.flags, reply.subject_already_present
                    ),
                    Some(ArbitrationOutcome::Query(query)) => write!(
                        f,
                        "elapsed_since_success={}ms",
                        query.elapsed_since_success.as_millis()
                    ),
                }
            }
            Self::Sent {
                step,
                at_ms,
                destination,
                message: OutboundMessage::DelayedArbitrateReply(reply),
            } => write!(
                f,
                "[{step} @ {at_ms}ms] delayed reply to {destination} ({} -> {}): {} flags={}",
                reply.monitor, reply.subject, reply.decision, reply.flags
            ),
            Self::Compacted {
                step,
                at_ms,
                finalized,
                swept,
                records_removed,
                next_due_ms,
            } => {
                write!(
                    f,
                    "[{step} @ {at_ms}ms] compact finalized={finalized} swept={swept} removed={records_removed}"
                )?;
                if let Some(due) = next_due_ms {
                    write!(f, " next_due={due}ms")?;
                }
                Ok(())
            }
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct Simulation {
    pub events: Vec<Event>,
    pub stats: TableStats,
    pub dump: String,
}

/// Replay `scenario` against a new authority configured with `config`.
pub fn simulate(scenario: &Scenario, config: ArbitrationConfig) -> Simulation {
    let clock = Arc::new(ManualClock::starting_at(MonoTime::from_millis(scenario.start_ms)));
    let transport = Arc::new(MemoryTransport::new());
    let authority = ArbitrationAuthority::new(
        ConfigHandle::new(config),
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::clone(&transport) as Arc<dyn Transport>,
    );

    let mut events = Vec::new();
    let drain = |events: &mut Vec<Event>, step: usize, at_ms: u64| {
        for (message, destination) in transport.take() {
            events.push(Event::Sent {
                step,
                at_ms,
                destination: destination.address,
                message,
            });
        }
    };

    for (step, action) in scenario.steps.iter().enumerate() {
        if let Some(ms) = action.advance_ms {
            clock.advance(Duration::from_millis(ms));
        }
        let at_ms = millis(clock.now().offset());

        if let Some(request) = &action.request {
            let address = action
                .sender_address
                .clone()
                .unwrap_or_else(|| request.monitor.id.to_string());
            let mut sender = PartnerRef::new(request.monitor, address);
            if action.sender_shutdown {
                sender = sender.shutting_down();
            }
            let outcome = authority.process_request(request, &sender);
            events.push(Event::Processed {
                step,
                at_ms,
                request: request.clone(),
                outcome,
            });
            drain(&mut events, step, at_ms);
        }

        if action.compact {
            let report = authority.compact_with_report();
            events.push(Event::Compacted {
                step,
                at_ms,
                finalized: report.finalized,
                swept: report.swept,
                records_removed: report.records_removed,
                next_due_ms: report.next_due.map(millis),
            });
            drain(&mut events, step, at_ms);
        }
    }

    Simulation {
        events,
        stats: authority.stats(),
        dump: authority.dump(),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
