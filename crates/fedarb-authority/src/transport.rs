//! # Outbound Transport
//!
//! The authority sends only one kind of unsolicited message: a deferred
//! verdict. Sends go through the [`Transport`] trait, supplied by the host.
//!
//! Messages produced while the table lock is held are collected in a
//! [`DelayedResponseBuffer`] owned by the current call and flushed only
//! after the lock is released, so a slow or re-entrant transport never
//! runs under the lock.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use fedarb_core::PartnerRef;

use crate::message::OutboundMessage;

/// Sink for one-way messages from the authority.
pub trait Transport: Send + Sync {
    /// Send `message` to `destination`. Delivery is best effort; the
    /// authority does not retry.
    fn send_one_way(&self, message: OutboundMessage, destination: &PartnerRef);
}

/// Messages queued during one locked section.
#[derive(Debug, Default)]
pub struct DelayedResponseBuffer {
    pending: Vec<(OutboundMessage, PartnerRef)>,
}

impl DelayedResponseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: OutboundMessage, destination: PartnerRef) {
        self.pending.push((message, destination));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queued messages in send order.
    pub fn iter(&self) -> impl Iterator<Item = &(OutboundMessage, PartnerRef)> {
        self.pending.iter()
    }

    /// Hand every queued message to `transport`. Returns how many were sent.
    pub fn flush(self, transport: &dyn Transport) -> usize {
        let sent = self.pending.len();
        for (message, destination) in self.pending {
            tracing::debug!(
                destination = %destination,
                decision = %message.decision(),
                "sending delayed arbitration reply"
            );
            transport.send_one_way(message, &destination);
        }
        sent
    }
}

// ── In-memory transport ────────────────────────────────────────────────

/// Records every send. Used by tests and scenario replay.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<(OutboundMessage, PartnerRef)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything sent so far.
    pub fn sent(&self) -> Vec<(OutboundMessage, PartnerRef)> {
        self.sent.lock().clone()
    }

    /// Drain everything sent so far.
    pub fn take(&self) -> Vec<(OutboundMessage, PartnerRef)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Transport for MemoryTransport {
    fn send_one_way(&self, message: OutboundMessage, destination: &PartnerRef) {
        self.sent.lock().push((message, destination.clone()));
    }
}

// ── Channel transport ──────────────────────────────────────────────────

/// Forwards sends into an unbounded tokio channel, for hosts that deliver
/// on their own task.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<(OutboundMessage, PartnerRef)>,
}

impl ChannelTransport {
    /// Create a transport and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(OutboundMessage, PartnerRef)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send_one_way(&self, message: OutboundMessage, destination: &PartnerRef) {
        if self.tx.send((message, destination.clone())).is_err() {
            tracing::warn!(destination = %destination, "delivery channel closed, dropping delayed reply");
        }
    }
}

/// Drain `rx` on a tokio task, passing each message to `deliver`. The task
/// ends when every sender has been dropped.
pub fn spawn_sender<F>(
    mut rx: mpsc::UnboundedReceiver<(OutboundMessage, PartnerRef)>,
    deliver: F,
) -> JoinHandle<()>
where
    F: Fn(OutboundMessage, PartnerRef) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some((message, destination)) = rx.recv().await {
            deliver(message, destination);
        }
        tracing::debug!("delayed reply sender stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DelayedArbitrateReply;
    use crate::record::{Decision, ReplyFlags};
    use fedarb_core::{NodeId, NodeInstance};
    use std::time::Duration;

    fn message(decision: Decision) -> OutboundMessage {
        let node = NodeInstance::new(NodeId::new(1), 1);
        OutboundMessage::DelayedArbitrateReply(DelayedArbitrateReply {
            monitor: node,
            subject: NodeInstance::new(NodeId::new(2), 1),
            monitor_lease_instance: 1,
            subject_lease_instance: 1,
            decision,
            subject_granted_ttl: Duration::from_secs(1),
            flags: ReplyFlags::DELAYED,
        })
    }

    fn destination() -> PartnerRef {
        PartnerRef::new(NodeInstance::new(NodeId::new(1), 1), "node-1")
    }

    #[test]
    fn buffer_flushes_in_order() {
        let transport = MemoryTransport::new();
        let mut buffer = DelayedResponseBuffer::new();
        buffer.push(message(Decision::Grant), destination());
        buffer.push(message(Decision::Neutral), destination());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.flush(&transport), 2);

        let decisions: Vec<Decision> = transport.take().iter().map(|(m, _)| m.decision()).collect();
        assert_eq!(decisions, vec![Decision::Grant, Decision::Neutral]);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn channel_transport_delivers_on_task() {
        let (transport, rx) = ChannelTransport::new();
        let delivered = std::sync::Arc::new(MemoryTransport::new());
        let sink = std::sync::Arc::clone(&delivered);
        let handle = spawn_sender(rx, move |m, d| sink.send_one_way(m, &d));

        transport.send_one_way(message(Decision::Grant), &destination());
        drop(transport);
        handle.await.unwrap();

        let sent = delivered.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.address, "node-1");
    }
}
