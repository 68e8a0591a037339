//! Transport Module
//!
//! Location-addressed, fire-and-forget delivery of wire messages to named
//! component endpoints on peer nodes. Delivery is FIFO per (sender,
//! receiver) pair and never guaranteed; the discovery protocol tolerates
//! loss by design.

pub mod tcp;

pub use tcp::TcpTransport;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::discovery::protocol::WireMessage;
use crate::error::Result;
use crate::membership::Address;

/// Component mailboxes addressable on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    Pinger,
    Follower,
    Master,
    Monitor,
}

/// A routed message as it crosses the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: Address,
    pub endpoint: Endpoint,
    pub msg: WireMessage,
}

/// Outbound message delivery.
///
/// Sends must not block on the remote side; an undeliverable message is
/// dropped silently (logged at trace).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, to: &Address, endpoint: Endpoint, msg: WireMessage) -> Result<()>;
}

/// Routes inbound envelopes to the component mailboxes of one node.
///
/// Components register their endpoint before the node starts accepting
/// traffic; envelopes for unregistered endpoints are dropped.
#[derive(Clone, Default)]
pub struct NodeBus {
    endpoints: Arc<Mutex<HashMap<Endpoint, mpsc::UnboundedSender<Envelope>>>>,
}

impl NodeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component mailbox, replacing any previous registration
    pub fn register(&self, endpoint: Endpoint) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints
            .lock()
            .expect("endpoint registry poisoned")
            .insert(endpoint, tx);
        rx
    }

    /// Deliver an inbound envelope to its endpoint mailbox
    pub fn deliver(&self, envelope: Envelope) {
        let sender = {
            let endpoints = self.endpoints.lock().expect("endpoint registry poisoned");
            endpoints.get(&envelope.endpoint).cloned()
        };
        match sender {
            Some(tx) => {
                if tx.send(envelope).is_err() {
                    // component has stopped; inbound traffic is stale
                }
            }
            None => {
                tracing::trace!(endpoint = ?envelope.endpoint, from = %envelope.from,
                    "dropping envelope for unregistered endpoint");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_routes_to_registered_endpoint() {
        let bus = NodeBus::new();
        let mut rx = bus.register(Endpoint::Pinger);

        bus.deliver(Envelope {
            from: Address::new("peer", 9400),
            endpoint: Endpoint::Pinger,
            msg: WireMessage::ProbeReply { probe_id: 3 },
        });

        let env = rx.recv().await.unwrap();
        assert_eq!(env.from, Address::new("peer", 9400));
        assert!(matches!(env.msg, WireMessage::ProbeReply { probe_id: 3 }));
    }

    #[tokio::test]
    async fn test_bus_drops_unregistered_endpoint() {
        let bus = NodeBus::new();
        let mut rx = bus.register(Endpoint::Pinger);

        // no Master registration: silently dropped
        bus.deliver(Envelope {
            from: Address::new("peer", 9400),
            endpoint: Endpoint::Master,
            msg: WireMessage::ProbeReply { probe_id: 1 },
        });

        assert!(rx.try_recv().is_err());
    }
}
