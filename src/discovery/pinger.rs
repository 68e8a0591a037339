//! Pinger
//!
//! Runs on every node and answers distributed reachability probes on
//! behalf of remote partition monitors. For each `PingRequest` it runs its
//! own round-trip probe to the target and reports back exactly one of
//! `PingOk` or `PingTimeout` - the timeout is an affirmative statement,
//! never something the requester infers from silence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::discovery::protocol::WireMessage;
use crate::membership::Address;
use crate::transport::{Endpoint, Envelope, NodeBus, Transport};

struct OutstandingPing {
    req_id: u64,
    origin: Address,
}

pub struct Pinger {
    self_address: Address,
    transport: Arc<dyn Transport>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    timer_tx: mpsc::UnboundedSender<u64>,
    timer_rx: mpsc::UnboundedReceiver<u64>,
    shutdown: watch::Receiver<bool>,
    outstanding: HashMap<u64, OutstandingPing>,
    next_probe_id: u64,
}

impl Pinger {
    pub fn spawn(
        self_address: Address,
        transport: Arc<dyn Transport>,
        bus: &NodeBus,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let inbox = bus.register(Endpoint::Pinger);
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let pinger = Self {
            self_address,
            transport,
            inbox,
            timer_tx,
            timer_rx,
            shutdown,
            outstanding: HashMap::new(),
            next_probe_id: 0,
        };
        tokio::spawn(pinger.run())
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                env = self.inbox.recv() => {
                    match env {
                        Some(env) => self.handle(env).await,
                        None => break,
                    }
                }
                probe_id = self.timer_rx.recv() => {
                    if let Some(probe_id) = probe_id {
                        self.on_probe_timeout(probe_id).await;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, env: Envelope) {
        match env.msg {
            WireMessage::PingRequest { req_id, origin, target, timeout_ms } => {
                self.on_ping_request(req_id, origin, target, timeout_ms).await;
            }
            WireMessage::Probe { probe_id, origin, reply_to } => {
                let _ = self
                    .transport
                    .send(&origin, reply_to, WireMessage::ProbeReply { probe_id })
                    .await;
            }
            WireMessage::ProbeReply { probe_id } => {
                if let Some(ping) = self.outstanding.remove(&probe_id) {
                    let _ = self
                        .transport
                        .send(
                            &ping.origin,
                            Endpoint::Monitor,
                            WireMessage::PingOk {
                                req_id: ping.req_id,
                                voter: self.self_address.clone(),
                            },
                        )
                        .await;
                }
            }
            other => {
                tracing::trace!(msg = other.type_name(), "pinger ignoring message");
            }
        }
    }

    async fn on_ping_request(
        &mut self,
        req_id: u64,
        origin: Address,
        target: Address,
        timeout_ms: u64,
    ) {
        self.next_probe_id += 1;
        let probe_id = self.next_probe_id;
        self.outstanding
            .insert(probe_id, OutstandingPing { req_id, origin });

        tracing::debug!(%target, req_id, "probing on behalf of a partition monitor");
        let _ = self
            .transport
            .send(
                &target,
                Endpoint::Pinger,
                WireMessage::Probe {
                    probe_id,
                    origin: self.self_address.clone(),
                    reply_to: Endpoint::Pinger,
                },
            )
            .await;

        let timer_tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            let _ = timer_tx.send(probe_id);
        });
    }

    async fn on_probe_timeout(&mut self, probe_id: u64) {
        // the reply, if any, already consumed the entry
        if let Some(ping) = self.outstanding.remove(&probe_id) {
            tracing::debug!(req_id = ping.req_id, "probe timed out, reporting affirmatively");
            let _ = self
                .transport
                .send(
                    &ping.origin,
                    Endpoint::Monitor,
                    WireMessage::PingTimeout {
                        req_id: ping.req_id,
                        voter: self.self_address.clone(),
                    },
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::sim::SimNet;
    use crate::membership::Roles;
    use tokio::time::timeout as tokio_timeout;

    fn addr(n: u16) -> Address {
        Address::new(format!("node-{n}"), 9400)
    }

    async fn spawn_pinger(
        net: &SimNet,
        address: Address,
    ) -> (watch::Sender<bool>, JoinHandle<()>) {
        let handle = net.join(address.clone(), Roles::default()).await;
        let bus = NodeBus::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = Pinger::spawn(address.clone(), handle.clone(), &bus, shutdown_rx);
        net.attach_bus(&address, bus).await;
        (shutdown_tx, task)
    }

    #[tokio::test]
    async fn test_ping_ok_when_target_reachable() {
        let net = SimNet::new();
        let (_s1, _t1) = spawn_pinger(&net, addr(1)).await;
        let (_s2, _t2) = spawn_pinger(&net, addr(2)).await;

        // the requester only needs a monitor mailbox
        let requester = net.join(addr(9), Roles::default()).await;
        let bus = NodeBus::new();
        let mut monitor_rx = bus.register(Endpoint::Monitor);
        net.attach_bus(&addr(9), bus).await;

        requester
            .send(
                &addr(1),
                Endpoint::Pinger,
                WireMessage::PingRequest {
                    req_id: 5,
                    origin: addr(9),
                    target: addr(2),
                    timeout_ms: 500,
                },
            )
            .await
            .unwrap();

        let env = tokio_timeout(Duration::from_secs(2), monitor_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(
            matches!(env.msg, WireMessage::PingOk { req_id: 5, ref voter } if *voter == addr(1))
        );
    }

    #[tokio::test]
    async fn test_affirmative_timeout_when_target_unreachable() {
        let net = SimNet::new();
        let (_s1, _t1) = spawn_pinger(&net, addr(1)).await;
        let (_s2, _t2) = spawn_pinger(&net, addr(2)).await;

        let requester = net.join(addr(9), Roles::default()).await;
        let bus = NodeBus::new();
        let mut monitor_rx = bus.register(Endpoint::Monitor);
        net.attach_bus(&addr(9), bus).await;

        // voter can hear the requester but not the target
        net.cut_link(&addr(1), &addr(2)).await;

        requester
            .send(
                &addr(1),
                Endpoint::Pinger,
                WireMessage::PingRequest {
                    req_id: 6,
                    origin: addr(9),
                    target: addr(2),
                    timeout_ms: 100,
                },
            )
            .await
            .unwrap();

        let env = tokio_timeout(Duration::from_secs(2), monitor_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(
            matches!(env.msg, WireMessage::PingTimeout { req_id: 6, ref voter } if *voter == addr(1))
        );
    }
}
