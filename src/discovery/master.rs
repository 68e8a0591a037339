//! Master
//!
//! The publication pipeline that runs only on the current leader. Each
//! publish is applied locally through the state queue and broadcast to
//! every other member of the proposed state; an ephemeral response
//! handler collects follower acknowledgements and reports exactly one
//! outcome per recipient to the host, filling in timeout failures at the
//! deadline. Leadership overlap during failover is not prevented here -
//! the version check in the state store arbitrates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::discovery::follower::FollowerHandle;
use crate::discovery::protocol::WireMessage;
use crate::error::{Error, PublishError, Result};
use crate::membership::{Address, MembershipSubstrate, NodeId};
use crate::state::{ClusterState, StateCodec, SubmitUpdate, UpdateFn};
use crate::transport::{Endpoint, Envelope, NodeBus, Transport};

/// Source label for the master's local application
const SOURCE_LOCAL_PUBLISH: &str = "master{local-publish}";

/// Hard cap on the publish deadline
pub(crate) const MAX_PUBLISH_TIMEOUT: Duration = Duration::from_secs(60);

/// One outcome per non-master recipient of a publish
pub type AckListener = Box<dyn FnMut(NodeId, Option<PublishError>) + Send>;

pub enum MasterMsg {
    Publish {
        state: ClusterState,
        ack: AckListener,
    },
    HandlerDeadline {
        version: u64,
    },
}

/// Handle to the master singleton, held by the discovery facade
#[derive(Clone)]
pub struct MasterHandle {
    tx: mpsc::UnboundedSender<MasterMsg>,
}

impl MasterHandle {
    pub fn publish(&self, state: ClusterState, ack: AckListener) -> Result<()> {
        self.tx
            .send(MasterMsg::Publish { state, ack })
            .map_err(|_| Error::NoLocalMaster)
    }
}

/// Pending -> Done acknowledgement collector for one publish
struct ResponseHandler {
    pending: HashMap<NodeId, Address>,
    ack: AckListener,
}

pub struct Master {
    substrate: Arc<dyn MembershipSubstrate>,
    transport: Arc<dyn Transport>,
    submit: SubmitUpdate,
    codec: Arc<dyn StateCodec>,
    follower: FollowerHandle,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    requests: mpsc::UnboundedReceiver<MasterMsg>,
    self_tx: mpsc::UnboundedSender<MasterMsg>,
    shutdown: watch::Receiver<bool>,
    publish_timeout: Duration,
    handlers: HashMap<u64, ResponseHandler>,
}

impl Master {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        substrate: Arc<dyn MembershipSubstrate>,
        transport: Arc<dyn Transport>,
        submit: SubmitUpdate,
        codec: Arc<dyn StateCodec>,
        follower: FollowerHandle,
        bus: &NodeBus,
        publish_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (MasterHandle, JoinHandle<()>) {
        let inbox = bus.register(Endpoint::Master);
        let (self_tx, requests) = mpsc::unbounded_channel();
        let handle = MasterHandle {
            tx: self_tx.clone(),
        };

        let master = Self {
            substrate,
            transport,
            submit,
            codec,
            follower,
            inbox,
            requests,
            self_tx,
            shutdown,
            publish_timeout: publish_timeout.min(MAX_PUBLISH_TIMEOUT),
            handlers: HashMap::new(),
        };
        let task = tokio::spawn(master.run());
        (handle, task)
    }

    async fn run(mut self) {
        tracing::info!(node = %self.substrate.self_address(), "assuming master role");
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
                msg = self.requests.recv() => {
                    match msg {
                        Some(MasterMsg::Publish { state, ack }) => {
                            self.on_publish(state, ack).await;
                        }
                        Some(MasterMsg::HandlerDeadline { version }) => {
                            self.on_deadline(version);
                        }
                        None => break,
                    }
                }
            }
        }
        tracing::info!("master role stopped");
    }

    async fn handle(&mut self, env: Envelope) {
        match env.msg {
            WireMessage::PublishAck { version, node, error } => {
                self.on_ack(version, node, error);
            }
            WireMessage::PleasePublish { requester } => {
                self.on_please_publish(requester).await;
            }
            other => {
                tracing::trace!(msg = other.type_name(), "master ignoring message");
            }
        }
    }

    async fn on_publish(&mut self, state: ClusterState, mut ack: AckListener) {
        let version = state.version;
        let self_id = self.substrate.self_node_id();

        // every member of the proposed state except the master itself
        let recipients: HashMap<NodeId, Address> = state
            .nodes
            .nodes
            .values()
            .filter(|n| Some(&n.node_id) != state.master_node_id.as_ref() && n.node_id != self_id)
            .map(|n| (n.node_id.clone(), n.address.clone()))
            .collect();

        let bytes = match self.codec.encode(&state) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(version, "failed to encode state for publish: {e}");
                let reason = PublishError::Application(format!("encode failed: {e}"));
                for node in recipients.into_keys() {
                    ack(node, Some(reason.clone()));
                }
                return;
            }
        };

        tracing::debug!(version, recipients = recipients.len(), "publishing cluster state");

        for address in recipients.values() {
            let _ = self
                .transport
                .send(
                    address,
                    Endpoint::Follower,
                    WireMessage::FollowerPublish {
                        version,
                        bytes: bytes.clone(),
                    },
                )
                .await;
        }

        if !recipients.is_empty() {
            if let Some(mut superseded) = self.handlers.insert(
                version,
                ResponseHandler {
                    pending: recipients,
                    ack,
                },
            ) {
                // a republish of the same version supersedes the old
                // handler; its listener still gets one outcome per node
                for (node, _) in superseded.pending.drain() {
                    (superseded.ack)(node, Some(PublishError::Timeout));
                }
            }
            let tx = self.self_tx.clone();
            let deadline = self.publish_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                let _ = tx.send(MasterMsg::HandlerDeadline { version });
            });
        }

        // local application; the follower notification wakes any
        // initial-state waiters on this node
        let transform: UpdateFn = Box::new(move |current| {
            Ok(ClusterState::reuse_unchanged_parts(state, current, &self_id))
        });
        match self.submit.submit(SOURCE_LOCAL_PUBLISH, transform).await {
            Ok(transition) => {
                self.follower.notify_master_publish(transition);
            }
            Err(e) => {
                // a concurrent leader published a newer version first
                tracing::warn!(version, "local publish application failed: {e}");
            }
        }
    }

    fn on_ack(&mut self, version: u64, node: NodeId, error: Option<PublishError>) {
        let Some(handler) = self.handlers.get_mut(&version) else {
            tracing::trace!(version, %node, "ack for a finished publish, ignoring");
            return;
        };
        if handler.pending.remove(&node).is_none() {
            tracing::trace!(version, %node, "duplicate ack, ignoring");
            return;
        }
        if let Some(err) = &error {
            tracing::debug!(version, %node, "publish rejected by follower: {err}");
        }
        (handler.ack)(node, error);
        if handler.pending.is_empty() {
            self.handlers.remove(&version);
        }
    }

    fn on_deadline(&mut self, version: u64) {
        if let Some(mut handler) = self.handlers.remove(&version) {
            tracing::warn!(
                version,
                missing = handler.pending.len(),
                "publish deadline reached with unacknowledged followers"
            );
            for (node, _) in handler.pending.drain() {
                (handler.ack)(node, Some(PublishError::Timeout));
            }
        }
    }

    async fn on_please_publish(&mut self, requester: Address) {
        let current = self.submit.current();
        let bytes = match self.codec.encode(&current) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("failed to encode state for republish: {e}");
                return;
            }
        };
        tracing::debug!(%requester, version = current.version, "republishing state on request");
        let _ = self
            .transport
            .send(
                &requester,
                Endpoint::Follower,
                WireMessage::FollowerPublish {
                    version: current.version,
                    bytes,
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::follower::Follower;
    use crate::membership::sim::SimNet;
    use crate::membership::{Roles, VotingMembers};
    use crate::state::{BincodeStateCodec, ClusterStateStore, NodeInfo, QueuedStateStore};
    use tokio::time::timeout as tokio_timeout;

    fn addr(n: u16) -> Address {
        Address::new(format!("seed-{n}"), 9400)
    }

    fn roles() -> Roles {
        Roles {
            master_eligible: true,
            voter: true,
        }
    }

    struct Fixture {
        #[allow(dead_code)]
        net: SimNet,
        store: Arc<QueuedStateStore>,
        master: MasterHandle,
        master_id: NodeId,
        follower_ids: Vec<NodeId>,
        follower_rxs: Vec<mpsc::UnboundedReceiver<Envelope>>,
        follower_substrates: Vec<Arc<crate::membership::sim::SimMembership>>,
        local_follower: FollowerHandle,
        outcomes: mpsc::UnboundedReceiver<(NodeId, Option<PublishError>)>,
        outcome_tx: mpsc::UnboundedSender<(NodeId, Option<PublishError>)>,
        _shutdown: watch::Sender<bool>,
    }

    /// Real master (and local follower) on node 1; raw follower
    /// mailboxes on nodes 2 and 3.
    async fn fixture(publish_timeout: Duration) -> Fixture {
        let net = SimNet::new();
        let s1 = net.join(addr(1), roles()).await;
        let s2 = net.join(addr(2), roles()).await;
        let s3 = net.join(addr(3), roles()).await;

        let voting = Arc::new(VotingMembers::new([addr(1), addr(2), addr(3)]));
        let store = QueuedStateStore::new();
        let submit = SubmitUpdate::new(store.clone());
        let codec: Arc<dyn StateCodec> = Arc::new(BincodeStateCodec);

        let bus1 = NodeBus::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (local_follower, _ftask) = Follower::spawn(
            s1.clone(),
            voting,
            s1.clone(),
            submit.clone(),
            codec.clone(),
            &bus1,
            shutdown_rx.clone(),
        );
        let (master, _mtask) = Master::spawn(
            s1.clone(),
            s1.clone(),
            submit,
            codec,
            local_follower.clone(),
            &bus1,
            publish_timeout,
            shutdown_rx,
        );
        net.attach_bus(&addr(1), bus1).await;

        let mut follower_rxs = Vec::new();
        for n in [2u16, 3] {
            let bus = NodeBus::new();
            follower_rxs.push(bus.register(Endpoint::Follower));
            net.attach_bus(&addr(n), bus).await;
        }

        let (outcome_tx, outcomes) = mpsc::unbounded_channel();

        Fixture {
            net,
            store,
            master,
            master_id: s1.self_node_id(),
            follower_ids: vec![s2.self_node_id(), s3.self_node_id()],
            follower_rxs,
            follower_substrates: vec![s2, s3],
            local_follower,
            outcomes,
            outcome_tx,
            _shutdown: shutdown_tx,
        }
    }

    fn proposed_state(fx: &Fixture, version: u64) -> ClusterState {
        let mut state = ClusterState::default();
        state.version = version;
        state.master_node_id = Some(fx.master_id.clone());
        let entries = [
            (fx.master_id.clone(), addr(1)),
            (fx.follower_ids[0].clone(), addr(2)),
            (fx.follower_ids[1].clone(), addr(3)),
        ];
        for (node_id, address) in entries {
            state
                .nodes
                .nodes
                .insert(node_id.clone(), NodeInfo { node_id, address });
        }
        state
    }

    fn listener(fx: &Fixture) -> AckListener {
        let tx = fx.outcome_tx.clone();
        Box::new(move |node, error| {
            let _ = tx.send((node, error));
        })
    }

    async fn expect_publish(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> u64 {
        let env = tokio_timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no publish received")
            .unwrap();
        match env.msg {
            WireMessage::FollowerPublish { version, .. } => version,
            other => panic!("unexpected message: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_publish_collects_one_outcome_per_recipient() {
        let mut fx = fixture(Duration::from_secs(5)).await;
        let state = proposed_state(&fx, 1);
        fx.master.publish(state, listener(&fx)).unwrap();

        // both remote followers got the broadcast
        for rx in fx.follower_rxs.iter_mut() {
            assert_eq!(expect_publish(rx).await, 1);
        }

        // acks flow back into the handler
        for (i, substrate) in fx.follower_substrates.iter().enumerate() {
            substrate
                .send(
                    &addr(1),
                    Endpoint::Master,
                    WireMessage::PublishAck {
                        version: 1,
                        node: fx.follower_ids[i].clone(),
                        error: None,
                    },
                )
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..2 {
            let (node, error) = tokio_timeout(Duration::from_secs(5), fx.outcomes.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(error, None);
            seen.push(node);
        }
        seen.sort();
        let mut expected = fx.follower_ids.clone();
        expected.sort();
        assert_eq!(seen, expected);

        // local application happened and woke the local follower
        assert_eq!(fx.store.current().version, 1);
        fx.local_follower.wait_first_submit().await;

        // a late duplicate ack is dropped on the floor
        fx.follower_substrates[0]
            .send(
                &addr(1),
                Endpoint::Master,
                WireMessage::PublishAck {
                    version: 1,
                    node: fx.follower_ids[0].clone(),
                    error: None,
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.outcomes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_silent_followers_become_timeout_outcomes() {
        let mut fx = fixture(Duration::from_millis(300)).await;
        let state = proposed_state(&fx, 1);
        fx.master.publish(state, listener(&fx)).unwrap();

        // only node 2 acks; node 3 stays silent
        fx.follower_substrates[0]
            .send(
                &addr(1),
                Endpoint::Master,
                WireMessage::PublishAck {
                    version: 1,
                    node: fx.follower_ids[0].clone(),
                    error: None,
                },
            )
            .await
            .unwrap();

        let (node, error) = tokio_timeout(Duration::from_secs(5), fx.outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node, fx.follower_ids[0]);
        assert_eq!(error, None);

        let (node, error) = tokio_timeout(Duration::from_secs(5), fx.outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node, fx.follower_ids[1]);
        assert_eq!(error, Some(PublishError::Timeout));

        // deadline passed: nothing further arrives
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.outcomes.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_please_publish_republishes_to_requester_only() {
        let mut fx = fixture(Duration::from_secs(5)).await;
        fx.master.publish(proposed_state(&fx, 4), listener(&fx)).unwrap();
        for rx in fx.follower_rxs.iter_mut() {
            expect_publish(rx).await;
        }

        fx.follower_substrates[0]
            .send(
                &addr(1),
                Endpoint::Master,
                WireMessage::PleasePublish { requester: addr(2) },
            )
            .await
            .unwrap();

        // the requester gets a fresh copy of the current state
        assert_eq!(expect_publish(&mut fx.follower_rxs[0]).await, 4);
        // the other follower does not
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.follower_rxs[1].try_recv().is_err());
    }
}
