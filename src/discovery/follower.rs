//! Follower
//!
//! Accepts state publishes from the master, gated on seed quorum: while
//! the local view lacks quorum every publish is rejected and the local
//! state is cleared down to the bare, blocked snapshot. A periodic check
//! watches the quorum edge in both directions and asks the master for a
//! fresh snapshot once quorum returns.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::discovery::protocol::WireMessage;
use crate::error::PublishError;
use crate::membership::{Address, MembershipSubstrate, VotingMembers};
use crate::state::{ClusterState, NodeInfo, StateCodec, SubmitUpdate, Transition, UpdateFn};
use crate::transport::{Endpoint, Envelope, NodeBus, Transport};

/// How often the quorum flag is re-evaluated
pub(crate) const QUORUM_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Retry delay after a failed clear-state submission
pub(crate) const RETRY_CLEAR_STATE_DELAY: Duration = Duration::from_secs(1);

/// Source labels for state submissions
const SOURCE_MASTER_PUBLISH: &str = "follower{master-publish}";
const SOURCE_CLEAR_STATE: &str = "follower{clear-state}";

/// Local notifications into the follower task
#[derive(Debug)]
pub enum FollowerNotice {
    /// The local master applied a publish; wakes initial-state waiters
    MasterPublish(Transition),
    /// Clear local state if still without quorum
    ClearState,
}

/// Handle held by the lifecycle and the local master
#[derive(Clone)]
pub struct FollowerHandle {
    tx: mpsc::UnboundedSender<FollowerNotice>,
    first_submit: watch::Receiver<bool>,
}

impl FollowerHandle {
    pub fn notify_master_publish(&self, transition: Transition) {
        let _ = self.tx.send(FollowerNotice::MasterPublish(transition));
    }

    /// One-shot first-submit future: resolves once any cluster-state
    /// update has been applied locally
    pub fn first_submit(&self) -> watch::Receiver<bool> {
        self.first_submit.clone()
    }

    pub async fn wait_first_submit(&self) {
        let mut rx = self.first_submit.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct Follower {
    substrate: Arc<dyn MembershipSubstrate>,
    voting: Arc<VotingMembers>,
    transport: Arc<dyn Transport>,
    submit: SubmitUpdate,
    codec: Arc<dyn StateCodec>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    notices: mpsc::UnboundedReceiver<FollowerNotice>,
    self_tx: mpsc::UnboundedSender<FollowerNotice>,
    first_submit_tx: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
    quorum_last: bool,
    pending_publish_request: bool,
}

impl Follower {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        substrate: Arc<dyn MembershipSubstrate>,
        voting: Arc<VotingMembers>,
        transport: Arc<dyn Transport>,
        submit: SubmitUpdate,
        codec: Arc<dyn StateCodec>,
        bus: &NodeBus,
        shutdown: watch::Receiver<bool>,
    ) -> (FollowerHandle, JoinHandle<()>) {
        let inbox = bus.register(Endpoint::Follower);
        let (self_tx, notices) = mpsc::unbounded_channel();
        let (first_submit_tx, first_submit) = watch::channel(false);

        let handle = FollowerHandle {
            tx: self_tx.clone(),
            first_submit,
        };

        let follower = Self {
            substrate,
            voting,
            transport,
            submit,
            codec,
            inbox,
            notices,
            self_tx,
            first_submit_tx,
            shutdown,
            quorum_last: true,
            pending_publish_request: false,
        };
        let task = tokio::spawn(follower.run());
        (handle, task)
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(QUORUM_CHECK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

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
                notice = self.notices.recv() => {
                    match notice {
                        Some(FollowerNotice::MasterPublish(transition)) => {
                            tracing::debug!(version = transition.new_state.version,
                                "local master publish applied");
                            self.on_applied();
                        }
                        Some(FollowerNotice::ClearState) => self.on_clear_state().await,
                        None => break,
                    }
                }
                _ = tick.tick() => self.on_quorum_tick().await,
            }
        }
    }

    async fn handle(&mut self, env: Envelope) {
        match env.msg {
            WireMessage::FollowerPublish { version, bytes } => {
                self.on_publish(env.from, version, bytes).await;
            }
            other => {
                tracing::trace!(msg = other.type_name(), "follower ignoring message");
            }
        }
    }

    async fn on_publish(&mut self, from: Address, version: u64, bytes: Bytes) {
        if !self.quorum_last {
            tracing::info!(version, "rejecting publish: no seed quorum");
            self.ack(&from, version, Some(PublishError::QuorumUnavailable))
                .await;
            return;
        }

        let incoming = match self.codec.decode(&bytes) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(version, "failed to decode published state: {e}");
                self.ack(&from, version, Some(PublishError::from(&e))).await;
                return;
            }
        };

        let self_id = self.substrate.self_node_id();
        if incoming.master_node_id.as_ref() == Some(&self_id) {
            tracing::error!(version, "published state names this node as its master");
            self.ack(
                &from,
                version,
                Some(PublishError::Application(
                    "published state names the recipient as master".into(),
                )),
            )
            .await;
            return;
        }

        let transform: UpdateFn = Box::new(move |current| {
            Ok(ClusterState::reuse_unchanged_parts(incoming, current, &self_id))
        });

        match self.submit.submit(SOURCE_MASTER_PUBLISH, transform).await {
            Ok(transition) => {
                tracing::debug!(version = transition.new_state.version, "publish applied");
                self.on_applied();
                self.ack(&from, version, None).await;
            }
            Err(e) => {
                tracing::debug!(version, "publish not applied: {e}");
                self.ack(&from, version, Some(PublishError::from(&e))).await;
            }
        }
    }

    async fn on_quorum_tick(&mut self) {
        let view = self.substrate.view().await;
        let cur = self.voting.quorum_available(&view);

        if cur != self.quorum_last {
            if cur {
                tracing::info!("seed quorum regained");
                self.pending_publish_request = true;
            } else {
                tracing::warn!(
                    up = self.voting.up_voters(&view),
                    required = self.voting.quorum_size(),
                    "seed quorum lost"
                );
                let _ = self.self_tx.send(FollowerNotice::ClearState);
            }
        }

        if self.pending_publish_request {
            // idempotent; drops silently while the master is unreachable
            if let Some(master) = view.oldest_master_eligible() {
                let _ = self
                    .transport
                    .send(
                        &master.address,
                        Endpoint::Master,
                        WireMessage::PleasePublish {
                            requester: self.substrate.self_address(),
                        },
                    )
                    .await;
            }
        }

        self.quorum_last = cur;
    }

    async fn on_clear_state(&mut self) {
        let view = self.substrate.view().await;
        if self.voting.quorum_available(&view) {
            tracing::debug!("quorum returned before clear-state ran; skipping");
            return;
        }

        let local = NodeInfo {
            node_id: self.substrate.self_node_id(),
            address: self.substrate.self_address(),
        };
        let transform: UpdateFn = Box::new(move |current| Ok(current.cleared(local)));

        match self.submit.submit(SOURCE_CLEAR_STATE, transform).await {
            Ok(_) => {
                tracing::info!("cleared local cluster state under quorum loss");
                self.on_applied();
            }
            Err(e) => {
                tracing::warn!("clear-state failed, retrying: {e}");
                let tx = self.self_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(RETRY_CLEAR_STATE_DELAY).await;
                    let _ = tx.send(FollowerNotice::ClearState);
                });
            }
        }
    }

    fn on_applied(&mut self) {
        self.pending_publish_request = false;
        self.first_submit_tx.send_replace(true);
    }

    async fn ack(&self, to: &Address, version: u64, error: Option<PublishError>) {
        let _ = self
            .transport
            .send(
                to,
                Endpoint::Master,
                WireMessage::PublishAck {
                    version,
                    node: self.substrate.self_node_id(),
                    error,
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::sim::SimNet;
    use crate::membership::{NodeId, Roles};
    use crate::state::{
        BincodeStateCodec, ClusterBlock, ClusterStateStore, QueuedStateStore,
    };
    use tokio::time::timeout as tokio_timeout;

    fn addr(n: u16) -> Address {
        Address::new(format!("seed-{n}"), 9400)
    }

    fn voting() -> Arc<VotingMembers> {
        Arc::new(VotingMembers::new([addr(1), addr(2), addr(3)]))
    }

    fn roles() -> Roles {
        Roles {
            master_eligible: true,
            voter: true,
        }
    }

    struct Fixture {
        net: SimNet,
        store: Arc<QueuedStateStore>,
        follower: FollowerHandle,
        follower_substrate: Arc<crate::membership::sim::SimMembership>,
        master_rx: mpsc::UnboundedReceiver<Envelope>,
        master_substrate: Arc<crate::membership::sim::SimMembership>,
        _shutdown: watch::Sender<bool>,
    }

    /// A non-seed node 9 plays the master (raw mailbox) so it stays
    /// reachable when the follower is cut off from the seeds; node 2 runs
    /// the follower; nodes 1 and 3 exist to make up the seed quorum.
    async fn fixture() -> Fixture {
        let net = SimNet::new();
        let master_substrate = net
            .join(
                addr(9),
                Roles {
                    master_eligible: true,
                    voter: false,
                },
            )
            .await;
        let _first = net.join(addr(1), roles()).await;
        let follower_substrate = net.join(addr(2), roles()).await;
        let _third = net.join(addr(3), roles()).await;

        let master_bus = NodeBus::new();
        let master_rx = master_bus.register(Endpoint::Master);
        net.attach_bus(&addr(9), master_bus).await;

        let store = QueuedStateStore::new();
        let bus = NodeBus::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (follower, _task) = Follower::spawn(
            follower_substrate.clone(),
            voting(),
            follower_substrate.clone(),
            SubmitUpdate::new(store.clone()),
            Arc::new(BincodeStateCodec),
            &bus,
            shutdown_rx,
        );
        net.attach_bus(&addr(2), bus).await;

        Fixture {
            net,
            store,
            follower,
            follower_substrate,
            master_rx,
            master_substrate,
            _shutdown: shutdown_tx,
        }
    }

    fn published_state(version: u64, master: &NodeId, follower: &NodeId) -> ClusterState {
        let mut state = ClusterState::default();
        state.version = version;
        state.master_node_id = Some(master.clone());
        for (id, n) in [(master, 9u16), (follower, 2u16)] {
            state.nodes.nodes.insert(
                id.clone(),
                NodeInfo {
                    node_id: id.clone(),
                    address: addr(n),
                },
            );
        }
        state
    }

    async fn send_publish(fx: &mut Fixture, state: &ClusterState) {
        let bytes = BincodeStateCodec.encode(state).unwrap();
        fx.master_substrate
            .send(
                &addr(2),
                Endpoint::Follower,
                WireMessage::FollowerPublish {
                    version: state.version,
                    bytes,
                },
            )
            .await
            .unwrap();
    }

    async fn next_ack(fx: &mut Fixture) -> (u64, Option<PublishError>) {
        loop {
            let env = tokio_timeout(Duration::from_secs(5), fx.master_rx.recv())
                .await
                .expect("timed out waiting for ack")
                .unwrap();
            match env.msg {
                WireMessage::PublishAck { version, error, .. } => return (version, error),
                // quorum ticks may interleave please-publish requests
                WireMessage::PleasePublish { .. } => continue,
                other => panic!("unexpected message: {}", other.type_name()),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_applies_and_acks() {
        let mut fx = fixture().await;
        let state = published_state(
            1,
            &fx.master_substrate.self_node_id(),
            &fx.follower_substrate.self_node_id(),
        );

        send_publish(&mut fx, &state).await;
        let (version, error) = next_ack(&mut fx).await;
        assert_eq!(version, 1);
        assert_eq!(error, None);

        let current = fx.store.current();
        assert_eq!(current.version, 1);
        assert_eq!(
            current.nodes.local_node_id,
            Some(fx.follower_substrate.self_node_id())
        );

        fx.follower.wait_first_submit().await;
    }

    #[tokio::test]
    async fn test_stale_replay_produces_no_state_change() {
        let mut fx = fixture().await;
        let master = fx.master_substrate.self_node_id();
        let follower = fx.follower_substrate.self_node_id();

        send_publish(&mut fx, &published_state(3, &master, &follower)).await;
        let (_, error) = next_ack(&mut fx).await;
        assert_eq!(error, None);

        // replay an older version
        send_publish(&mut fx, &published_state(2, &master, &follower)).await;
        let (version, error) = next_ack(&mut fx).await;
        assert_eq!(version, 2);
        assert!(matches!(error, Some(PublishError::Application(_))));
        assert_eq!(fx.store.current().version, 3);
    }

    #[tokio::test]
    async fn test_publish_rejected_and_state_cleared_without_quorum() {
        let mut fx = fixture().await;
        let master = fx.master_substrate.self_node_id();
        let follower = fx.follower_substrate.self_node_id();

        send_publish(&mut fx, &published_state(1, &master, &follower)).await;
        let (_, error) = next_ack(&mut fx).await;
        assert_eq!(error, None);

        // isolate the follower from the other two seeds
        fx.net.cut_link(&addr(2), &addr(1)).await;
        fx.net.cut_link(&addr(2), &addr(3)).await;

        // wait for the quorum tick to clear state
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let current = fx.store.current();
            if current.has_global_block(ClusterBlock::NoMaster)
                && current.nodes.nodes.len() == 1
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "state never cleared");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // publishes are now refused outright, without touching the store
        send_publish(&mut fx, &published_state(2, &master, &follower)).await;
        let (version, error) = next_ack(&mut fx).await;
        assert_eq!(version, 2);
        assert_eq!(error, Some(PublishError::QuorumUnavailable));
        assert!(fx.store.current().has_global_block(ClusterBlock::NoMaster));
        assert_eq!(fx.store.current().nodes.nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_please_publish_sent_on_quorum_regain() {
        let mut fx = fixture().await;

        fx.net.cut_link(&addr(2), &addr(1)).await;
        fx.net.cut_link(&addr(2), &addr(3)).await;
        tokio::time::sleep(QUORUM_CHECK_INTERVAL * 3).await;

        fx.net.heal_link(&addr(2), &addr(1)).await;
        fx.net.heal_link(&addr(2), &addr(3)).await;

        let env = tokio_timeout(Duration::from_secs(5), async {
            loop {
                let env = fx.master_rx.recv().await.unwrap();
                if matches!(env.msg, WireMessage::PleasePublish { .. }) {
                    return env;
                }
            }
        })
        .await
        .expect("no PleasePublish after quorum regain");

        match env.msg {
            WireMessage::PleasePublish { requester } => assert_eq!(requester, addr(2)),
            _ => unreachable!(),
        }
    }
}
