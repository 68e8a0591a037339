//! In-Process Membership Substrate
//!
//! A single-process gossip hub for tests and simulations: many nodes join
//! the same [`SimNet`], each receiving a handle that implements both the
//! membership substrate contract and the transport. Links between nodes
//! can be cut and healed to stand in for the failure detector, and message
//! routing honors cut links (silent drop) with FIFO delivery per pair.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, RwLock};

use crate::discovery::protocol::WireMessage;
use crate::discovery::{NodeFactory, NodeRuntime};
use crate::error::{Error, Result};
use crate::membership::{
    Address, ClusterView, Member, MemberEvent, MemberStatus, MembershipSubstrate, NodeId, Roles,
};
use crate::transport::{Endpoint, Envelope, NodeBus, Transport};

struct Subscriber {
    address: Address,
    tx: mpsc::UnboundedSender<MemberEvent>,
}

#[derive(Default)]
struct SimInner {
    next_join_seq: u64,
    members: BTreeMap<Address, Member>,
    /// Downed node ids; absorbing, a downed id may never rejoin
    tombstones: HashSet<NodeId>,
    subscribers: Vec<Subscriber>,
    buses: HashMap<Address, NodeBus>,
    cut: HashSet<(Address, Address)>,
}

impl SimInner {
    fn link_key(a: &Address, b: &Address) -> (Address, Address) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    fn is_cut(&self, a: &Address, b: &Address) -> bool {
        self.cut.contains(&Self::link_key(a, b))
    }

    /// Deliver a membership event to every subscriber the origin can
    /// still reach (gossip does not cross a cut link).
    fn broadcast(&mut self, origin: &Address, event: MemberEvent) {
        let cut = std::mem::take(&mut self.cut);
        self.subscribers.retain(|sub| {
            let reachable = sub.address == *origin
                || !cut.contains(&Self::link_key(origin, &sub.address));
            if reachable {
                sub.tx.send(event.clone()).is_ok()
            } else {
                true
            }
        });
        self.cut = cut;
    }

    /// Deliver a reachability event to one side only
    fn notify_observer(&mut self, observer: &Address, event: MemberEvent) {
        self.subscribers
            .retain(|sub| sub.address != *observer || sub.tx.send(event.clone()).is_ok());
    }
}

/// Hub shared by all simulated nodes
#[derive(Clone, Default)]
pub struct SimNet {
    inner: Arc<RwLock<SimInner>>,
}

impl SimNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a new node (fresh `NodeId`, as after a process restart) and
    /// return its substrate/transport handle.
    pub async fn join(&self, address: Address, roles: Roles) -> Arc<SimMembership> {
        let node_id = NodeId::generate();
        self.admit(node_id.clone(), address.clone(), roles).await;
        Arc::new(SimMembership {
            net: self.clone(),
            address,
            node_id,
            roles,
        })
    }

    /// Attempt to rejoin with an existing identity. Fails for downed ids:
    /// Down is absorbing and only a restart (fresh id) clears it.
    pub async fn try_rejoin(
        &self,
        node_id: NodeId,
        address: Address,
        roles: Roles,
    ) -> Result<Arc<SimMembership>> {
        {
            let inner = self.inner.read().await;
            if inner.tombstones.contains(&node_id) {
                return Err(Error::DownedNode);
            }
        }
        self.admit(node_id.clone(), address.clone(), roles).await;
        Ok(Arc::new(SimMembership {
            net: self.clone(),
            address,
            node_id,
            roles,
        }))
    }

    async fn admit(&self, node_id: NodeId, address: Address, roles: Roles) {
        let mut inner = self.inner.write().await;

        // a joining address supersedes any stale incarnation
        if let Some(mut old) = inner.members.remove(&address) {
            old.status = MemberStatus::Removed;
            inner.broadcast(&address, MemberEvent::MemberRemoved(old));
        }
        // fresh process, fresh links
        inner
            .cut
            .retain(|(a, b)| a != &address && b != &address);

        inner.next_join_seq += 1;
        let member = Member {
            address: address.clone(),
            node_id,
            roles,
            status: MemberStatus::Up,
            join_seq: inner.next_join_seq,
            joined_at: Utc::now(),
        };
        inner.members.insert(address.clone(), member.clone());
        inner.broadcast(&address, MemberEvent::MemberUp(member));
    }

    /// Attach the node's inbound message bus
    pub async fn attach_bus(&self, address: &Address, bus: NodeBus) {
        let mut inner = self.inner.write().await;
        inner.buses.insert(address.clone(), bus);
    }

    /// Cut the link between two nodes; both failure detectors fire
    pub async fn cut_link(&self, a: &Address, b: &Address) {
        let mut inner = self.inner.write().await;
        inner.cut.insert(SimInner::link_key(a, b));
        if let Some(m) = inner.members.get(b).cloned() {
            inner.notify_observer(a, MemberEvent::Unreachable(m));
        }
        if let Some(m) = inner.members.get(a).cloned() {
            inner.notify_observer(b, MemberEvent::Unreachable(m));
        }
    }

    /// Heal the link between two nodes
    pub async fn heal_link(&self, a: &Address, b: &Address) {
        let mut inner = self.inner.write().await;
        if !inner.cut.remove(&SimInner::link_key(a, b)) {
            return;
        }
        if let Some(m) = inner.members.get(b).cloned() {
            inner.notify_observer(a, MemberEvent::Reachable(m));
        }
        if let Some(m) = inner.members.get(a).cloned() {
            inner.notify_observer(b, MemberEvent::Reachable(m));
        }
    }

    /// Cut every link between the two groups
    pub async fn partition(&self, group_a: &[Address], group_b: &[Address]) {
        for a in group_a {
            for b in group_b {
                self.cut_link(a, b).await;
            }
        }
    }

    /// Abrupt node death: the member record stays (nobody has downed it
    /// yet), but its traffic stops and every peer sees it unreachable.
    pub async fn kill(&self, address: &Address) {
        let mut inner = self.inner.write().await;
        inner.buses.remove(address);
        inner.subscribers.retain(|sub| sub.address != *address);
        let peers: Vec<Address> = inner
            .members
            .keys()
            .filter(|a| *a != address)
            .cloned()
            .collect();
        let dead = inner.members.get(address).cloned();
        for peer in peers {
            inner.cut.insert(SimInner::link_key(address, &peer));
            if let Some(m) = dead.clone() {
                inner.notify_observer(&peer, MemberEvent::Unreachable(m));
            }
        }
    }

    /// Current member record at an address, if any
    pub async fn member_at(&self, address: &Address) -> Option<Member> {
        self.inner.read().await.members.get(address).cloned()
    }

    async fn view_for(&self, observer: &Address) -> ClusterView {
        let inner = self.inner.read().await;
        let unreachable: BTreeSet<Address> = inner
            .members
            .keys()
            .filter(|a| *a != observer && inner.is_cut(observer, a))
            .cloned()
            .collect();
        ClusterView {
            members: inner.members.values().cloned().collect(),
            unreachable,
        }
    }

    async fn subscribe_for(&self, observer: &Address) -> mpsc::UnboundedReceiver<MemberEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.write().await;
        for member in inner.members.values() {
            if member.is_up() {
                let _ = tx.send(MemberEvent::MemberUp(member.clone()));
            }
        }
        inner.subscribers.push(Subscriber {
            address: observer.clone(),
            tx,
        });
        rx
    }

    async fn down_member(&self, origin: &Address, target: &Address) -> Result<()> {
        let mut inner = self.inner.write().await;
        let Some(mut member) = inner.members.remove(target) else {
            return Err(Error::UnknownMember(target.to_string()));
        };
        member.status = MemberStatus::Down;
        inner.tombstones.insert(member.node_id.clone());
        inner.broadcast(origin, MemberEvent::MemberRemoved(member));
        Ok(())
    }

    async fn leave_member(&self, origin: &Address, node_id: &NodeId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let Some(member) = inner.members.get(origin) else {
            return Ok(());
        };
        if &member.node_id != node_id {
            // a newer incarnation took this address; nothing to leave
            return Ok(());
        }
        let mut member = inner.members.remove(origin).expect("member checked above");
        member.status = MemberStatus::Exiting;
        inner.broadcast(origin, MemberEvent::MemberExited(member.clone()));
        member.status = MemberStatus::Removed;
        inner.broadcast(origin, MemberEvent::MemberRemoved(member));
        Ok(())
    }

    async fn route(&self, from: &Address, to: &Address, endpoint: Endpoint, msg: WireMessage) {
        let inner = self.inner.read().await;
        if from != to && inner.is_cut(from, to) {
            tracing::trace!(%from, %to, msg = msg.type_name(), "dropping message across cut link");
            return;
        }
        match inner.buses.get(to) {
            Some(bus) => bus.deliver(Envelope {
                from: from.clone(),
                endpoint,
                msg,
            }),
            None => {
                tracing::trace!(%from, %to, msg = msg.type_name(), "dropping message for absent node");
            }
        }
    }
}

/// Per-node handle; implements both the substrate contract and transport
pub struct SimMembership {
    net: SimNet,
    address: Address,
    node_id: NodeId,
    roles: Roles,
}

impl SimMembership {
    pub fn net(&self) -> &SimNet {
        &self.net
    }
}

impl std::fmt::Debug for SimMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimMembership")
            .field("address", &self.address)
            .field("node_id", &self.node_id)
            .field("roles", &self.roles)
            .finish()
    }
}

#[async_trait]
impl MembershipSubstrate for SimMembership {
    fn self_address(&self) -> Address {
        self.address.clone()
    }

    fn self_node_id(&self) -> NodeId {
        self.node_id.clone()
    }

    fn self_roles(&self) -> Roles {
        self.roles
    }

    async fn view(&self) -> ClusterView {
        self.net.view_for(&self.address).await
    }

    async fn subscribe(&self) -> mpsc::UnboundedReceiver<MemberEvent> {
        self.net.subscribe_for(&self.address).await
    }

    async fn down(&self, address: &Address) -> Result<()> {
        self.net.down_member(&self.address, address).await
    }

    async fn leave(&self) -> Result<()> {
        self.net.leave_member(&self.address, &self.node_id).await
    }
}

#[async_trait]
impl Transport for SimMembership {
    async fn send(&self, to: &Address, endpoint: Endpoint, msg: WireMessage) -> Result<()> {
        self.net.route(&self.address, to, endpoint, msg).await;
        Ok(())
    }
}

/// Node factory over a [`SimNet`]: every build joins as a brand-new
/// member with a fresh identity, which is exactly the restart semantics
/// the lifecycle needs.
pub struct SimNodeFactory {
    net: SimNet,
    address: Address,
    roles: Roles,
}

impl SimNodeFactory {
    pub fn new(net: SimNet, address: Address, roles: Roles) -> Self {
        Self { net, address, roles }
    }
}

#[async_trait]
impl NodeFactory for SimNodeFactory {
    async fn build(&self) -> Result<NodeRuntime> {
        let handle = self.net.join(self.address.clone(), self.roles).await;
        let bus = NodeBus::new();
        self.net.attach_bus(&self.address, bus.clone()).await;
        Ok(NodeRuntime {
            substrate: handle.clone(),
            transport: handle,
            bus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u16) -> Address {
        Address::new(format!("node-{n}"), 9400)
    }

    fn roles() -> Roles {
        Roles {
            master_eligible: true,
            voter: true,
        }
    }

    #[tokio::test]
    async fn test_join_replays_members_to_new_subscriber() {
        let net = SimNet::new();
        let _n1 = net.join(addr(1), roles()).await;
        let n2 = net.join(addr(2), roles()).await;

        let mut events = n2.subscribe().await;
        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert!(matches!(first, MemberEvent::MemberUp(_)));
        assert!(matches!(second, MemberEvent::MemberUp(_)));

        let view = n2.view().await;
        assert_eq!(view.members.len(), 2);
        assert!(view.unreachable.is_empty());
    }

    #[tokio::test]
    async fn test_oldest_ordering_follows_join_order() {
        let net = SimNet::new();
        let n1 = net.join(addr(1), roles()).await;
        let _n2 = net.join(addr(2), roles()).await;

        let view = n1.view().await;
        let oldest = view.oldest_master_eligible().unwrap();
        assert_eq!(oldest.address, addr(1));
    }

    #[tokio::test]
    async fn test_leave_emits_exited_then_removed() {
        let net = SimNet::new();
        let n1 = net.join(addr(1), roles()).await;
        let n2 = net.join(addr(2), roles()).await;

        let mut events = n1.subscribe().await;
        // drain the replay
        while let Ok(ev) = events.try_recv() {
            assert!(matches!(ev, MemberEvent::MemberUp(_)));
        }

        n2.leave().await.unwrap();

        let exited = events.recv().await.unwrap();
        assert!(matches!(exited, MemberEvent::MemberExited(ref m) if m.address == addr(2)));
        let removed = events.recv().await.unwrap();
        assert!(matches!(removed, MemberEvent::MemberRemoved(ref m) if m.address == addr(2)));
    }

    #[tokio::test]
    async fn test_down_is_absorbing() {
        let net = SimNet::new();
        let n1 = net.join(addr(1), roles()).await;
        let n2 = net.join(addr(2), roles()).await;

        n1.down(&addr(2)).await.unwrap();
        assert!(net.member_at(&addr(2)).await.is_none());

        // the downed identity may not come back
        let err = net
            .try_rejoin(n2.self_node_id(), addr(2), roles())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DownedNode));

        // a restart (fresh id) is allowed
        let n2_restarted = net.join(addr(2), roles()).await;
        assert_ne!(n2_restarted.self_node_id(), n2.self_node_id());
        assert!(net.member_at(&addr(2)).await.is_some());
    }

    #[tokio::test]
    async fn test_cut_link_fires_failure_detector_and_drops_traffic() {
        let net = SimNet::new();
        let n1 = net.join(addr(1), roles()).await;
        let _n2 = net.join(addr(2), roles()).await;

        let bus2 = NodeBus::new();
        let mut pinger2 = bus2.register(Endpoint::Pinger);
        net.attach_bus(&addr(2), bus2).await;

        let mut events = n1.subscribe().await;
        while events.try_recv().is_ok() {}

        net.cut_link(&addr(1), &addr(2)).await;
        let ev = events.recv().await.unwrap();
        assert!(matches!(ev, MemberEvent::Unreachable(ref m) if m.address == addr(2)));

        let view = n1.view().await;
        assert!(view.unreachable.contains(&addr(2)));

        // traffic across the cut link is silently dropped
        n1.send(&addr(2), Endpoint::Pinger, WireMessage::ProbeReply { probe_id: 1 })
            .await
            .unwrap();
        assert!(pinger2.try_recv().is_err());

        net.heal_link(&addr(1), &addr(2)).await;
        let ev = events.recv().await.unwrap();
        assert!(matches!(ev, MemberEvent::Reachable(ref m) if m.address == addr(2)));

        n1.send(&addr(2), Endpoint::Pinger, WireMessage::ProbeReply { probe_id: 2 })
            .await
            .unwrap();
        assert!(matches!(
            pinger2.recv().await.unwrap().msg,
            WireMessage::ProbeReply { probe_id: 2 }
        ));
    }

    #[tokio::test]
    async fn test_down_does_not_gossip_across_partition() {
        let net = SimNet::new();
        let n1 = net.join(addr(1), roles()).await;
        let n3 = net.join(addr(3), roles()).await;

        let mut events3 = n3.subscribe().await;
        while events3.try_recv().is_ok() {}

        net.cut_link(&addr(1), &addr(3)).await;
        // n3 hears its own failure detector...
        assert!(matches!(
            events3.recv().await.unwrap(),
            MemberEvent::Unreachable(_)
        ));

        n1.down(&addr(3)).await.unwrap();
        // ...but not the eviction decided on the far side
        assert!(events3.try_recv().is_err());
    }
}
