//! Membership Substrate Contract
//!
//! The gossip membership layer is treated as a black box behind this
//! trait: heartbeat failure detection, member status gossip, and the
//! deterministic "oldest" ordering all live on the other side. Production
//! deployments adapt a real gossip implementation; tests and
//! single-process simulations use [`crate::membership::sim::SimNet`].

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::membership::{Address, Member, MemberEvent, NodeId, Roles};

/// Read-only snapshot of the substrate's membership state.
///
/// `unreachable` mirrors the local failure detector: addresses of members
/// that are still part of the cluster but currently suspected.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    pub members: Vec<Member>,
    pub unreachable: BTreeSet<Address>,
}

impl ClusterView {
    pub fn member_at(&self, address: &Address) -> Option<&Member> {
        self.members.iter().find(|m| &m.address == address)
    }

    /// The deterministic leader: the oldest Up master-eligible member
    pub fn oldest_master_eligible(&self) -> Option<&Member> {
        self.members
            .iter()
            .filter(|m| m.is_up() && m.roles.master_eligible)
            .min_by_key(|m| (m.join_seq, &m.address))
    }
}

/// Heartbeat failure detector tunables, handed to the substrate at join
#[derive(Debug, Clone)]
pub struct FailureDetectorConfig {
    pub heartbeat_interval: Duration,
    pub acceptable_heartbeat_pause: Duration,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            acceptable_heartbeat_pause: Duration::from_secs(3),
        }
    }
}

/// Contract the gossip membership layer must satisfy.
///
/// Events are delivered in order per subscriber, with the current Up
/// members replayed as `MemberUp` before any live event. `down` is
/// absorbing: a downed node cannot rejoin without a restart (which
/// regenerates its `NodeId`).
#[async_trait]
pub trait MembershipSubstrate: Send + Sync + 'static {
    fn self_address(&self) -> Address;

    fn self_node_id(&self) -> NodeId;

    fn self_roles(&self) -> Roles;

    /// Snapshot of current members and locally suspected addresses
    async fn view(&self) -> ClusterView;

    /// Subscribe to membership and reachability events
    async fn subscribe(&self) -> mpsc::UnboundedReceiver<MemberEvent>;

    /// Unilaterally mark a member Down; gossip propagates the eviction
    async fn down(&self, address: &Address) -> Result<()>;

    /// Voluntary departure; terminates by emitting `MemberRemoved(self)`
    async fn leave(&self) -> Result<()>;
}
