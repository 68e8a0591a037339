//! Eskka - Gossip Discovery & Partition Resolution
//!
//! A cluster-membership and partition-resolution subsystem that serves as
//! the discovery layer of a search-index cluster manager. Nodes find each
//! other from a static seed list, form one logical cluster over a gossip
//! membership substrate, elect a deterministic leader (the oldest
//! master-eligible member), and fan cluster-state snapshots out from the
//! leader to every follower.
//!
//! # Architecture
//!
//! Every component is a single-threaded message loop; all coordination is
//! message passing. The master serializes publishes through the host's
//! state queue; followers gate acceptance on seed quorum and clear their
//! state while quorum is gone; on every voter a partition monitor collects
//! affirmative ping timeouts from its peers and downs an unreachable node
//! only once a quorum of voters agrees; sustained quorum loss restarts
//! the whole local instance under a fresh identity.
//!
//! # Features
//!
//! - Deterministic leader selection on membership age, no ballots
//! - Quorum-gated publish acceptance with per-recipient acknowledgements
//! - Partition downing that requires affirmative evidence from a quorum
//!   of seed voters, immune to plain message loss
//! - Automatic self-restart with bounded, jittered backoff
//! - In-process simulation substrate for multi-node tests

pub mod config;
pub mod error;
pub mod membership;
pub mod state;
pub mod transport;
pub mod discovery;

pub use config::EskkaConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::EskkaConfig;
    pub use crate::discovery::{Discovery, NodeFactory, NodeRuntime, RestartPolicy};
    pub use crate::error::{Error, PublishError, Result};
    pub use crate::membership::{
        Address, Member, MemberEvent, MemberStatus, MembershipSubstrate, NodeId, Roles,
        VotingMembers,
    };
    pub use crate::state::{
        ClusterState, ClusterStateStore, QueuedStateStore, StateCodec, SubmitUpdate, Transition,
    };
}
