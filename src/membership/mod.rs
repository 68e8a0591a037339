//! Membership Module
//!
//! The data model gossiped by the membership substrate, the substrate
//! contract itself, the static voting set, and an in-process substrate
//! for tests and simulations.

mod member;
mod voting;
mod substrate;
pub mod sim;

pub use member::{Address, Member, MemberEvent, MemberStatus, NodeId, Roles};
pub use substrate::{ClusterView, FailureDetectorConfig, MembershipSubstrate};
pub use voting::VotingMembers;
