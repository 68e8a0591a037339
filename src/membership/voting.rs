//! Voting Members
//!
//! The statically configured seed set and its quorum arithmetic. The seed
//! set is immutable for the process lifetime: the quorum denominator never
//! follows current membership.

use std::collections::BTreeSet;

use crate::membership::{Address, ClusterView};

/// The set of seed addresses as configured at startup
#[derive(Debug, Clone)]
pub struct VotingMembers {
    seeds: BTreeSet<Address>,
}

impl VotingMembers {
    pub fn new(seeds: impl IntoIterator<Item = Address>) -> Self {
        Self {
            seeds: seeds.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.seeds.contains(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.seeds.iter()
    }

    /// Majority of the seed set
    pub fn quorum_size(&self) -> usize {
        self.seeds.len() / 2 + 1
    }

    /// Count the seed members that are Up and reachable in the given view
    pub fn up_voters(&self, view: &ClusterView) -> usize {
        view.members
            .iter()
            .filter(|m| {
                m.is_up()
                    && self.seeds.contains(&m.address)
                    && !view.unreachable.contains(&m.address)
            })
            .count()
    }

    /// Whether a majority of seed members is Up and reachable
    pub fn quorum_available(&self, view: &ClusterView) -> bool {
        self.up_voters(view) >= self.quorum_size()
    }
}
