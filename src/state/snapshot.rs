//! Cluster-State Snapshots
//!
//! The immutable, versioned cluster-state model owned by the host's state
//! store, plus the rebuild rules a follower applies when it receives a
//! published snapshot: parts whose version did not change are kept from
//! the current local state so unchanged routing and metadata are never
//! re-materialized.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::membership::{Address, NodeId};

/// A node entry inside a published state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub address: Address,
}

/// The discovery nodes section of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNodes {
    /// Set by each node when it applies the state locally
    pub local_node_id: Option<NodeId>,
    pub nodes: BTreeMap<NodeId, NodeInfo>,
}

impl DiscoveryNodes {
    pub fn only(local: NodeInfo) -> Self {
        let mut nodes = BTreeMap::new();
        let node_id = local.node_id.clone();
        nodes.insert(node_id.clone(), local);
        Self {
            local_node_id: Some(node_id),
            nodes,
        }
    }
}

/// Shard routing for one index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRouting {
    pub shards: u32,
    /// Shard number to assigned node
    pub assigned: BTreeMap<u32, NodeId>,
}

/// The routing table section of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    pub version: u64,
    pub indices: BTreeMap<String, IndexRouting>,
}

/// Per-index metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetaData {
    pub version: u64,
    pub settings: BTreeMap<String, String>,
}

/// The metadata section of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    pub version: u64,
    pub indices: BTreeMap<String, IndexMetaData>,
}

/// Cluster-wide operation blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ClusterBlock {
    /// No elected master is known
    NoMaster,
    /// State has not been recovered since startup
    StateNotRecovered,
}

/// The blocks section of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocks {
    pub global: BTreeSet<ClusterBlock>,
}

/// An immutable, versioned cluster-state snapshot.
///
/// Updates never mutate in place; they build a new snapshot from the old.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub version: u64,
    pub master_node_id: Option<NodeId>,
    pub nodes: DiscoveryNodes,
    pub routing_table: RoutingTable,
    pub metadata: MetaData,
    pub blocks: Blocks,
}

impl ClusterState {
    /// The state every node starts from: nothing known, fully blocked
    pub fn initial() -> Self {
        let mut blocks = Blocks::default();
        blocks.global.insert(ClusterBlock::NoMaster);
        blocks.global.insert(ClusterBlock::StateNotRecovered);
        Self {
            blocks,
            ..Self::default()
        }
    }

    pub fn has_global_block(&self, block: ClusterBlock) -> bool {
        self.blocks.global.contains(&block)
    }

    /// The no-quorum reset: routing table and metadata emptied, nodes
    /// reduced to the local node, blocks raised. The version is kept so a
    /// later master publish is not mistaken for a stale one.
    pub fn cleared(&self, local: NodeInfo) -> Self {
        let mut blocks = self.blocks.clone();
        blocks.global.insert(ClusterBlock::NoMaster);
        blocks.global.insert(ClusterBlock::StateNotRecovered);
        Self {
            version: self.version,
            master_node_id: None,
            nodes: DiscoveryNodes::only(local),
            routing_table: RoutingTable::default(),
            metadata: MetaData::default(),
            blocks,
        }
    }

    /// Rebuild an incoming published state against the current local one,
    /// keeping every part whose version did not change.
    pub fn reuse_unchanged_parts(
        incoming: ClusterState,
        current: &ClusterState,
        local: &NodeId,
    ) -> ClusterState {
        let routing_table = if incoming.routing_table.version == current.routing_table.version {
            current.routing_table.clone()
        } else {
            incoming.routing_table
        };

        let metadata = if incoming.metadata.version == current.metadata.version {
            current.metadata.clone()
        } else {
            let indices = incoming
                .metadata
                .indices
                .into_iter()
                .map(|(name, index_md)| {
                    match current.metadata.indices.get(&name) {
                        Some(cur) if cur.version == index_md.version => (name, cur.clone()),
                        _ => (name, index_md),
                    }
                })
                .collect();
            MetaData {
                version: incoming.metadata.version,
                indices,
            }
        };

        let mut nodes = incoming.nodes;
        nodes.local_node_id = Some(local.clone());

        ClusterState {
            version: incoming.version,
            master_node_id: incoming.master_node_id,
            nodes,
            routing_table,
            metadata,
            blocks: incoming.blocks,
        }
    }
}
