//! State Management Module
//!
//! The cluster-state snapshot model, the host-side store contract with
//! its single-writer prioritized queue, and the snapshot codec.

mod snapshot;
mod store;
mod codec;

pub use snapshot::{
    Blocks, ClusterBlock, ClusterState, DiscoveryNodes, IndexMetaData, IndexRouting, MetaData,
    NodeInfo, RoutingTable,
};
pub use store::{ClusterStateStore, Priority, QueuedStateStore, SubmitUpdate, Transition, UpdateFn};
pub use codec::{BincodeStateCodec, StateCodec};
