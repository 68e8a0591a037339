//! Discovery Wire Protocol
//!
//! Defines the messages exchanged between nodes: master publishes and
//! their acknowledgements, the distributed ping protocol used for
//! partition evaluation, and the probe primitive underneath it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::PublishError;
use crate::membership::{Address, NodeId};
use crate::transport::Endpoint;

/// Protocol messages for node communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    // ========== State Publication ==========
    /// Encoded cluster-state snapshot pushed by the master
    FollowerPublish {
        version: u64,
        bytes: Bytes,
    },

    /// Follower acknowledgement of a publish.
    ///
    /// `version` routes the ack back to the in-flight publish it answers.
    PublishAck {
        version: u64,
        node: NodeId,
        error: Option<PublishError>,
    },

    /// A follower that regained quorum asks the master for a snapshot
    PleasePublish {
        requester: Address,
    },

    // ========== Distributed Ping ==========
    /// Ask a voter's pinger to probe `target` on the requester's behalf
    PingRequest {
        req_id: u64,
        origin: Address,
        target: Address,
        timeout_ms: u64,
    },

    /// The voter's probe completed
    PingOk {
        req_id: u64,
        voter: Address,
    },

    /// The voter's own probe timer expired.
    ///
    /// Always sent affirmatively; silence is never a timeout vote.
    PingTimeout {
        req_id: u64,
        voter: Address,
    },

    // ========== Probes ==========
    /// Round-trip liveness check; also used as the voter identity probe
    Probe {
        probe_id: u64,
        origin: Address,
        reply_to: Endpoint,
    },

    /// Answer to a probe, delivered to the origin's `reply_to` endpoint
    ProbeReply {
        probe_id: u64,
    },
}

impl WireMessage {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::FollowerPublish { .. } => "FollowerPublish",
            WireMessage::PublishAck { .. } => "PublishAck",
            WireMessage::PleasePublish { .. } => "PleasePublish",
            WireMessage::PingRequest { .. } => "PingRequest",
            WireMessage::PingOk { .. } => "PingOk",
            WireMessage::PingTimeout { .. } => "PingTimeout",
            WireMessage::Probe { .. } => "Probe",
            WireMessage::ProbeReply { .. } => "ProbeReply",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}
