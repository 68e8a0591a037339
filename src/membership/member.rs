//! Cluster Membership Model
//!
//! Identity, address, role, and status types gossiped by the membership
//! substrate, plus the closed set of membership events.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque node identity, stable for the lifetime of a process.
///
/// Regenerated on every restart, so a downed node that comes back after a
/// restart joins as a brand-new member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a fresh process-lifetime identity
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing identity string
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport address of a member (host:port).
///
/// Two addresses are equal iff host and port are equal. Hosts are
/// lowercased at construction; name resolution to canonical form is the
/// embedding host's job and must happen before addresses are compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Parse `host[:port]`, falling back to `default_port` when the port
    /// is omitted.
    pub fn parse(s: &str, default_port: u16) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidAddress("empty address".into()));
        }
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| Error::InvalidAddress(s.to_string()))?;
                if host.is_empty() {
                    return Err(Error::InvalidAddress(s.to_string()));
                }
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(s, default_port)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once(':') {
            Some(_) => Self::parse(s, 0),
            None => Err(Error::InvalidAddress(format!("{s} (missing port)"))),
        }
    }
}

/// Roles a member carries, fixed at join
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roles {
    /// Eligible to run the master singleton
    pub master_eligible: bool,
    /// Seed member; participates in downing votes
    pub voter: bool,
}

/// Member status in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Handshaking with the cluster
    Joining,
    /// Full member
    Up,
    /// Announced a voluntary departure
    Leaving,
    /// Departure confirmed, about to be removed
    Exiting,
    /// Forcibly evicted; absorbing, a restart is required to rejoin
    Down,
    /// No longer a member
    Removed,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberStatus::Joining => write!(f, "JOINING"),
            MemberStatus::Up => write!(f, "UP"),
            MemberStatus::Leaving => write!(f, "LEAVING"),
            MemberStatus::Exiting => write!(f, "EXITING"),
            MemberStatus::Down => write!(f, "DOWN"),
            MemberStatus::Removed => write!(f, "REMOVED"),
        }
    }
}

/// A member record as seen through the substrate.
///
/// Owned by the substrate; everything else holds read-only copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub address: Address,
    pub node_id: NodeId,
    pub roles: Roles,
    pub status: MemberStatus,
    /// Monotonic sequence assigned at join; defines the "oldest" ordering
    pub join_seq: u64,
    /// When the member joined (diagnostics only, never used for ordering)
    pub joined_at: DateTime<Utc>,
}

impl Member {
    pub fn is_up(&self) -> bool {
        self.status == MemberStatus::Up
    }

    /// "Oldest" ordering: lower join sequence wins, address breaks ties
    pub fn is_older_than(&self, other: &Member) -> bool {
        (self.join_seq, &self.address) < (other.join_seq, &other.address)
    }
}

/// Membership and reachability events, delivered in order per subscriber.
///
/// Subscribing replays the current Up members as `MemberUp` before any
/// live event.
#[derive(Debug, Clone)]
pub enum MemberEvent {
    MemberUp(Member),
    MemberExited(Member),
    MemberRemoved(Member),
    Unreachable(Member),
    Reachable(Member),
}

impl MemberEvent {
    pub fn member(&self) -> &Member {
        match self {
            MemberEvent::MemberUp(m)
            | MemberEvent::MemberExited(m)
            | MemberEvent::MemberRemoved(m)
            | MemberEvent::Unreachable(m)
            | MemberEvent::Reachable(m) => m,
        }
    }

    /// Get the event type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            MemberEvent::MemberUp(_) => "MemberUp",
            MemberEvent::MemberExited(_) => "MemberExited",
            MemberEvent::MemberRemoved(_) => "MemberRemoved",
            MemberEvent::Unreachable(_) => "Unreachable",
            MemberEvent::Reachable(_) => "Reachable",
        }
    }
}
