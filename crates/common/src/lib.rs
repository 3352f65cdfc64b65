//! quorumkv-common: shared types for the quorumkv project.
//!
//! Provides the wall-clock [`Timestamp`], the cluster [`NodeInfo`] descriptor,
//! the [`VersionedValue`] stored for every key, and the wire-level op/status
//! codes shared by client and inter-node traffic.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod defaults;

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// Wall-clock milliseconds since the Unix epoch.
///
/// Used as the version for last-writer-wins reconciliation. Clock skew
/// between nodes is not corrected.
pub type Timestamp = u64;

/// Current wall-clock time as a [`Timestamp`].
pub fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

// ---------------------------------------------------------------------------
// NodeInfo
// ---------------------------------------------------------------------------

/// Metadata about a cluster node, as observed by the local member table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Cluster-unique identifier (e.g. "node1").
    pub node_id: String,
    /// Hostname or IP used to dial this node.
    pub host: String,
    /// Listening port.
    pub port: u16,
    /// Whether the failure detector currently considers this node alive.
    pub is_alive: bool,
    /// Largest heartbeat timestamp ever observed for this node.
    pub last_heartbeat: Timestamp,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            is_alive: true,
            last_heartbeat: 0,
        }
    }

    /// Dial address in `host:port` form.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.node_id, self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// VersionedValue
// ---------------------------------------------------------------------------

/// A value stored in the KV store, tagged with version info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: String,
    pub timestamp: Timestamp,
    /// Node that first wrote this value; carried through replication
    /// unchanged.
    pub origin_node: String,
}

impl VersionedValue {
    pub fn new(value: impl Into<String>, timestamp: Timestamp, origin: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            timestamp,
            origin_node: origin.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire op and status codes
// ---------------------------------------------------------------------------

/// Operation types for the wire protocol. A request payload begins with one
/// of these as a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpType {
    // Client operations
    Put = 1,
    Get = 2,
    Delete = 3,

    // Internal (inter-node) replication
    InternalPut = 10,
    InternalGet = 11,
    InternalDelete = 12,

    // Cluster administration
    ClusterInfo = 22,

    // Gossip protocol
    Gossip = 40,
}

impl TryFrom<u8> for OpType {
    type Error = UnknownCode;

    fn try_from(v: u8) -> Result<Self, UnknownCode> {
        Ok(match v {
            1 => Self::Put,
            2 => Self::Get,
            3 => Self::Delete,
            10 => Self::InternalPut,
            11 => Self::InternalGet,
            12 => Self::InternalDelete,
            22 => Self::ClusterInfo,
            40 => Self::Gossip,
            other => return Err(UnknownCode(other)),
        })
    }
}

/// Wire-level response status. A response payload begins with one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    NotFound = 1,
    Error = 2,
}

impl TryFrom<u8> for StatusCode {
    type Error = UnknownCode;

    fn try_from(v: u8) -> Result<Self, UnknownCode> {
        Ok(match v {
            0 => StatusCode::Ok,
            1 => StatusCode::NotFound,
            2 => StatusCode::Error,
            other => return Err(UnknownCode(other)),
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown wire code {0:#04x}")]
pub struct UnknownCode(pub u8);

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
