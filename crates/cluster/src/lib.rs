//! Cluster layer for quorumkv: gossip membership with failure detection,
//! and the quorum replication coordinator that fans client operations out
//! to N replicas.

pub mod membership;
pub mod replication;
pub mod transport;

pub use membership::{Membership, MembershipConfig};
pub use replication::{QuorumConfig, ReplicationError, ReplicationManager};
pub use transport::{PeerTransport, TransportError};
