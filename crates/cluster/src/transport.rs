//! Abstraction over node-to-node RPCs.
//!
//! A trait at the domain seam, with the TCP implementation in the `net`
//! crate; tests substitute mocks.

use quorumkv_common::{NodeInfo, Timestamp, VersionedValue};
use quorumkv_wire::ByteBuffer;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {0} failed: {1}")]
    Connect(String, String),
    #[error("RPC failed: {0}")]
    Rpc(String),
    #[error("peer answered with error: {0}")]
    Status(String),
}

/// Transport for peer RPCs: replication ops plus the gossip exchange.
///
/// Every call opens a fresh connection to the target; there is no pooling
/// between quorum attempts.
#[async_trait::async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Send a versioned write to a remote replica. The remote applies it
    /// conditionally but always acknowledges unless the connection broke.
    async fn internal_put(
        &self,
        target: &NodeInfo,
        key: &str,
        vv: &VersionedValue,
    ) -> Result<(), TransportError>;

    /// Fetch a key from a remote replica. `Ok(None)` means the replica
    /// answered and does not hold the key.
    async fn internal_get(
        &self,
        target: &NodeInfo,
        key: &str,
    ) -> Result<Option<VersionedValue>, TransportError>;

    /// Send a timestamped delete to a remote replica.
    async fn internal_delete(
        &self,
        target: &NodeInfo,
        key: &str,
        ts: Timestamp,
    ) -> Result<(), TransportError>;

    /// Send a gossip dump to `host:port` and return the peer's reply
    /// payload (its own dump, op byte included).
    async fn exchange_gossip(
        &self,
        host: &str,
        port: u16,
        message: ByteBuffer,
    ) -> Result<ByteBuffer, TransportError>;
}
