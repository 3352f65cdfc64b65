//! Request dispatch: inspects the op byte of each decoded payload and routes
//! client ops through the quorum path, peer ops straight to local storage,
//! and cluster ops to membership.

use quorumkv_cluster::{Membership, PeerTransport, ReplicationManager};
use quorumkv_common::{OpType, VersionedValue};
use quorumkv_storage::StorageEngine;
use quorumkv_wire::{
    error_response, not_found_response, ok_response, value_response, ByteBuffer, WireError,
};
use std::sync::Arc;

pub struct Coordinator<T: PeerTransport> {
    storage: Arc<StorageEngine>,
    membership: Arc<Membership>,
    replication: ReplicationManager<T>,
}

impl<T: PeerTransport> std::fmt::Debug for Coordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").finish_non_exhaustive()
    }
}

impl<T: PeerTransport> Coordinator<T> {
    pub fn new(
        storage: Arc<StorageEngine>,
        membership: Arc<Membership>,
        replication: ReplicationManager<T>,
    ) -> Self {
        Self {
            storage,
            membership,
            replication,
        }
    }

    /// Handle one decoded request payload and produce the response payload.
    ///
    /// A malformed buffer aborts only this request; the connection survives
    /// as long as the framing stayed intact.
    pub async fn handle_request(&self, mut req: ByteBuffer) -> ByteBuffer {
        let op_byte = match req.read_u8() {
            Ok(b) => b,
            Err(e) => return error_response(&format!("Internal error: {e}")),
        };
        let op = match OpType::try_from(op_byte) {
            Ok(op) => op,
            Err(_) => return error_response("Unknown operation"),
        };

        let result = match op {
            // Client-facing: quorum path.
            OpType::Put => self.handle_put(&mut req).await,
            OpType::Get => self.handle_get(&mut req).await,
            OpType::Delete => self.handle_delete(&mut req).await,

            // Peer-facing: local storage, no quorum.
            OpType::InternalPut => self.handle_internal_put(&mut req),
            OpType::InternalGet => self.handle_internal_get(&mut req),
            OpType::InternalDelete => self.handle_internal_delete(&mut req),

            // Cluster.
            OpType::ClusterInfo => Ok(self.handle_cluster_info()),
            OpType::Gossip => self.handle_gossip(&mut req),
        };

        result.unwrap_or_else(|e| {
            tracing::error!("failed to handle {op:?} request: {e}");
            error_response(&format!("Internal error: {e}"))
        })
    }

    // -----------------------------------------------------------------------
    // Client-facing handlers
    // -----------------------------------------------------------------------

    async fn handle_put(&self, req: &mut ByteBuffer) -> Result<ByteBuffer, WireError> {
        quorumkv_metrics::metrics().kv_puts.inc();
        let _timer = quorumkv_metrics::start_op_timer("put");
        let key = req.read_string()?;
        let value = req.read_string()?;
        tracing::debug!(%key, value_size = value.len(), "PUT");

        Ok(match self.replication.replicated_put(&key, &value).await {
            Ok(()) => ok_response(),
            Err(e) => error_response(&e.to_string()),
        })
    }

    async fn handle_get(&self, req: &mut ByteBuffer) -> Result<ByteBuffer, WireError> {
        quorumkv_metrics::metrics().kv_gets.inc();
        let _timer = quorumkv_metrics::start_op_timer("get");
        let key = req.read_string()?;
        tracing::debug!(%key, "GET");

        Ok(match self.replication.replicated_get(&key).await {
            Ok(Some(vv)) => value_response(&vv),
            Ok(None) => not_found_response(),
            Err(e) => error_response(&e.to_string()),
        })
    }

    async fn handle_delete(&self, req: &mut ByteBuffer) -> Result<ByteBuffer, WireError> {
        quorumkv_metrics::metrics().kv_deletes.inc();
        let _timer = quorumkv_metrics::start_op_timer("delete");
        let key = req.read_string()?;
        tracing::debug!(%key, "DELETE");

        Ok(match self.replication.replicated_delete(&key).await {
            Ok(()) => ok_response(),
            Err(e) => error_response(&e.to_string()),
        })
    }

    // -----------------------------------------------------------------------
    // Peer-facing handlers
    // -----------------------------------------------------------------------

    fn handle_internal_put(&self, req: &mut ByteBuffer) -> Result<ByteBuffer, WireError> {
        quorumkv_metrics::metrics().replica_rpcs_received.inc();
        let key = req.read_string()?;
        let value = req.read_string()?;
        let timestamp = req.read_u64()?;
        let origin_node = req.read_string()?;

        let vv = VersionedValue {
            value,
            timestamp,
            origin_node,
        };
        // A stale outcome is not surfaced; the coordinator's timestamp
        // ordering already decided the winner.
        self.storage.conditional_put(&key, &vv);
        Ok(ok_response())
    }

    fn handle_internal_get(&self, req: &mut ByteBuffer) -> Result<ByteBuffer, WireError> {
        quorumkv_metrics::metrics().replica_rpcs_received.inc();
        let key = req.read_string()?;
        Ok(match self.storage.get(&key) {
            Some(vv) => value_response(&vv),
            None => not_found_response(),
        })
    }

    fn handle_internal_delete(&self, req: &mut ByteBuffer) -> Result<ByteBuffer, WireError> {
        quorumkv_metrics::metrics().replica_rpcs_received.inc();
        let key = req.read_string()?;
        let ts = req.read_u64()?;
        self.storage.delete(&key, ts);
        Ok(ok_response())
    }

    // -----------------------------------------------------------------------
    // Cluster handlers
    // -----------------------------------------------------------------------

    fn handle_cluster_info(&self) -> ByteBuffer {
        let members = self.membership.all_members();

        let mut buf = ok_response();
        buf.write_u32(members.len() as u32);
        for m in &members {
            buf.write_string(&m.node_id);
            buf.write_string(&m.host);
            buf.write_u16(m.port);
            buf.write_bool(m.is_alive);
        }
        buf.write_u64(self.storage.size() as u64);
        buf
    }

    fn handle_gossip(&self, req: &mut ByteBuffer) -> Result<ByteBuffer, WireError> {
        self.membership.handle_gossip_message(req)?;
        // Respond with our own gossip state.
        Ok(self.membership.create_gossip_message())
    }
}
