//! TCP client side: the [`PeerClient`] transport used for inter-node RPCs
//! and gossip, plus the persistent [`KvClient`] used to talk to a node as a
//! client.

use quorumkv_cluster::{PeerTransport, TransportError};
use quorumkv_common::defaults::CONNECT_TIMEOUT;
use quorumkv_common::{NodeInfo, OpType, StatusCode, Timestamp, VersionedValue};
use quorumkv_wire::{read_frame, request, write_frame, ByteBuffer};
use tokio::net::TcpStream;

/// Dial with the connect timeout and low-latency socket options applied.
async fn dial(addr: &str) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Connect(addr.to_string(), "connect timed out".into()))?
        .map_err(|e| TransportError::Connect(addr.to_string(), e.to_string()))?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(addr, "set_nodelay failed: {e}");
    }
    Ok(stream)
}

async fn round_trip(stream: &mut TcpStream, req: &ByteBuffer) -> Result<ByteBuffer, TransportError> {
    write_frame(stream, req)
        .await
        .map_err(|e| TransportError::Rpc(e.to_string()))?;
    match read_frame(stream).await {
        Ok(Some(resp)) => Ok(resp),
        Ok(None) => Err(TransportError::Rpc("connection closed by peer".into())),
        Err(e) => Err(TransportError::Rpc(e.to_string())),
    }
}

fn read_status(resp: &mut ByteBuffer) -> Result<StatusCode, TransportError> {
    let byte = resp
        .read_u8()
        .map_err(|e| TransportError::Rpc(e.to_string()))?;
    StatusCode::try_from(byte).map_err(|e| TransportError::Rpc(e.to_string()))
}

fn read_versioned_value(resp: &mut ByteBuffer) -> Result<VersionedValue, TransportError> {
    let value = resp
        .read_string()
        .map_err(|e| TransportError::Rpc(e.to_string()))?;
    let timestamp = resp
        .read_u64()
        .map_err(|e| TransportError::Rpc(e.to_string()))?;
    let origin_node = resp
        .read_string()
        .map_err(|e| TransportError::Rpc(e.to_string()))?;
    Ok(VersionedValue {
        value,
        timestamp,
        origin_node,
    })
}

fn read_error_message(resp: &mut ByteBuffer) -> String {
    resp.read_string()
        .unwrap_or_else(|_| "malformed error response".to_string())
}

// ---------------------------------------------------------------------------
// PeerClient: one fresh connection per RPC
// ---------------------------------------------------------------------------

/// Inter-node transport. Every RPC dials the target anew; there is no
/// connection reuse between quorum attempts.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeerClient;

impl PeerClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl PeerTransport for PeerClient {
    async fn internal_put(
        &self,
        target: &NodeInfo,
        key: &str,
        vv: &VersionedValue,
    ) -> Result<(), TransportError> {
        quorumkv_metrics::metrics().replica_rpcs_sent.inc();
        let mut req = request(OpType::InternalPut);
        req.write_string(key);
        req.write_string(&vv.value);
        req.write_u64(vv.timestamp);
        req.write_string(&vv.origin_node);

        let mut stream = dial(&target.address()).await?;
        let mut resp = round_trip(&mut stream, &req).await?;
        match read_status(&mut resp)? {
            StatusCode::Ok => Ok(()),
            StatusCode::NotFound => Err(TransportError::Rpc("unexpected NOT_FOUND".into())),
            StatusCode::Error => Err(TransportError::Status(read_error_message(&mut resp))),
        }
    }

    async fn internal_get(
        &self,
        target: &NodeInfo,
        key: &str,
    ) -> Result<Option<VersionedValue>, TransportError> {
        quorumkv_metrics::metrics().replica_rpcs_sent.inc();
        let mut req = request(OpType::InternalGet);
        req.write_string(key);

        let mut stream = dial(&target.address()).await?;
        let mut resp = round_trip(&mut stream, &req).await?;
        match read_status(&mut resp)? {
            StatusCode::Ok => Ok(Some(read_versioned_value(&mut resp)?)),
            StatusCode::NotFound => Ok(None),
            StatusCode::Error => Err(TransportError::Status(read_error_message(&mut resp))),
        }
    }

    async fn internal_delete(
        &self,
        target: &NodeInfo,
        key: &str,
        ts: Timestamp,
    ) -> Result<(), TransportError> {
        quorumkv_metrics::metrics().replica_rpcs_sent.inc();
        let mut req = request(OpType::InternalDelete);
        req.write_string(key);
        req.write_u64(ts);

        let mut stream = dial(&target.address()).await?;
        let mut resp = round_trip(&mut stream, &req).await?;
        match read_status(&mut resp)? {
            StatusCode::Ok => Ok(()),
            StatusCode::NotFound => Ok(()),
            StatusCode::Error => Err(TransportError::Status(read_error_message(&mut resp))),
        }
    }

    async fn exchange_gossip(
        &self,
        host: &str,
        port: u16,
        message: ByteBuffer,
    ) -> Result<ByteBuffer, TransportError> {
        let addr = format!("{host}:{port}");
        let mut stream = dial(&addr).await?;
        round_trip(&mut stream, &message).await
    }
}

// ---------------------------------------------------------------------------
// KvClient: persistent client connection
// ---------------------------------------------------------------------------

/// A summary row from a `CLUSTER_INFO` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSummary {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub is_alive: bool,
}

#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub members: Vec<MemberSummary>,
    /// Live keys in the answering node's local store.
    pub local_size: u64,
}

/// Persistent, pipelined client connection to one node. Many sequential
/// requests can flow over the same socket.
#[derive(Debug)]
pub struct KvClient {
    stream: TcpStream,
}

impl KvClient {
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = dial(addr).await?;
        Ok(Self { stream })
    }

    pub async fn put(&mut self, key: &str, value: &str) -> Result<(), TransportError> {
        let mut req = request(OpType::Put);
        req.write_string(key);
        req.write_string(value);

        let mut resp = round_trip(&mut self.stream, &req).await?;
        match read_status(&mut resp)? {
            StatusCode::Ok => Ok(()),
            StatusCode::NotFound => Err(TransportError::Rpc("unexpected NOT_FOUND".into())),
            StatusCode::Error => Err(TransportError::Status(read_error_message(&mut resp))),
        }
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<VersionedValue>, TransportError> {
        let mut req = request(OpType::Get);
        req.write_string(key);

        let mut resp = round_trip(&mut self.stream, &req).await?;
        match read_status(&mut resp)? {
            StatusCode::Ok => Ok(Some(read_versioned_value(&mut resp)?)),
            StatusCode::NotFound => Ok(None),
            StatusCode::Error => Err(TransportError::Status(read_error_message(&mut resp))),
        }
    }

    pub async fn delete(&mut self, key: &str) -> Result<(), TransportError> {
        let mut req = request(OpType::Delete);
        req.write_string(key);

        let mut resp = round_trip(&mut self.stream, &req).await?;
        match read_status(&mut resp)? {
            StatusCode::Ok => Ok(()),
            StatusCode::NotFound => Err(TransportError::Rpc("unexpected NOT_FOUND".into())),
            StatusCode::Error => Err(TransportError::Status(read_error_message(&mut resp))),
        }
    }

    pub async fn cluster_info(&mut self) -> Result<ClusterInfo, TransportError> {
        let req = request(OpType::ClusterInfo);
        let mut resp = round_trip(&mut self.stream, &req).await?;
        match read_status(&mut resp)? {
            StatusCode::Ok => {}
            StatusCode::NotFound => return Err(TransportError::Rpc("unexpected NOT_FOUND".into())),
            StatusCode::Error => {
                return Err(TransportError::Status(read_error_message(&mut resp)))
            }
        }

        let rpc_err = |e: quorumkv_wire::WireError| TransportError::Rpc(e.to_string());
        let count = resp.read_u32().map_err(rpc_err)?;
        let mut members = Vec::with_capacity(count as usize);
        for _ in 0..count {
            members.push(MemberSummary {
                node_id: resp.read_string().map_err(rpc_err)?,
                host: resp.read_string().map_err(rpc_err)?,
                port: resp.read_u16().map_err(rpc_err)?,
                is_alive: resp.read_bool().map_err(rpc_err)?,
            });
        }
        let local_size = resp.read_u64().map_err(rpc_err)?;
        Ok(ClusterInfo {
            members,
            local_size,
        })
    }

    /// Send a pre-built request payload and return the raw response.
    pub async fn send_raw(&mut self, req: &ByteBuffer) -> Result<ByteBuffer, TransportError> {
        round_trip(&mut self.stream, req).await
    }
}
