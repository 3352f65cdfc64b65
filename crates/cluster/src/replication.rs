//! Quorum replication: fans PUT/GET/DELETE out to the N replicas owning a
//! key, waits for W acks (writes) or R responses (reads), and pushes the
//! winning version to stale replicas after a read.
//!
//! With `R + W > N` the read and write quorums overlap, so every successful
//! read observes the latest successful write.

use crate::membership::Membership;
use crate::transport::PeerTransport;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use quorumkv_common::defaults;
use quorumkv_common::{now_ms, NodeInfo, VersionedValue};
use quorumkv_ring::{HashRing, RingError};
use quorumkv_storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct QuorumConfig {
    /// Replication factor (N).
    pub n: usize,
    /// Read quorum (R).
    pub r: usize,
    /// Write quorum (W).
    pub w: usize,
    /// Bound on each individual replica RPC. All replica tasks are still
    /// awaited before the quorum decision; this only caps how long a hung
    /// peer can hold one of them open.
    pub rpc_timeout: Duration,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            n: defaults::REPLICATION_FACTOR,
            r: defaults::READ_QUORUM,
            w: defaults::WRITE_QUORUM,
            rpc_timeout: defaults::CONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("No nodes available")]
    NoNodes,
    #[error("Quorum not reached: {acks}/{needed} acks")]
    WriteQuorum { acks: usize, needed: usize },
    #[error("Read quorum not reached: {responses}/{needed}")]
    ReadQuorum { responses: usize, needed: usize },
    #[error(transparent)]
    Ring(#[from] RingError),
}

/// Coordinates quorum operations for one node.
///
/// Generic over `T: PeerTransport` so tests can substitute a mock for the
/// TCP client.
pub struct ReplicationManager<T: PeerTransport> {
    self_id: String,
    storage: Arc<StorageEngine>,
    ring: Arc<HashRing>,
    membership: Arc<Membership>,
    transport: Arc<T>,
    config: QuorumConfig,
}

impl<T: PeerTransport> std::fmt::Debug for ReplicationManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationManager")
            .field("self_id", &self.self_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct ReadResponse {
    node_id: String,
    value: Option<VersionedValue>,
}

impl<T: PeerTransport> ReplicationManager<T> {
    pub fn new(
        self_id: impl Into<String>,
        storage: Arc<StorageEngine>,
        ring: Arc<HashRing>,
        membership: Arc<Membership>,
        transport: Arc<T>,
        config: QuorumConfig,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            storage,
            ring,
            membership,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &QuorumConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // PUT
    // -----------------------------------------------------------------------

    /// Write `key=value` to the N replicas owning the key; succeeds once W
    /// replicas ack. Partial writes below quorum are not rolled back.
    pub async fn replicated_put(&self, key: &str, value: &str) -> Result<(), ReplicationError> {
        let ts = now_ms();
        let targets = self.ring.nodes(key, self.config.n)?;
        if targets.is_empty() {
            return Err(ReplicationError::NoNodes);
        }

        let vv = VersionedValue::new(value, ts, &self.self_id);
        let mut tasks = FuturesUnordered::new();

        for node_id in targets {
            if node_id == self.self_id {
                let storage = self.storage.clone();
                let key = key.to_string();
                let value = value.to_string();
                let origin = self.self_id.clone();
                tasks.push(tokio::spawn(async move {
                    storage.put(&key, &value, ts, &origin)
                }));
            } else {
                tasks.push(self.spawn_remote_put(&node_id, key, &vv));
            }
        }

        let mut acks = 0usize;
        while let Some(result) = tasks.next().await {
            if matches!(result, Ok(true)) {
                acks += 1;
            }
        }

        if acks >= self.config.w {
            Ok(())
        } else {
            quorumkv_metrics::metrics().quorum_failures.inc();
            tracing::warn!(key, acks, needed = self.config.w, "PUT quorum failed");
            Err(ReplicationError::WriteQuorum {
                acks,
                needed: self.config.w,
            })
        }
    }

    // -----------------------------------------------------------------------
    // DELETE
    // -----------------------------------------------------------------------

    /// Delete `key` on the N replicas owning it; succeeds once W ack.
    pub async fn replicated_delete(&self, key: &str) -> Result<(), ReplicationError> {
        let ts = now_ms();
        let targets = self.ring.nodes(key, self.config.n)?;
        if targets.is_empty() {
            return Err(ReplicationError::NoNodes);
        }

        let mut tasks = FuturesUnordered::new();

        for node_id in targets {
            if node_id == self.self_id {
                let storage = self.storage.clone();
                let key = key.to_string();
                tasks.push(tokio::spawn(async move { storage.delete(&key, ts) }));
            } else {
                let Some(target) = self.reachable_member(&node_id) else {
                    tasks.push(tokio::spawn(async { false }));
                    continue;
                };
                let transport = self.transport.clone();
                let key = key.to_string();
                let timeout = self.config.rpc_timeout;
                tasks.push(tokio::spawn(async move {
                    matches!(
                        tokio::time::timeout(timeout, transport.internal_delete(&target, &key, ts))
                            .await,
                        Ok(Ok(()))
                    )
                }));
            }
        }

        let mut acks = 0usize;
        while let Some(result) = tasks.next().await {
            if matches!(result, Ok(true)) {
                acks += 1;
            }
        }

        if acks >= self.config.w {
            Ok(())
        } else {
            quorumkv_metrics::metrics().quorum_failures.inc();
            tracing::warn!(key, acks, needed = self.config.w, "DELETE quorum failed");
            Err(ReplicationError::WriteQuorum {
                acks,
                needed: self.config.w,
            })
        }
    }

    // -----------------------------------------------------------------------
    // GET
    // -----------------------------------------------------------------------

    /// Read `key` from the N replicas owning it. Needs R responses; among
    /// them the value with the largest timestamp wins. `Ok(None)` means the
    /// quorum answered and nobody holds the key.
    pub async fn replicated_get(
        &self,
        key: &str,
    ) -> Result<Option<VersionedValue>, ReplicationError> {
        let targets = self.ring.nodes(key, self.config.n)?;
        if targets.is_empty() {
            return Err(ReplicationError::NoNodes);
        }

        let mut tasks = FuturesUnordered::new();

        for node_id in targets {
            if node_id == self.self_id {
                let storage = self.storage.clone();
                let key = key.to_string();
                let self_id = self.self_id.clone();
                tasks.push(tokio::spawn(async move {
                    Some(ReadResponse {
                        node_id: self_id,
                        value: storage.get(&key),
                    })
                }));
            } else {
                let Some(target) = self.reachable_member(&node_id) else {
                    tasks.push(tokio::spawn(async { None }));
                    continue;
                };
                let transport = self.transport.clone();
                let key = key.to_string();
                let timeout = self.config.rpc_timeout;
                tasks.push(tokio::spawn(async move {
                    match tokio::time::timeout(timeout, transport.internal_get(&target, &key)).await
                    {
                        Ok(Ok(value)) => Some(ReadResponse {
                            node_id: target.node_id,
                            value,
                        }),
                        _ => None,
                    }
                }));
            }
        }

        let mut responses: Vec<ReadResponse> = Vec::new();
        while let Some(result) = tasks.next().await {
            if let Ok(Some(resp)) = result {
                responses.push(resp);
            }
        }

        if responses.len() < self.config.r {
            quorumkv_metrics::metrics().quorum_failures.inc();
            return Err(ReplicationError::ReadQuorum {
                responses: responses.len(),
                needed: self.config.r,
            });
        }

        // Last writer wins across the quorum.
        let latest = responses
            .iter()
            .filter_map(|r| r.value.as_ref())
            .max_by_key(|vv| vv.timestamp)
            .cloned();

        if let Some(ref winner) = latest {
            self.repair_stale_replicas(key, winner, &responses);
        }

        Ok(latest)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    /// Look up a peer and require it to be alive; a missing or dead peer is
    /// an immediate replica failure.
    fn reachable_member(&self, node_id: &str) -> Option<NodeInfo> {
        self.membership.member(node_id).filter(|m| m.is_alive)
    }

    fn spawn_remote_put(
        &self,
        node_id: &str,
        key: &str,
        vv: &VersionedValue,
    ) -> tokio::task::JoinHandle<bool> {
        let Some(target) = self.reachable_member(node_id) else {
            return tokio::spawn(async { false });
        };
        let transport = self.transport.clone();
        let key = key.to_string();
        let vv = vv.clone();
        let timeout = self.config.rpc_timeout;
        tokio::spawn(async move {
            matches!(
                tokio::time::timeout(timeout, transport.internal_put(&target, &key, &vv)).await,
                Ok(Ok(()))
            )
        })
    }

    /// Fire-and-forget read repair: push the winning version to every
    /// replica that answered with an older value or none at all.
    fn repair_stale_replicas(&self, key: &str, winner: &VersionedValue, responses: &[ReadResponse]) {
        for resp in responses {
            let stale = match &resp.value {
                None => true,
                Some(vv) => vv.timestamp < winner.timestamp,
            };
            if !stale {
                continue;
            }

            quorumkv_metrics::metrics().read_repairs.inc();
            if resp.node_id == self.self_id {
                self.storage.conditional_put(key, winner);
            } else if let Some(target) = self.reachable_member(&resp.node_id) {
                let transport = self.transport.clone();
                let key = key.to_string();
                let winner = winner.clone();
                tokio::spawn(async move {
                    if let Err(e) = transport.internal_put(&target, &key, &winner).await {
                        tracing::debug!(peer = %target.node_id, %key, "read repair failed: {e}");
                    }
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
