//! Gossip-based cluster membership and failure detection.
//!
//! Each node periodically pushes a full dump of its member table to a few
//! random alive peers. A peer whose heartbeat has not been refreshed within
//! the failure timeout is marked dead and the `on_leave` callback fires;
//! a newly learned (or revived) peer fires `on_join`. The callbacks drive
//! hash-ring updates without the ring knowing about membership.

use crate::transport::PeerTransport;
use parking_lot::RwLock;
use quorumkv_common::defaults;
use quorumkv_common::{now_ms, NodeInfo, OpType, Timestamp};
use quorumkv_wire::{ByteBuffer, WireError};
use rand::seq::SliceRandom;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub type OnJoin = Box<dyn Fn(&NodeInfo) + Send + Sync>;
pub type OnLeave = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Period of both the gossip and failure-detector loops.
    pub gossip_interval: Duration,
    /// Heartbeat age beyond which an alive peer is declared dead.
    pub failure_timeout_ms: u64,
    /// Alive peers contacted per gossip round.
    pub fanout: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            gossip_interval: defaults::GOSSIP_INTERVAL,
            failure_timeout_ms: defaults::FAILURE_TIMEOUT_MS,
            fanout: defaults::GOSSIP_FANOUT,
        }
    }
}

/// Each node's view of the cluster.
///
/// The member table is guarded by a reader-writer lock; callbacks are
/// invoked after the lock is released.
pub struct Membership {
    self_id: String,
    members: RwLock<HashMap<String, NodeInfo>>,
    seeds: Vec<(String, u16)>,
    config: MembershipConfig,
    on_join: RwLock<Option<OnJoin>>,
    on_leave: RwLock<Option<OnLeave>>,
}

impl std::fmt::Debug for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Membership")
            .field("self_id", &self.self_id)
            .field("members", &self.members.read().len())
            .finish_non_exhaustive()
    }
}

impl Membership {
    pub fn new(mut self_info: NodeInfo, seeds: Vec<(String, u16)>, config: MembershipConfig) -> Self {
        self_info.is_alive = true;
        self_info.last_heartbeat = now_ms();
        let self_id = self_info.node_id.clone();

        let mut members = HashMap::new();
        members.insert(self_id.clone(), self_info);

        Self {
            self_id,
            members: RwLock::new(members),
            seeds,
            config,
            on_join: RwLock::new(None),
            on_leave: RwLock::new(None),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn set_on_join(&self, cb: OnJoin) {
        *self.on_join.write() = Some(cb);
    }

    pub fn set_on_leave(&self, cb: OnLeave) {
        *self.on_leave.write() = Some(cb);
    }

    // -----------------------------------------------------------------------
    // Member table
    // -----------------------------------------------------------------------

    /// Merge one observed peer record into the table.
    ///
    /// Unknown peers are inserted; known peers adopt a strictly newer
    /// heartbeat. A dead peer whose newer record says alive is revived,
    /// which counts as a join.
    pub fn add_member(&self, node: NodeInfo) {
        let mut joined = false;
        {
            let mut members = self.members.write();
            match members.entry(node.node_id.clone()) {
                Entry::Vacant(slot) => {
                    joined = node.is_alive;
                    slot.insert(node.clone());
                }
                Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    if node.last_heartbeat > existing.last_heartbeat {
                        existing.last_heartbeat = node.last_heartbeat;
                        if !existing.is_alive && node.is_alive {
                            existing.is_alive = true;
                            joined = true;
                        }
                    }
                }
            }
        }
        if joined {
            tracing::info!(
                node_id = %node.node_id,
                addr = %node.address(),
                "membership: node joined"
            );
            if let Some(cb) = self.on_join.read().as_ref() {
                cb(&node);
            }
        }
    }

    /// Mark a peer dead and fire `on_leave`. Self is never marked dead.
    pub fn mark_dead(&self, node_id: &str) {
        if node_id == self.self_id {
            return;
        }
        {
            let mut members = self.members.write();
            match members.get_mut(node_id) {
                Some(info) => info.is_alive = false,
                None => return,
            }
        }
        tracing::warn!(node_id, "membership: node marked dead");
        if let Some(cb) = self.on_leave.read().as_ref() {
            cb(node_id);
        }
    }

    pub fn alive_members(&self) -> Vec<NodeInfo> {
        self.members
            .read()
            .values()
            .filter(|m| m.is_alive)
            .cloned()
            .collect()
    }

    pub fn all_members(&self) -> Vec<NodeInfo> {
        self.members.read().values().cloned().collect()
    }

    pub fn member(&self, node_id: &str) -> Option<NodeInfo> {
        self.members.read().get(node_id).cloned()
    }

    /// Refresh our own heartbeat to the current wall clock.
    pub fn refresh_self_heartbeat(&self) {
        let mut members = self.members.write();
        if let Some(me) = members.get_mut(&self.self_id) {
            me.last_heartbeat = now_ms();
        }
    }

    /// One failure-detector sweep: mark every alive peer whose heartbeat is
    /// older than the timeout. Returns the ids that transitioned.
    pub fn detect_failures(&self, now: Timestamp) -> Vec<String> {
        let expired: Vec<String> = {
            let members = self.members.read();
            members
                .values()
                .filter(|m| {
                    m.node_id != self.self_id
                        && m.is_alive
                        && now.saturating_sub(m.last_heartbeat) > self.config.failure_timeout_ms
                })
                .map(|m| m.node_id.clone())
                .collect()
        };
        for id in &expired {
            self.mark_dead(id);
        }
        expired
    }

    // -----------------------------------------------------------------------
    // Gossip payload
    // -----------------------------------------------------------------------

    /// Full dump of the member table, preceded by the gossip op byte.
    pub fn create_gossip_message(&self) -> ByteBuffer {
        let mut buf = ByteBuffer::new();
        buf.write_u8(OpType::Gossip as u8);

        let members = self.members.read();
        buf.write_u32(members.len() as u32);
        for info in members.values() {
            buf.write_string(&info.node_id);
            buf.write_string(&info.host);
            buf.write_u16(info.port);
            buf.write_u64(info.last_heartbeat);
            buf.write_bool(info.is_alive);
        }
        buf
    }

    /// Merge an incoming gossip dump. The buffer is positioned after the op
    /// byte; entries naming ourselves are skipped.
    pub fn handle_gossip_message(&self, msg: &mut ByteBuffer) -> Result<(), WireError> {
        let count = msg.read_u32()?;
        for _ in 0..count {
            let node_id = msg.read_string()?;
            let host = msg.read_string()?;
            let port = msg.read_u16()?;
            let last_heartbeat = msg.read_u64()?;
            let is_alive = msg.read_bool()?;

            if node_id == self.self_id {
                continue;
            }
            self.add_member(NodeInfo {
                node_id,
                host,
                port,
                is_alive,
                last_heartbeat,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    /// Spawn the gossip and failure-detector loops. Both exit when the
    /// shutdown flag flips.
    pub fn start<T: PeerTransport>(
        self: &Arc<Self>,
        transport: Arc<T>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        tracing::info!("membership: starting gossip and failure detection");

        let gossip = {
            let membership = Arc::clone(self);
            let transport = Arc::clone(&transport);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                membership.contact_seeds(transport.as_ref()).await;
                let mut ticker = tokio::time::interval(membership.config.gossip_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.changed() => break,
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                    membership.run_gossip_round(transport.as_ref()).await;
                }
                tracing::debug!("gossip loop stopped");
            })
        };

        let failure = {
            let membership = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(membership.config.gossip_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.changed() => break,
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                    membership.detect_failures(now_ms());
                }
                tracing::debug!("failure detector stopped");
            })
        };

        vec![gossip, failure]
    }

    /// One gossip round: refresh our heartbeat, then push a full dump to a
    /// random fanout of alive peers. Replies and failures are discarded.
    pub async fn run_gossip_round<T: PeerTransport + ?Sized>(&self, transport: &T) {
        self.refresh_self_heartbeat();

        let mut peers: Vec<NodeInfo> = self
            .alive_members()
            .into_iter()
            .filter(|m| m.node_id != self.self_id)
            .collect();
        if peers.is_empty() {
            return;
        }
        peers.shuffle(&mut rand::thread_rng());

        let message = self.create_gossip_message();
        quorumkv_metrics::metrics().gossip_rounds.inc();

        for peer in peers.iter().take(self.config.fanout) {
            match transport
                .exchange_gossip(&peer.host, peer.port, message.clone())
                .await
            {
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(peer = %peer.node_id, "gossip failed: {e}");
                }
            }
        }
    }

    /// Bootstrap: push one dump to every configured seed address. Seeds are
    /// plain dial addresses and gain no special role afterwards.
    async fn contact_seeds<T: PeerTransport + ?Sized>(&self, transport: &T) {
        for (host, port) in &self.seeds {
            let message = self.create_gossip_message();
            match transport.exchange_gossip(host, *port, message).await {
                Ok(_) => {
                    tracing::info!(seed = %format!("{host}:{port}"), "membership: contacted seed");
                }
                Err(e) => {
                    tracing::warn!(seed = %format!("{host}:{port}"), "seed unreachable: {e}");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
