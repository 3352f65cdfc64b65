//! Default configuration constants shared across the cluster.

use std::time::Duration;

// -- Cluster ----------------------------------------------------------------

/// N: number of replicas per key.
pub const REPLICATION_FACTOR: usize = 3;
/// R: minimum responses for a read quorum.
pub const READ_QUORUM: usize = 2;
/// W: minimum acks for a write quorum.
pub const WRITE_QUORUM: usize = 2;
/// Virtual-node entries per physical node on the hash ring.
pub const VIRTUAL_NODES_PER_NODE: usize = 150;

// -- Networking -------------------------------------------------------------

pub const PORT: u16 = 7000;
/// Concurrent connections served at once by one node.
pub const WORKER_POOL_SIZE: usize = 8;
/// Hard cap on a single framed message.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
/// Dial timeout; also bounds each replica RPC during a quorum attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// -- Storage ----------------------------------------------------------------

pub const DATA_DIR: &str = "/tmp/kvstore";
pub const WAL_FILE_NAME: &str = "wal.log";

// -- Gossip / membership ----------------------------------------------------

pub const GOSSIP_INTERVAL: Duration = Duration::from_millis(1000);
pub const FAILURE_TIMEOUT_MS: u64 = 5000;
/// Peers contacted per gossip round.
pub const GOSSIP_FANOUT: usize = 2;
