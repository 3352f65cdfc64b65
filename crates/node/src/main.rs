//! quorumkv-node: entry point for a distributed KV store node.
//!
//! Recovers the local store from its WAL, wires the hash ring to membership
//! callbacks, starts the gossip and failure-detection loops, then serves
//! the binary protocol on the configured port until SIGINT/SIGTERM.

use clap::Parser;
use quorumkv_cluster::{Membership, MembershipConfig, QuorumConfig, ReplicationManager};
use quorumkv_common::{defaults, NodeInfo};
use quorumkv_net::{Coordinator, PeerClient};
use quorumkv_ring::HashRing;
use quorumkv_storage::StorageEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "quorumkv-node", version, about = "Distributed replicated key-value store node")]
struct Args {
    /// Unique node identifier
    #[arg(long = "node-id", default_value = "node1")]
    node_id: String,

    /// Listening port
    #[arg(long, default_value_t = defaults::PORT)]
    port: u16,

    /// Data directory; the WAL lives at <data-dir>/<node-id>/wal.log
    #[arg(long = "data-dir", default_value = defaults::DATA_DIR)]
    data_dir: PathBuf,

    /// Seed node address (host:port); repeatable
    #[arg(long = "seed", value_name = "HOST:PORT", value_parser = parse_seed)]
    seeds: Vec<(String, u16)>,

    /// Replication factor
    #[arg(long = "N", default_value_t = defaults::REPLICATION_FACTOR)]
    n: usize,

    /// Read quorum
    #[arg(long = "R", default_value_t = defaults::READ_QUORUM)]
    r: usize,

    /// Write quorum
    #[arg(long = "W", default_value_t = defaults::WRITE_QUORUM)]
    w: usize,

    /// Log level: debug|info|warn|error
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Serve Prometheus metrics on this port
    #[arg(long = "metrics-port")]
    metrics_port: Option<u16>,
}

fn parse_seed(s: &str) -> Result<(String, u16), String> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("invalid seed '{s}', expected host:port"))?;
    if host.is_empty() {
        return Err(format!("invalid seed '{s}', empty host"));
    }
    let port: u16 = port
        .parse()
        .map_err(|e| format!("invalid seed port in '{s}': {e}"))?;
    Ok((host.to_string(), port))
}

fn validate_quorum(args: &Args) -> Result<(), String> {
    if args.n == 0 {
        return Err("N must be > 0".into());
    }
    if args.r == 0 || args.r > args.n {
        return Err(format!("R ({}) must be in 1..=N ({})", args.r, args.n));
    }
    if args.w == 0 || args.w > args.n {
        return Err(format!("W ({}) must be in 1..=N ({})", args.w, args.n));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    quorumkv_metrics::init_tracing(&args.node_id, &args.log_level);
    tracing::info!(
        node_id = %args.node_id,
        port = args.port,
        data_dir = %args.data_dir.display(),
        n = args.n,
        r = args.r,
        w = args.w,
        seeds = args.seeds.len(),
        "node starting"
    );

    validate_quorum(&args)?;
    if args.r + args.w <= args.n {
        tracing::warn!(
            "R+W <= N: eventual consistency mode (strong consistency requires R+W > N)"
        );
    }

    // Storage, recovered from the WAL before anything is served.
    let node_data_dir = args.data_dir.join(&args.node_id);
    let storage = Arc::new(StorageEngine::open(&node_data_dir)?);
    storage.recover()?;

    // Hash ring, kept in sync with membership via callbacks.
    let ring = Arc::new(HashRing::new(defaults::VIRTUAL_NODES_PER_NODE));
    ring.add_node(&args.node_id);

    let membership = Arc::new(Membership::new(
        NodeInfo::new(&args.node_id, "0.0.0.0", args.port),
        args.seeds.clone(),
        MembershipConfig::default(),
    ));
    quorumkv_metrics::metrics().peers_alive.set(1);
    let ring_join = ring.clone();
    membership.set_on_join(Box::new(move |node| {
        ring_join.add_node(&node.node_id);
        quorumkv_metrics::metrics().peers_alive.inc();
    }));
    let ring_leave = ring.clone();
    membership.set_on_leave(Box::new(move |node_id| {
        ring_leave.remove_node(node_id);
        quorumkv_metrics::metrics().peers_alive.dec();
    }));

    let transport = Arc::new(PeerClient::new());
    let replication = ReplicationManager::new(
        &args.node_id,
        storage.clone(),
        ring,
        membership.clone(),
        transport.clone(),
        QuorumConfig {
            n: args.n,
            r: args.r,
            w: args.w,
            rpc_timeout: defaults::CONNECT_TIMEOUT,
        },
    );
    let coordinator = Arc::new(Coordinator::new(
        storage.clone(),
        membership.clone(),
        replication,
    ));

    // Bind before spawning anything; a bind failure aborts startup.
    let listener = quorumkv_net::bind(args.port)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(quorumkv_net::run(
        listener,
        coordinator,
        defaults::WORKER_POOL_SIZE,
        shutdown_rx.clone(),
    ));
    let membership_tasks = membership.start(transport, shutdown_rx);

    if let Some(metrics_port) = args.metrics_port {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], metrics_port));
        tokio::spawn(async move {
            if let Err(e) = quorumkv_metrics::serve_metrics(addr).await {
                tracing::warn!("metrics server failed: {e}");
            }
        });
    }

    tracing::info!(node_id = %args.node_id, port = args.port, "node ready");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping gracefully");

    let _ = shutdown_tx.send(true);
    let _ = server.await;
    for task in membership_tasks {
        let _ = task.await;
    }
    storage.wal().sync()?;

    tracing::info!(node_id = %args.node_id, "node stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["quorumkv-node"]).unwrap();
        assert_eq!(args.node_id, "node1");
        assert_eq!(args.port, 7000);
        assert_eq!(args.data_dir, PathBuf::from("/tmp/kvstore"));
        assert_eq!((args.n, args.r, args.w), (3, 2, 2));
        assert!(args.seeds.is_empty());
        assert_eq!(args.log_level, "info");
        assert!(args.metrics_port.is_none());
    }

    #[test]
    fn test_full_flag_set() {
        let args = Args::try_parse_from([
            "quorumkv-node",
            "--node-id",
            "node2",
            "--port",
            "7001",
            "--data-dir",
            "/var/lib/kv",
            "--seed",
            "10.0.0.1:7000",
            "--seed",
            "10.0.0.2:7000",
            "--N",
            "5",
            "--R",
            "3",
            "--W",
            "3",
            "--log-level",
            "debug",
            "--metrics-port",
            "9100",
        ])
        .unwrap();
        assert_eq!(args.node_id, "node2");
        assert_eq!(args.seeds.len(), 2);
        assert_eq!(args.seeds[0], ("10.0.0.1".to_string(), 7000));
        assert_eq!((args.n, args.r, args.w), (5, 3, 3));
        assert_eq!(args.metrics_port, Some(9100));
    }

    #[test]
    fn test_seed_parsing_rejects_garbage() {
        assert!(parse_seed("127.0.0.1:7000").is_ok());
        assert!(parse_seed("no-port").is_err());
        assert!(parse_seed(":7000").is_err());
        assert!(parse_seed("host:notaport").is_err());
    }

    #[test]
    fn test_quorum_validation() {
        let ok = Args::try_parse_from(["x", "--N", "3", "--R", "2", "--W", "2"]).unwrap();
        assert!(validate_quorum(&ok).is_ok());

        let r_too_big = Args::try_parse_from(["x", "--N", "3", "--R", "5"]).unwrap();
        assert!(validate_quorum(&r_too_big).is_err());

        let w_too_big = Args::try_parse_from(["x", "--N", "3", "--W", "4"]).unwrap();
        assert!(validate_quorum(&w_too_big).is_err());

        let zero_n = Args::try_parse_from(["x", "--N", "0", "--R", "0", "--W", "0"]).unwrap();
        assert!(validate_quorum(&zero_n).is_err());
    }
}
