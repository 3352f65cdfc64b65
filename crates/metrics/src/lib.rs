//! Metrics and tracing setup for quorumkv.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate, plus a lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` takes precedence; otherwise `level` (from `--log-level`)
/// applies. Every event carries the node id so interleaved cluster logs
/// stay attributable.
pub fn init_tracing(node_id: &str, level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    tracing::info!(node_id, "tracing initialized");
}

// ────────────────────────── Prometheus metrics ──────────────────────────

static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a quorumkv node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── Client operations ──
    pub kv_puts: IntCounter,
    pub kv_gets: IntCounter,
    pub kv_deletes: IntCounter,
    pub kv_latency_secs: HistogramVec,

    // ── Replication ──
    pub replica_rpcs_sent: IntCounter,
    pub replica_rpcs_received: IntCounter,
    pub quorum_failures: IntCounter,
    pub read_repairs: IntCounter,

    // ── Membership ──
    pub gossip_rounds: IntCounter,
    pub peers_alive: IntGauge,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let kv_puts = IntCounter::with_opts(Opts::new("quorumkv_puts_total", "Client PUTs"))
            .expect("kv_puts counter");
        let kv_gets = IntCounter::with_opts(Opts::new("quorumkv_gets_total", "Client GETs"))
            .expect("kv_gets counter");
        let kv_deletes =
            IntCounter::with_opts(Opts::new("quorumkv_deletes_total", "Client DELETEs"))
                .expect("kv_deletes counter");

        let kv_latency_secs = HistogramVec::new(
            HistogramOpts::new(
                "quorumkv_op_latency_seconds",
                "Client operation latency in seconds",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["op_type"],
        )
        .expect("kv_latency_secs histogram");

        let replica_rpcs_sent = IntCounter::with_opts(Opts::new(
            "quorumkv_replica_rpcs_sent_total",
            "Outbound replica RPCs",
        ))
        .expect("replica_rpcs_sent counter");
        let replica_rpcs_received = IntCounter::with_opts(Opts::new(
            "quorumkv_replica_rpcs_received_total",
            "Inbound replica RPCs",
        ))
        .expect("replica_rpcs_received counter");

        let quorum_failures = IntCounter::with_opts(Opts::new(
            "quorumkv_quorum_failures_total",
            "Operations that missed their quorum",
        ))
        .expect("quorum_failures counter");
        let read_repairs = IntCounter::with_opts(Opts::new(
            "quorumkv_read_repairs_total",
            "Read repair pushes triggered",
        ))
        .expect("read_repairs counter");

        let gossip_rounds = IntCounter::with_opts(Opts::new(
            "quorumkv_gossip_rounds_total",
            "Gossip rounds executed",
        ))
        .expect("gossip_rounds counter");
        let peers_alive = IntGauge::with_opts(Opts::new(
            "quorumkv_peers_alive",
            "Peers currently considered alive (including self)",
        ))
        .expect("peers_alive gauge");

        for collector in [
            Box::new(kv_puts.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(kv_gets.clone()),
            Box::new(kv_deletes.clone()),
            Box::new(kv_latency_secs.clone()),
            Box::new(replica_rpcs_sent.clone()),
            Box::new(replica_rpcs_received.clone()),
            Box::new(quorum_failures.clone()),
            Box::new(read_repairs.clone()),
            Box::new(gossip_rounds.clone()),
            Box::new(peers_alive.clone()),
        ] {
            registry.register(collector).expect("register metric");
        }

        Self {
            registry,
            kv_puts,
            kv_gets,
            kv_deletes,
            kv_latency_secs,
            replica_rpcs_sent,
            replica_rpcs_received,
            quorum_failures,
            read_repairs,
            gossip_rounds,
            peers_alive,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder
        .encode(&m.registry.gather(), &mut buf)
        .expect("prometheus text encoding");
    String::from_utf8(buf).expect("prometheus output is valid UTF-8")
}

/// Helper: start a latency timer for one client op. The guard records
/// elapsed time on drop.
pub fn start_op_timer(op_type: &str) -> prometheus::HistogramTimer {
    metrics()
        .kv_latency_secs
        .with_label_values(&[op_type])
        .start_timer()
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = encode_metrics();
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(Full::new(Bytes::from(body)))
        .expect("valid HTTP response"))
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// Spawns one task per connection; call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init_and_increment() {
        let m = metrics();

        let before = m.kv_puts.get();
        m.kv_puts.inc();
        m.kv_puts.inc();
        assert_eq!(m.kv_puts.get(), before + 2);

        m.peers_alive.set(3);
        assert_eq!(m.peers_alive.get(), 3);
    }

    #[test]
    fn test_encode_metrics_format() {
        metrics().read_repairs.inc();

        let output = encode_metrics();
        assert!(output.contains("quorumkv_puts_total"));
        assert!(output.contains("quorumkv_read_repairs_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_op_timer_records() {
        {
            let _timer = start_op_timer("put");
        }
        let h = metrics().kv_latency_secs.with_label_values(&["put"]);
        assert!(h.get_sample_count() >= 1);
    }
}
