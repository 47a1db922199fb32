use std::sync::Once;

use autometrics::prometheus_exporter;
use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::Histogram;
use prometheus::HistogramOpts;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use warp::Filter;
use warp::Rejection;
use warp::Reply;


lazy_static! {
    /// Routing cache refreshes by kind (`collection`, `database`)
    pub static ref CACHE_REFRESHES: IntCounterVec = IntCounterVec::new(
        Opts::new("cache_refreshes", "routing cache refreshes"),
        &["kind"]
    )
    .expect("metric can not be created");

    /// Stale-config retries by signal (`shard_version`, `db_version`)
    pub static ref STALE_CONFIG_RETRIES: IntCounterVec = IntCounterVec::new(
        Opts::new("stale_config_retries", "requests retried after a staleness signal"),
        &["signal"]
    )
    .expect("metric can not be created");

    /// Migration outcomes (`committed`, `aborted`, `cancelled`, `unknown`)
    pub static ref MIGRATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("migrations", "chunk migrations by outcome"),
        &["outcome"]
    )
    .expect("metric can not be created");

    pub static ref CRITICAL_SECTION_DURATION_MS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "critical_section_duration_ms",
            "Histogram of time writes were blocked by a migration critical section in ms"
        )
        .buckets(exponential_buckets(1.0, 2.0, 14).expect("valid buckets"))
    )
    .expect("metric can not be created");

    pub static ref ORPHANS_DELETED: IntCounter =
        IntCounter::new("orphans_deleted", "orphaned documents removed by cleanup")
            .expect("metric can not be created");

    pub static ref PENDING_RANGE_DELETIONS: IntGauge =
        IntGauge::new("pending_range_deletions", "queued range deletion tasks")
            .expect("metric can not be created");

    pub static ref RELOCATED_DOCUMENTS: IntCounter =
        IntCounter::new("relocated_documents", "updates that moved a document across shards")
            .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

static REGISTER: Once = Once::new();

fn register_custom_metrics(registry: &Registry) {
    registry
        .register(Box::new(CACHE_REFRESHES.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(STALE_CONFIG_RETRIES.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(MIGRATIONS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(CRITICAL_SECTION_DURATION_MS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(ORPHANS_DELETED.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(PENDING_RANGE_DELETIONS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(RELOCATED_DOCUMENTS.clone()))
        .expect("collector can be registered");
}

pub async fn start_server(
    port: u16,
    mut shutdown_signal: watch::Receiver<()>,
) {
    REGISTER.call_once(|| register_custom_metrics(&REGISTRY));

    let metrics_route = warp::path!("metrics").and_then(metrics_handler);

    info!("metrics endpoint listening on 0.0.0.0:{}/metrics", port);
    let (_, server) =
        warp::serve(metrics_route).bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
            let _ = shutdown_signal.changed().await;
        });
    server.await;
}

async fn metrics_handler() -> Result<impl Reply, Rejection> {
    Ok(gather_text())
}

/// Custom registry, default registry and autometrics output, concatenated.
pub fn gather_text() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut res = String::new();
    for families in [REGISTRY.gather(), prometheus::gather()] {
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            error!("could not encode metrics: {}", e);
            continue;
        }
        match String::from_utf8(buffer) {
            Ok(v) => res.push_str(&v),
            Err(e) => error!("metrics could not be from_utf8'd: {}", e),
        }
    }
    res.push_str(&get_metrics_body());
    res
}

/// Export metrics for Prometheus to scrape
pub fn get_metrics_body() -> String {
    let autometrics_response = prometheus_exporter::encode_http_response();
    autometrics_response.into_body()
}
