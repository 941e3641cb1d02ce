// Prometheus metrics definitions for the promptduel backend.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Battles currently in progress (started, not yet complete or reset).
    pub static ref ACTIVE_BATTLES: IntGauge =
        IntGauge::new("promptduel_active_battles", "Battles currently in progress").unwrap();

    /// Live WebSocket connections.
    pub static ref CONNECTED_WEBSOCKETS: IntGauge =
        IntGauge::new("promptduel_connected_websockets", "Live WebSocket connections").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Total battles started.
    pub static ref BATTLES_STARTED_TOTAL: IntCounter =
        IntCounter::new("promptduel_battles_started_total", "Total battles started").unwrap();

    /// Total battles that reached the complete phase.
    pub static ref BATTLES_COMPLETED_TOTAL: IntCounter = IntCounter::new(
        "promptduel_battles_completed_total",
        "Total battles completed",
    )
    .unwrap();

    /// Total image generation requests, by outcome (ok, http_error, transport_error).
    pub static ref GENERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "promptduel_generation_requests_total",
            "Total image generation requests",
        ),
        &["outcome"],
    )
    .unwrap();

    /// Submissions forced by the turn clock running out.
    pub static ref TIMEOUT_SUBMISSIONS_TOTAL: IntCounter = IntCounter::new(
        "promptduel_timeout_submissions_total",
        "Submissions forced by the countdown",
    )
    .unwrap();

    /// Battle sessions created.
    pub static ref SESSIONS_CREATED_TOTAL: IntCounter = IntCounter::new(
        "promptduel_sessions_created_total",
        "Battle sessions created",
    )
    .unwrap();

    /// Successful session joins via join code.
    pub static ref SESSIONS_JOINED_TOTAL: IntCounter = IntCounter::new(
        "promptduel_sessions_joined_total",
        "Successful session joins",
    )
    .unwrap();

    /// Total API requests, by method/endpoint/status.
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("promptduel_api_requests_total", "Total API requests"),
        &["method", "endpoint", "status"],
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Image generation call duration in seconds, by outcome.
    pub static ref GENERATION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "promptduel_generation_duration_seconds",
            "Image generation call duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 40.0, 80.0, 120.0]),
        &["outcome"],
    )
    .unwrap();

    /// Wall-clock battle duration in seconds, from start to complete.
    pub static ref BATTLE_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "promptduel_battle_duration_seconds",
            "Battle duration in seconds",
        )
        .buckets(vec![10.0, 30.0, 60.0, 120.0, 180.0, 300.0, 600.0]),
        &["outcome"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTIVE_BATTLES.clone()),
        Box::new(CONNECTED_WEBSOCKETS.clone()),
        Box::new(BATTLES_STARTED_TOTAL.clone()),
        Box::new(BATTLES_COMPLETED_TOTAL.clone()),
        Box::new(GENERATION_REQUESTS_TOTAL.clone()),
        Box::new(TIMEOUT_SUBMISSIONS_TOTAL.clone()),
        Box::new(SESSIONS_CREATED_TOTAL.clone()),
        Box::new(SESSIONS_JOINED_TOTAL.clone()),
        Box::new(API_REQUESTS_TOTAL.clone()),
        Box::new(GENERATION_DURATION_SECONDS.clone()),
        Box::new(BATTLE_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        REGISTRY.register(c).expect("failed to register metric");
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Normalize a URL path for metric labels: replace numeric path segments with `:id`
/// to prevent cardinality explosion.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.parse::<i64>().is_ok() {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
