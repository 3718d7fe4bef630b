/// Metrics Module - Prometheus Instrumentation
///
/// - Global registry, exposed as text on `/metrics`
/// - Helper functions so call sites never touch label vectors directly
/// - Low-cardinality labels only (method, kind, outcome, source)

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Instant;

/// Standard latency buckets for histograms (seconds)
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ========================================================================
    // 1. SYNC PROGRESS
    // ========================================================================

    /// Blocks indexed
    /// Labels: mode (standard, insight)
    pub static ref BLOCKS_INDEXED: IntCounterVec = IntCounterVec::new(
        Opts::new("fluxblox_blocks_indexed_total", "Blocks indexed by strategy"),
        &["mode"]
    ).unwrap();

    /// Current watermark
    pub static ref SCANNED_HEIGHT: IntGauge = IntGauge::new(
        "fluxblox_scanned_height",
        "Height up to which all derived indexes are consistent"
    ).unwrap();

    /// Restores performed
    /// Labels: kind (shallow, deep, reorg, rescan)
    pub static ref RESTORES: IntCounterVec = IntCounterVec::new(
        Opts::new("fluxblox_restores_total", "Index restores by kind"),
        &["kind"]
    ).unwrap();

    /// Application payment candidates
    /// Labels: outcome (inserted, duplicate)
    pub static ref APP_CANDIDATES: IntCounterVec = IntCounterVec::new(
        Opts::new("fluxblox_app_candidates_total", "Application payment candidates by outcome"),
        &["outcome"]
    ).unwrap();

    /// Sender resolutions
    /// Labels: source (cache, utxo, collateral, daemon, unresolved)
    pub static ref SENDER_RESOLUTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("fluxblox_sender_resolutions_total", "Sender resolutions by source"),
        &["source"]
    ).unwrap();

    // ========================================================================
    // 2. DAEMON RPC
    // ========================================================================

    /// RPC call duration
    /// Labels: method (getblock, getblockchaininfo, getchaintips, getrawtransaction)
    pub static ref RPC_CALL_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("fluxblox_rpc_call_duration_seconds", "Daemon RPC latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["method"]
    ).unwrap();

    /// RPC errors
    /// Labels: method
    pub static ref RPC_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("fluxblox_rpc_errors_total", "Daemon RPC failures"),
        &["method"]
    ).unwrap();

    // ========================================================================
    // 3. STORE
    // ========================================================================

    /// Atomic batch commits
    pub static ref BATCH_WRITES: IntCounter = IntCounter::new(
        "fluxblox_batch_writes_total",
        "Atomic write batches committed"
    ).unwrap();

    /// Batch commit duration
    /// Labels: result (ok, error)
    pub static ref BATCH_WRITE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("fluxblox_batch_write_duration_seconds", "Atomic batch commit latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["result"]
    ).unwrap();

    /// Best-effort insert failures
    /// Labels: collection
    pub static ref INSERT_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("fluxblox_insert_failures_total", "Records skipped by best-effort inserts"),
        &["collection"]
    ).unwrap();
}

/// Register all metrics with the global registry
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    REGISTRY.register(Box::new(BLOCKS_INDEXED.clone()))?;
    REGISTRY.register(Box::new(SCANNED_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(RESTORES.clone()))?;
    REGISTRY.register(Box::new(APP_CANDIDATES.clone()))?;
    REGISTRY.register(Box::new(SENDER_RESOLUTIONS.clone()))?;
    REGISTRY.register(Box::new(RPC_CALL_DURATION.clone()))?;
    REGISTRY.register(Box::new(RPC_ERRORS.clone()))?;
    REGISTRY.register(Box::new(BATCH_WRITES.clone()))?;
    REGISTRY.register(Box::new(BATCH_WRITE_DURATION.clone()))?;
    REGISTRY.register(Box::new(INSERT_FAILURES.clone()))?;
    Ok(())
}

/// Render all registered metrics in the text exposition format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# metrics encoding failed: {}\n", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Timer for measuring durations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn increment_blocks_indexed(mode: &str) {
    BLOCKS_INDEXED.with_label_values(&[mode]).inc();
}

pub fn set_scanned_height(height: u32) {
    SCANNED_HEIGHT.set(height as i64);
}

pub fn increment_restores(kind: &str) {
    RESTORES.with_label_values(&[kind]).inc();
}

pub fn increment_app_candidates(outcome: &str) {
    APP_CANDIDATES.with_label_values(&[outcome]).inc();
}

pub fn increment_sender_resolutions(source: &str) {
    SENDER_RESOLUTIONS.with_label_values(&[source]).inc();
}

pub fn record_rpc_call_duration(method: &str, duration_secs: f64) {
    RPC_CALL_DURATION.with_label_values(&[method]).observe(duration_secs);
}

pub fn increment_rpc_errors(method: &str) {
    RPC_ERRORS.with_label_values(&[method]).inc();
}

pub fn record_batch_write(ok: bool, duration_secs: f64) {
    let result = if ok { "ok" } else { "error" };
    BATCH_WRITE_DURATION.with_label_values(&[result]).observe(duration_secs);
    if ok {
        BATCH_WRITES.inc();
    }
}

pub fn increment_insert_failures(collection: &str) {
    INSERT_FAILURES.with_label_values(&[collection]).inc();
}
