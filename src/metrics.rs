//! Prometheus metrics for the memory lifecycle
//!
//! Exposes the operational signals worth alerting on:
//! - Turn ingestion and fact promotion outcomes
//! - Extraction strategy mix (LLM vs rule-based fallback)
//! - Dual-write commits and rollbacks
//! - Engine cycle latency and failures
//! - Circuit breaker transitions and lock contention
//!
//! NOTE: Session ids never appear in labels to keep cardinality bounded.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Ingestion & promotion
    // ============================================================================

    /// Turns appended to L1
    pub static ref TURNS_STORED_TOTAL: IntCounter = IntCounter::new(
        "strata_turns_stored_total",
        "Total turns appended to active memory"
    ).unwrap();

    /// Promotion outcomes per extracted unit
    pub static ref FACTS_PROMOTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_facts_promoted_total", "Extracted units by promotion outcome"),
        &["outcome"]
    ).unwrap();

    /// Extraction batches by strategy actually used
    pub static ref EXTRACTION_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_extraction_total", "Extraction batches by strategy"),
        &["strategy"]
    ).unwrap();

    // ============================================================================
    // Consolidation & distillation
    // ============================================================================

    /// Episode dual-write outcomes
    pub static ref EPISODES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_episodes_total", "Episode writes by result"),
        &["result"]
    ).unwrap();

    /// Knowledge document changes
    pub static ref KNOWLEDGE_DOCUMENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_knowledge_documents_total", "Knowledge document changes by action"),
        &["action"]
    ).unwrap();

    /// Engine cycle duration
    pub static ref ENGINE_CYCLE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "strata_engine_cycle_duration_seconds",
            "Lifecycle engine cycle duration"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["engine"]
    ).unwrap();

    /// Engine cycles by result
    pub static ref ENGINE_CYCLES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_engine_cycles_total", "Lifecycle engine cycles"),
        &["engine", "result"]
    ).unwrap();

    // ============================================================================
    // Resilience
    // ============================================================================

    /// Breaker state transitions
    pub static ref CIRCUIT_BREAKER_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_circuit_breaker_transitions_total", "Circuit breaker state transitions"),
        &["breaker", "state"]
    ).unwrap();

    /// Current breaker state (0 closed, 1 half-open, 2 open)
    pub static ref CIRCUIT_BREAKER_STATE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("strata_circuit_breaker_state", "Circuit breaker state"),
        &["breaker"]
    ).unwrap();

    /// Lease lock acquisitions
    pub static ref LOCK_ACQUISITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_lock_acquisitions_total", "Lease lock acquisitions by result"),
        &["result"]
    ).unwrap();

    // ============================================================================
    // Retrieval
    // ============================================================================

    /// Context retrieval duration
    pub static ref RETRIEVE_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "strata_retrieve_duration_seconds",
            "Hybrid context retrieval duration"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5])
    ).unwrap();

    /// Per-tier query outcomes on the read path
    pub static ref TIER_QUERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_tier_queries_total", "Tier queries by outcome"),
        &["tier", "result"]
    ).unwrap();

    // ============================================================================
    // Errors
    // ============================================================================

    /// Errors by code and component
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("strata_errors_total", "Errors by code"),
        &["code", "component"]
    ).unwrap();
}

/// Register all metrics with the global registry
pub fn register_metrics() -> Result<(), prometheus::Error> {
    // Ingestion & promotion
    METRICS_REGISTRY.register(Box::new(TURNS_STORED_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(FACTS_PROMOTED_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(EXTRACTION_TOTAL.clone()))?;

    // Consolidation & distillation
    METRICS_REGISTRY.register(Box::new(EPISODES_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(KNOWLEDGE_DOCUMENTS_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(ENGINE_CYCLE_DURATION.clone()))?;
    METRICS_REGISTRY.register(Box::new(ENGINE_CYCLES_TOTAL.clone()))?;

    // Resilience
    METRICS_REGISTRY.register(Box::new(CIRCUIT_BREAKER_TRANSITIONS.clone()))?;
    METRICS_REGISTRY.register(Box::new(CIRCUIT_BREAKER_STATE.clone()))?;
    METRICS_REGISTRY.register(Box::new(LOCK_ACQUISITIONS_TOTAL.clone()))?;

    // Retrieval
    METRICS_REGISTRY.register(Box::new(RETRIEVE_DURATION.clone()))?;
    METRICS_REGISTRY.register(Box::new(TIER_QUERIES_TOTAL.clone()))?;

    // Errors
    METRICS_REGISTRY.register(Box::new(ERRORS_TOTAL.clone()))?;

    Ok(())
}

/// Record an error against its component
pub fn record_error(err: &crate::errors::MemoryError, component: &str) {
    ERRORS_TOTAL.with_label_values(&[err.code(), component]).inc();
}

/// Render the registry in the Prometheus text exposition format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&METRICS_REGISTRY.gather(), &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Helper to time operations with histogram (RAII pattern)
/// Usage: let _timer = Timer::new(SOME_HISTOGRAM.clone());
pub struct Timer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl Timer {
    /// Create timer that records duration to histogram on drop
    pub fn new(histogram: Histogram) -> Self {
        Self {
            histogram,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}
