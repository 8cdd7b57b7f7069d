//! Configuration management for strata-memory
//!
//! All configurable parameters in one place with environment variable overrides.
//! Sensible defaults come from `constants.rs`; production deployments override
//! them through `STRATA_*` variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::constants::*;
use crate::decay::retention_curve_debug;
use crate::errors::{MemoryError, Result};

/// Circuit breaker settings for an engine's external dependency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Seconds spent open before a trial call is allowed
    pub timeout_seconds: u64,
    /// Trial calls allowed while half-open
    pub half_open_trials: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: BREAKER_FAILURE_THRESHOLD,
            timeout_seconds: BREAKER_TIMEOUT_SECS,
            half_open_trials: BREAKER_HALF_OPEN_TRIALS,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Options recognised by every lifecycle engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between background cycles
    pub interval_seconds: u64,
    /// Units per batch (turns for promotion, facts considered otherwise)
    pub batch_size: usize,
    /// Sessions processed concurrently per cycle
    pub max_concurrent_sessions: usize,
    /// Minimum supporting episodes for a distilled pattern
    pub min_episode_support: usize,
    /// Similarity that turns a new L4 document into an update
    pub similarity_dedup_threshold: f32,
    /// Hard timeout for each LLM call issued by this engine
    pub llm_timeout_seconds: u64,
    /// Breaker policy for the engine's LLM dependency
    pub circuit_breaker: CircuitBreakerSettings,
}

impl EngineConfig {
    pub fn promotion_defaults() -> Self {
        Self {
            interval_seconds: PROMOTION_INTERVAL_SECS,
            ..Self::base()
        }
    }

    pub fn consolidation_defaults() -> Self {
        Self {
            interval_seconds: CONSOLIDATION_INTERVAL_SECS,
            batch_size: L2_SCAN_LIMIT,
            ..Self::base()
        }
    }

    pub fn distillation_defaults() -> Self {
        Self {
            interval_seconds: DISTILLATION_INTERVAL_SECS,
            max_concurrent_sessions: 1,
            ..Self::base()
        }
    }

    fn base() -> Self {
        Self {
            interval_seconds: PROMOTION_INTERVAL_SECS,
            batch_size: PROMOTION_BATCH_SIZE,
            max_concurrent_sessions: MAX_CONCURRENT_SESSIONS,
            min_episode_support: MIN_EPISODE_SUPPORT,
            similarity_dedup_threshold: L4_DEDUP_SIMILARITY,
            llm_timeout_seconds: LLM_TIMEOUT_SECS,
            circuit_breaker: CircuitBreakerSettings::default(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_seconds.max(1))
    }

    fn apply_env(&mut self, prefix: &str) {
        override_from_env(&format!("{prefix}_INTERVAL"), &mut self.interval_seconds);
        override_from_env(&format!("{prefix}_BATCH_SIZE"), &mut self.batch_size);
        override_from_env(
            &format!("{prefix}_MAX_CONCURRENT"),
            &mut self.max_concurrent_sessions,
        );
        override_from_env(
            &format!("{prefix}_LLM_TIMEOUT"),
            &mut self.llm_timeout_seconds,
        );
        override_from_env(
            &format!("{prefix}_BREAKER_FAILURES"),
            &mut self.circuit_breaker.failure_threshold,
        );
        override_from_env(
            &format!("{prefix}_BREAKER_TIMEOUT"),
            &mut self.circuit_breaker.timeout_seconds,
        );
        override_from_env(
            &format!("{prefix}_BREAKER_TRIALS"),
            &mut self.circuit_breaker.half_open_trials,
        );
    }
}

/// CIAR scorer parameters (shared by L2 and the promotion engine)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiarConfig {
    /// Half-life for age decay in days; used when `lambda_decay` is unset
    pub half_life_days: f64,
    /// Explicit decay rate per day, overrides the half-life
    pub lambda_decay: Option<f64>,
    /// Boost added per access
    pub alpha_boost: f32,
    /// Cap on the recency boost
    pub max_boost: f32,
    /// Minimum score accepted by L2
    pub ciar_threshold: f32,
    /// Score at which a lone fact may form its own episode
    pub high_significance: f32,
}

impl Default for CiarConfig {
    fn default() -> Self {
        Self {
            half_life_days: CIAR_HALF_LIFE_DAYS,
            lambda_decay: None,
            alpha_boost: CIAR_ALPHA_BOOST,
            max_boost: CIAR_MAX_BOOST,
            ciar_threshold: CIAR_PROMOTION_THRESHOLD,
            high_significance: CIAR_HIGH_SIGNIFICANCE,
        }
    }
}

/// Tier sizing and retention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// L1 turns kept per session
    pub l1_window_size: usize,
    /// L1 turn TTL in hours
    pub l1_ttl_hours: i64,
    /// L2 fact TTL in days
    pub l2_ttl_days: i64,
    /// Attempts per side of the L3 dual write
    pub dual_write_retries: u32,
    /// Backoff between dual-write attempts in milliseconds
    pub dual_write_backoff_ms: u64,
    /// Lease TTL for dual-write locks in milliseconds
    pub lock_ttl_ms: u64,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            l1_window_size: L1_WINDOW_SIZE,
            l1_ttl_hours: L1_TTL_HOURS,
            l2_ttl_days: L2_TTL_DAYS,
            dual_write_retries: DUAL_WRITE_RETRIES,
            dual_write_backoff_ms: DUAL_WRITE_BACKOFF_MS,
            lock_ttl_ms: LOCK_TTL_MS,
        }
    }
}

/// Episode clustering parameters
///
/// The similarity metric and window overlap have no validated universal
/// default; deployments should tune them against their own traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    pub window_hours: i64,
    pub window_overlap_minutes: i64,
    pub similarity_threshold: f32,
    pub min_points: usize,
    pub max_cluster_size: usize,
    pub split_step: f32,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            window_hours: CLUSTER_WINDOW_HOURS,
            window_overlap_minutes: CLUSTER_WINDOW_OVERLAP_MINUTES,
            similarity_threshold: CLUSTER_SIMILARITY_THRESHOLD,
            min_points: CLUSTER_MIN_POINTS,
            max_cluster_size: CLUSTER_MAX_SIZE,
            split_step: CLUSTER_SPLIT_STEP,
        }
    }
}

/// Lifecycle timing shared by the engines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Force a partial promotion batch once the oldest pending turn is this old
    pub batch_max_age_secs: i64,
    /// Facts younger than this are not yet eligible for consolidation
    pub consolidation_delay_minutes: i64,
    /// Fallback summary length budget
    pub summary_char_budget: usize,
    /// Pattern mining lookback in days
    pub lookback_days: i64,
    /// Days between validation passes for a knowledge document
    pub validation_window_days: i64,
    /// Usefulness floor for archival
    pub usefulness_floor: f32,
    /// Days without validation before archival is considered
    pub archive_after_days: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            batch_max_age_secs: PROMOTION_BATCH_MAX_AGE_SECS,
            consolidation_delay_minutes: CONSOLIDATION_DELAY_MINUTES,
            summary_char_budget: SUMMARY_CHAR_BUDGET,
            lookback_days: MINING_LOOKBACK_DAYS,
            validation_window_days: VALIDATION_WINDOW_DAYS,
            usefulness_floor: USEFULNESS_FLOOR,
            archive_after_days: ARCHIVE_AFTER_DAYS,
        }
    }
}

/// Tier weights for the hybrid read path
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TierWeights {
    pub l1: f32,
    pub l2: f32,
    pub l3: f32,
    pub l4: f32,
}

impl Default for TierWeights {
    fn default() -> Self {
        Self {
            l1: WEIGHT_L1,
            l2: WEIGHT_L2,
            l3: WEIGHT_L3,
            l4: WEIGHT_L4,
        }
    }
}

/// Read-path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub weights: TierWeights,
    pub tier_timeout_ms: u64,
    pub char_budget: usize,
    pub candidates_per_tier: usize,
    /// Tiers consulted by `retrieve_context` (L1..L4)
    pub enabled_tiers: [bool; 4],
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            weights: TierWeights::default(),
            tier_timeout_ms: TIER_QUERY_TIMEOUT_MS,
            char_budget: CONTEXT_CHAR_BUDGET,
            candidates_per_tier: TIER_CANDIDATES,
            enabled_tiers: [true; 4],
        }
    }
}

impl RetrievalConfig {
    pub fn tier_timeout(&self) -> Duration {
        Duration::from_millis(self.tier_timeout_ms)
    }
}

/// LLM endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an Ollama-compatible server; `None` runs rule-based only
    pub endpoint: Option<String>,
    pub model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: "qwen2.5:1.5b".to_string(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Storage directory for RocksDB and the full-text index
    pub data_path: PathBuf,
    /// Whether `store_turn` kicks off promotion once a batch is pending
    pub auto_promote: bool,
    pub tiers: TierConfig,
    pub ciar: CiarConfig,
    pub promotion: EngineConfig,
    pub consolidation: EngineConfig,
    pub distillation: EngineConfig,
    pub clustering: ClusteringConfig,
    pub lifecycle: LifecycleConfig,
    pub retrieval: RetrievalConfig,
    pub llm: LlmConfig,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./strata_data"),
            auto_promote: true,
            tiers: TierConfig::default(),
            ciar: CiarConfig::default(),
            promotion: EngineConfig::promotion_defaults(),
            consolidation: EngineConfig::consolidation_defaults(),
            distillation: EngineConfig::distillation_defaults(),
            clustering: ClusteringConfig::default(),
            lifecycle: LifecycleConfig::default(),
            retrieval: RetrievalConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

impl StrataConfig {
    /// Load configuration from environment variables with defaults
    #[allow(clippy::field_reassign_with_default)] // Environment overrides require mutable config
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("STRATA_DATA_PATH") {
            config.data_path = PathBuf::from(val);
        }

        if let Ok(val) = env::var("STRATA_AUTO_PROMOTE") {
            config.auto_promote = val.to_lowercase() == "true" || val == "1";
        }

        // Tiers
        override_from_env("STRATA_L1_WINDOW", &mut config.tiers.l1_window_size);
        override_from_env("STRATA_L1_TTL_HOURS", &mut config.tiers.l1_ttl_hours);
        override_from_env("STRATA_L2_TTL_DAYS", &mut config.tiers.l2_ttl_days);
        override_from_env("STRATA_DUAL_WRITE_RETRIES", &mut config.tiers.dual_write_retries);
        override_from_env("STRATA_LOCK_TTL_MS", &mut config.tiers.lock_ttl_ms);

        // CIAR
        override_from_env("STRATA_CIAR_THRESHOLD", &mut config.ciar.ciar_threshold);
        override_from_env("STRATA_HALF_LIFE_DAYS", &mut config.ciar.half_life_days);
        override_from_env("STRATA_ALPHA_BOOST", &mut config.ciar.alpha_boost);
        override_from_env("STRATA_MAX_BOOST", &mut config.ciar.max_boost);
        if let Ok(val) = env::var("STRATA_LAMBDA_DECAY") {
            if let Ok(n) = val.parse::<f64>() {
                config.ciar.lambda_decay = Some(n);
            }
        }

        // Engines
        config.promotion.apply_env("STRATA_PROMOTION");
        config.consolidation.apply_env("STRATA_CONSOLIDATION");
        config.distillation.apply_env("STRATA_DISTILLATION");
        override_from_env(
            "STRATA_MIN_EPISODE_SUPPORT",
            &mut config.distillation.min_episode_support,
        );
        override_from_env(
            "STRATA_DEDUP_THRESHOLD",
            &mut config.distillation.similarity_dedup_threshold,
        );

        // Clustering
        override_from_env("STRATA_CLUSTER_WINDOW_HOURS", &mut config.clustering.window_hours);
        override_from_env(
            "STRATA_CLUSTER_OVERLAP_MINUTES",
            &mut config.clustering.window_overlap_minutes,
        );
        override_from_env(
            "STRATA_CLUSTER_SIMILARITY",
            &mut config.clustering.similarity_threshold,
        );
        override_from_env("STRATA_CLUSTER_MAX_SIZE", &mut config.clustering.max_cluster_size);

        // Lifecycle
        override_from_env(
            "STRATA_CONSOLIDATION_DELAY_MINUTES",
            &mut config.lifecycle.consolidation_delay_minutes,
        );
        override_from_env("STRATA_LOOKBACK_DAYS", &mut config.lifecycle.lookback_days);

        // Retrieval
        override_from_env("STRATA_TIER_TIMEOUT_MS", &mut config.retrieval.tier_timeout_ms);
        override_from_env("STRATA_CONTEXT_BUDGET", &mut config.retrieval.char_budget);

        // LLM
        if let Ok(val) = env::var("STRATA_LLM_ENDPOINT") {
            if !val.trim().is_empty() {
                config.llm.endpoint = Some(val);
            }
        }
        if let Ok(val) = env::var("STRATA_LLM_MODEL") {
            config.llm.model = val;
        }

        config
    }

    /// Reject configurations that would break scoring or clustering invariants
    pub fn validate(&self) -> Result<()> {
        check_unit("ciar.ciar_threshold", self.ciar.ciar_threshold)?;
        check_unit("ciar.high_significance", self.ciar.high_significance)?;
        check_unit(
            "clustering.similarity_threshold",
            self.clustering.similarity_threshold,
        )?;
        check_unit(
            "distillation.similarity_dedup_threshold",
            self.distillation.similarity_dedup_threshold,
        )?;

        if self.ciar.half_life_days <= 0.0 {
            return Err(MemoryError::validation(
                "ciar.half_life_days",
                "must be positive",
            ));
        }
        if matches!(self.ciar.lambda_decay, Some(l) if l < 0.0 || !l.is_finite()) {
            return Err(MemoryError::validation(
                "ciar.lambda_decay",
                "must be a non-negative finite rate",
            ));
        }
        if self.ciar.alpha_boost < 0.0 {
            return Err(MemoryError::validation("ciar.alpha_boost", "must be >= 0"));
        }
        if self.ciar.max_boost < 1.0 {
            return Err(MemoryError::validation("ciar.max_boost", "must be >= 1"));
        }
        if self.tiers.l1_window_size == 0 {
            return Err(MemoryError::validation("tiers.l1_window_size", "must be > 0"));
        }
        if self.promotion.batch_size == 0 {
            return Err(MemoryError::validation("promotion.batch_size", "must be > 0"));
        }
        if self.clustering.max_cluster_size < 2 {
            return Err(MemoryError::validation(
                "clustering.max_cluster_size",
                "must be >= 2",
            ));
        }
        if self.clustering.window_overlap_minutes >= self.clustering.window_hours * 60 {
            return Err(MemoryError::validation(
                "clustering.window_overlap_minutes",
                "must be shorter than the window",
            ));
        }
        for (name, engine) in [
            ("promotion", &self.promotion),
            ("consolidation", &self.consolidation),
            ("distillation", &self.distillation),
        ] {
            if engine.max_concurrent_sessions == 0 {
                return Err(MemoryError::validation(
                    &format!("{name}.max_concurrent_sessions"),
                    "must be > 0",
                ));
            }
            if engine.circuit_breaker.failure_threshold == 0
                || engine.circuit_breaker.half_open_trials == 0
            {
                return Err(MemoryError::validation(
                    &format!("{name}.circuit_breaker"),
                    "failure_threshold and half_open_trials must be > 0",
                ));
            }
        }
        Ok(())
    }

    /// Log the current configuration
    pub fn log(&self) {
        info!("Configuration:");
        info!("   Storage: {:?}", self.data_path);
        info!(
            "   L1 window: {} turns, TTL {}h",
            self.tiers.l1_window_size, self.tiers.l1_ttl_hours
        );
        info!(
            "   CIAR: threshold {:.2}, half-life {}d, alpha {:.2}, max boost {:.1}",
            self.ciar.ciar_threshold,
            self.ciar.half_life_days,
            self.ciar.alpha_boost,
            self.ciar.max_boost
        );
        debug!("{}", retention_curve_debug(self.ciar.half_life_days));
        info!(
            "   Intervals: promotion {}s, consolidation {}s, distillation {}s",
            self.promotion.interval_seconds,
            self.consolidation.interval_seconds,
            self.distillation.interval_seconds
        );
        info!(
            "   Clustering: {}h windows, {}m overlap, similarity {:.2}, max size {}",
            self.clustering.window_hours,
            self.clustering.window_overlap_minutes,
            self.clustering.similarity_threshold,
            self.clustering.max_cluster_size
        );
        match &self.llm.endpoint {
            Some(endpoint) => info!("   LLM: {} ({})", endpoint, self.llm.model),
            None => info!("   LLM: disabled (rule-based extraction only)"),
        }
    }
}

fn check_unit(field: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        return Err(MemoryError::validation(
            field,
            format!("{value} is outside [0, 1]"),
        ));
    }
    Ok(())
}

fn override_from_env<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = env::var(key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!("Ignoring unparsable value for {}: '{}'", key, val),
        }
    }
}

/// Environment variable documentation
pub fn print_env_help() {
    println!("strata-memory configuration environment variables:");
    println!();
    println!("  STRATA_DATA_PATH                - Storage directory (default: ./strata_data)");
    println!("  STRATA_AUTO_PROMOTE             - Trigger promotion from store_turn (default: true)");
    println!("  STRATA_L1_WINDOW                - Turns kept per session (default: 20)");
    println!("  STRATA_L1_TTL_HOURS             - Turn TTL (default: 24)");
    println!("  STRATA_L2_TTL_DAYS              - Fact TTL (default: 7)");
    println!("  STRATA_CIAR_THRESHOLD           - Promotion threshold (default: 0.6)");
    println!("  STRATA_HALF_LIFE_DAYS           - Age decay half-life (default: 30)");
    println!("  STRATA_LAMBDA_DECAY             - Explicit decay rate, overrides half-life");
    println!("  STRATA_ALPHA_BOOST              - Recency boost per access (default: 0.1)");
    println!("  STRATA_MIN_EPISODE_SUPPORT      - Pattern support (default: 3)");
    println!("  STRATA_DEDUP_THRESHOLD          - L4 near-duplicate similarity (default: 0.85)");
    println!("  STRATA_<ENGINE>_INTERVAL        - Cycle interval, ENGINE = PROMOTION|CONSOLIDATION|DISTILLATION");
    println!("  STRATA_<ENGINE>_BATCH_SIZE      - Batch size");
    println!("  STRATA_<ENGINE>_MAX_CONCURRENT  - Sessions in flight");
    println!("  STRATA_<ENGINE>_BREAKER_*       - FAILURES | TIMEOUT | TRIALS");
    println!("  STRATA_LLM_ENDPOINT             - Ollama-compatible base URL (default: disabled)");
    println!("  STRATA_LLM_MODEL                - Model name");
    println!("  STRATA_LOG_FORMAT               - 'json' for structured logs");
    println!();
    println!("  RUST_LOG                        - Log level (e.g., info, debug, trace)");
    println!();
}
