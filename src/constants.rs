//! Documented constants for the tiered memory system
//!
//! Every tunable default lives here with the reasoning behind its value.
//! `config.rs` builds its defaults from these, and environment variables
//! override them at startup.

// =============================================================================
// CIAR SCORING
// Certainty x Impact x Age-decay x Recency-boost
// =============================================================================

/// Half-life for age decay in days
///
/// A fact loses half of its age factor after this many days without being
/// re-observed. `lambda = ln(2) / half_life`.
///
/// Justification:
/// - 30 days matches the plateau of the Ebbinghaus forgetting curve
/// - Long enough that weekly recurring facts never fall below threshold
pub const CIAR_HALF_LIFE_DAYS: f64 = 30.0;

/// Recency boost per access (alpha)
///
/// `recency_boost = min(1 + alpha * access_count, max_boost)`.
/// 10 accesses double the boost, at which point the cap kicks in.
pub const CIAR_ALPHA_BOOST: f32 = 0.1;

/// Upper bound for the recency boost multiplier
pub const CIAR_MAX_BOOST: f32 = 2.0;

/// Minimum CIAR score for a unit to enter working memory (L2)
///
/// Justification:
/// - A confident (0.9) and impactful (0.8) fresh statement scores 0.72
/// - A vague mention (0.5 x 0.4) scores 0.2 and is filtered
pub const CIAR_PROMOTION_THRESHOLD: f32 = 0.6;

/// Score above which a single fact may form its own episode
pub const CIAR_HIGH_SIGNIFICANCE: f32 = 0.8;

/// Tolerance used when comparing a stored score against its components
pub const CIAR_SCORE_EPSILON: f32 = 1e-4;

// =============================================================================
// TIER LIMITS
// =============================================================================

/// L1 sliding window size per session (turns)
pub const L1_WINDOW_SIZE: usize = 20;

/// L1 turn time-to-live in hours
pub const L1_TTL_HOURS: i64 = 24;

/// L2 fact time-to-live in days
///
/// Facts that were never consolidated are dropped after a week. Consolidation
/// normally picks them up within an hour, so this only catches noise.
pub const L2_TTL_DAYS: i64 = 7;

/// Maximum facts returned by a single L2 session scan
pub const L2_SCAN_LIMIT: usize = 10_000;

/// Similarity above which a new knowledge document updates an existing one
pub const L4_DEDUP_SIMILARITY: f32 = 0.85;

/// Candidate documents examined for near-duplicate detection when the
/// full-text index returns nothing
pub const L4_DEDUP_SCAN_LIMIT: usize = 200;

// =============================================================================
// PROMOTION ENGINE (L1 -> L2)
// =============================================================================

/// Promotion cycle interval in seconds
pub const PROMOTION_INTERVAL_SECS: u64 = 45;

/// Turns per extraction batch (one LLM call per batch)
pub const PROMOTION_BATCH_SIZE: usize = 10;

/// Oldest pending turn age that forces a partial batch (seconds)
pub const PROMOTION_BATCH_MAX_AGE_SECS: i64 = 300;

/// Sessions processed concurrently per cycle
pub const MAX_CONCURRENT_SESSIONS: usize = 5;

/// Certainty multiplier applied to statements made by the assistant
///
/// The assistant restating or guessing is weaker evidence than the user
/// asserting something about themselves.
pub const ASSISTANT_CERTAINTY_FACTOR: f32 = 0.8;

// =============================================================================
// CONSOLIDATION (L2 -> L3)
// =============================================================================

/// Consolidation cycle interval in seconds
pub const CONSOLIDATION_INTERVAL_SECS: u64 = 600;

/// Facts younger than this are left for the next cycle (minutes)
pub const CONSOLIDATION_DELAY_MINUTES: i64 = 30;

/// Coarse time window for clustering (hours)
pub const CLUSTER_WINDOW_HOURS: i64 = 4;

/// Overlap between consecutive windows (minutes)
pub const CLUSTER_WINDOW_OVERLAP_MINUTES: i64 = 15;

/// Cosine similarity at which two facts are density-neighbours
pub const CLUSTER_SIMILARITY_THRESHOLD: f32 = 0.75;

/// Minimum neighbourhood size (including the point) for a core point
pub const CLUSTER_MIN_POINTS: usize = 2;

/// Hard cap on facts per episode
pub const CLUSTER_MAX_SIZE: usize = 50;

/// Similarity step used by the secondary split pass on oversized clusters
pub const CLUSTER_SPLIT_STEP: f32 = 0.05;

/// Character budget for fallback (concatenated) episode summaries
pub const SUMMARY_CHAR_BUDGET: usize = 600;

/// Attempts per side of the vector/graph dual write
pub const DUAL_WRITE_RETRIES: u32 = 3;

/// Base backoff between dual-write retries (milliseconds)
pub const DUAL_WRITE_BACKOFF_MS: u64 = 50;

// =============================================================================
// DISTILLATION (L3 -> L4)
// =============================================================================

/// Distillation cycle interval in seconds (daily)
pub const DISTILLATION_INTERVAL_SECS: u64 = 86_400;

/// Episode lookback window for pattern mining (days)
pub const MINING_LOOKBACK_DAYS: i64 = 30;

/// Minimum supporting episodes for a pattern
pub const MIN_EPISODE_SUPPORT: usize = 3;

/// Importance at which a single explicit statement is a pattern on its own
pub const EXPLICIT_STATEMENT_CONFIDENCE: f32 = 0.9;

/// Candidates below this confidence are discarded as trivial
pub const PATTERN_CONFIDENCE_FLOOR: f32 = 0.3;

/// Summary-embedding similarity for theme clustering
pub const THEME_SIMILARITY_THRESHOLD: f32 = 0.8;

/// Coefficient of variation below which gaps count as a regular rhythm
pub const TEMPORAL_REGULARITY_MAX_CV: f64 = 0.35;

/// Maximum candidates carried into synthesis per run
pub const MAX_PATTERN_CANDIDATES: usize = 50;

/// Half-life used to weight evidence recency during synthesis (days)
pub const EVIDENCE_RECENCY_HALF_LIFE_DAYS: f64 = 14.0;

/// Days between validation passes for a knowledge document
pub const VALIDATION_WINDOW_DAYS: i64 = 14;

/// Usefulness of a freshly synthesized document
pub const INITIAL_USEFULNESS: f32 = 0.5;

/// Usefulness below which an unvalidated document is archived
pub const USEFULNESS_FLOOR: f32 = 0.2;

/// Days without validation before a low-usefulness document is archived
pub const ARCHIVE_AFTER_DAYS: i64 = 30;

/// Usefulness lost when a validation pass finds no supporting episodes
pub const USEFULNESS_PENALTY: f32 = 0.15;

/// Usefulness gained when fresh episodes support the document
pub const USEFULNESS_REWARD: f32 = 0.05;

/// Similarity between a document and a fresh episode that counts as support
pub const VALIDATION_SUPPORT_SIMILARITY: f32 = 0.6;

// =============================================================================
// CIRCUIT BREAKER / LLM
// =============================================================================

/// Consecutive failures before the breaker opens
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Seconds the breaker stays open before allowing a trial call
pub const BREAKER_TIMEOUT_SECS: u64 = 60;

/// Trial calls allowed while half-open
pub const BREAKER_HALF_OPEN_TRIALS: u32 = 1;

/// Compare-and-set attempts before a breaker update is abandoned
pub const BREAKER_CAS_ATTEMPTS: usize = 16;

/// Hard timeout for a single LLM call (seconds)
pub const LLM_TIMEOUT_SECS: u64 = 20;

// =============================================================================
// DISTRIBUTED LOCK
// =============================================================================

/// Lease time-to-live for dual-write locks (milliseconds)
pub const LOCK_TTL_MS: u64 = 10_000;

/// Renewal happens at this fraction of the TTL
pub const LOCK_RENEW_FRACTION: f64 = 0.5;

/// Acquisition attempts before giving up with a lock error
pub const LOCK_ACQUIRE_ATTEMPTS: u32 = 5;

/// Base acquisition backoff (milliseconds), doubled per attempt
pub const LOCK_BACKOFF_MS: u64 = 25;

// =============================================================================
// RETRIEVAL
// =============================================================================

/// Default tier weights for hybrid retrieval
pub const WEIGHT_L1: f32 = 1.0;
pub const WEIGHT_L2: f32 = 0.9;
pub const WEIGHT_L3: f32 = 0.7;
pub const WEIGHT_L4: f32 = 0.6;

/// Per-tier query timeout on the read path (milliseconds)
pub const TIER_QUERY_TIMEOUT_MS: u64 = 1_500;

/// Character budget for assembled context
///
/// Roughly 2k tokens at ~4 characters per token.
pub const CONTEXT_CHAR_BUDGET: usize = 8_000;

/// Candidates fetched from each tier before merging
pub const TIER_CANDIDATES: usize = 20;

// =============================================================================
// EMBEDDINGS
// =============================================================================

/// Dimension of the hashed bag-of-words embedder
pub const HASH_EMBEDDING_DIM: usize = 256;

// =============================================================================
// SHUTDOWN
// =============================================================================

/// Seconds to wait for engine loops to finish their current cycle
pub const GRACEFUL_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
