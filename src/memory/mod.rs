//! Memory lifecycle
//!
//! Turns enter L1 and move upward through three engines:
//! - promotion (L1 -> L2): extraction plus CIAR gating
//! - consolidation (L2 -> L3): clustering into bi-temporal episodes
//! - distillation (L3 -> L4): pattern mining and knowledge synthesis
//!
//! The `MemoryOrchestrator` owns the tiers and engines and serves the
//! hybrid read path.

pub mod ciar;
pub mod consolidation;
pub mod distillation;
pub mod episodes;
pub mod orchestrator;
pub mod pattern_detection;
pub mod promotion;
pub mod synthesis;
pub mod types;

use std::time::Instant;

use crate::metrics::{ENGINE_CYCLES_TOTAL, ENGINE_CYCLE_DURATION};

pub use ciar::CiarScorer;
pub use consolidation::{ConsolidationEngine, ConsolidationReport, EpisodeSummarizer};
pub use distillation::{DistillationEngine, DistillationReport};
pub use episodes::{EpisodeConsolidator, EpisodeDraft};
pub use orchestrator::{
    ContextItem, HealthReport, MemoryOrchestrator, RetrievedContext, StrataStores,
};
pub use pattern_detection::{EpisodeEvidence, PatternCandidate, PatternMiner, PatternSignal};
pub use promotion::{PromotionEngine, PromotionReport, SessionPhase};
pub use synthesis::KnowledgeSynthesizer;
pub use types::*;

/// Record one finished engine cycle
pub(crate) fn record_cycle(engine: &str, started: Instant, ok: bool) {
    ENGINE_CYCLE_DURATION
        .with_label_values(&[engine])
        .observe(started.elapsed().as_secs_f64());
    ENGINE_CYCLES_TOTAL
        .with_label_values(&[engine, if ok { "ok" } else { "partial" }])
        .inc();
}
