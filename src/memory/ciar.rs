//! CIAR significance scorer
//!
//! `score = certainty × impact × age_decay × recency_boost`, clamped to [0, 1].
//!
//! The scorer is a pure function of its inputs and the supplied `now`. The
//! promotion threshold is enforced by callers (the promotion engine and L2),
//! never here.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::CiarConfig;
use crate::decay::{age_decay, age_in_days, lambda_for_half_life, recency_boost};
use crate::errors::{MemoryError, Result};
use crate::memory::types::{CiarComponents, ExtractedUnit, Fact, FactType};

/// Default (certainty, impact) when extraction supplies none
pub fn default_certainty_impact(fact_type: FactType) -> (f32, f32) {
    match fact_type {
        FactType::Preference => (0.8, 0.8),
        FactType::Constraint => (0.85, 0.9),
        FactType::Instruction => (0.8, 0.85),
        FactType::Identity => (0.9, 0.75),
        FactType::Event => (0.75, 0.7),
        FactType::Mention => (0.5, 0.4),
    }
}

/// Anything the scorer can score
pub trait Scoreable {
    fn fact_type(&self) -> FactType;
    fn certainty(&self) -> Option<f32>;
    fn impact(&self) -> Option<f32>;
    /// When the underlying statement was observed
    fn observed_at(&self) -> DateTime<Utc>;
}

impl Scoreable for ExtractedUnit {
    fn fact_type(&self) -> FactType {
        self.fact_type
    }

    fn certainty(&self) -> Option<f32> {
        self.certainty
    }

    fn impact(&self) -> Option<f32> {
        self.impact
    }

    fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

impl Scoreable for Fact {
    fn fact_type(&self) -> FactType {
        self.fact_type
    }

    fn certainty(&self) -> Option<f32> {
        Some(self.ciar.certainty())
    }

    fn impact(&self) -> Option<f32> {
        Some(self.ciar.impact())
    }

    fn observed_at(&self) -> DateTime<Utc> {
        self.source_timestamp
    }
}

#[derive(Debug, Clone)]
pub struct CiarScorer {
    lambda: f64,
    alpha_boost: f32,
    max_boost: f32,
}

impl Default for CiarScorer {
    fn default() -> Self {
        Self {
            lambda: lambda_for_half_life(crate::constants::CIAR_HALF_LIFE_DAYS),
            alpha_boost: crate::constants::CIAR_ALPHA_BOOST,
            max_boost: crate::constants::CIAR_MAX_BOOST,
        }
    }
}

impl CiarScorer {
    pub fn new(config: &CiarConfig) -> Result<Self> {
        let lambda = match config.lambda_decay {
            Some(lambda) => lambda,
            None => lambda_for_half_life(config.half_life_days),
        };
        if !lambda.is_finite() || lambda < 0.0 {
            return Err(MemoryError::validation(
                "ciar.lambda_decay",
                format!("{lambda} is not a valid decay rate"),
            ));
        }
        if config.alpha_boost < 0.0 || config.max_boost < 1.0 {
            return Err(MemoryError::validation(
                "ciar.alpha_boost",
                "alpha must be >= 0 and max_boost >= 1",
            ));
        }
        Ok(Self {
            lambda,
            alpha_boost: config.alpha_boost,
            max_boost: config.max_boost,
        })
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Score a unit at `now` with the given access count
    ///
    /// Out-of-range certainty or impact is a contract violation and fails
    /// with `Validation` rather than being clamped.
    pub fn score<S: Scoreable>(&self, unit: &S, now: DateTime<Utc>, access_count: u32) -> Result<CiarComponents> {
        let (default_certainty, default_impact) = default_certainty_impact(unit.fact_type());
        let certainty = unit.certainty().unwrap_or(default_certainty);
        let impact = unit.impact().unwrap_or(default_impact);

        let decay = age_decay(age_in_days(unit.observed_at(), now), self.lambda);
        let boost = recency_boost(access_count, self.alpha_boost, self.max_boost);

        CiarComponents::new(certainty, impact, decay, boost).map_err(|e| {
            warn!(certainty, impact, error = %e, "Rejected out-of-contract CIAR input");
            e
        })
    }

    /// Recompute a fact's components for a new access count (L2 read path)
    pub fn rescore_access(&self, fact: &Fact, now: DateTime<Utc>, access_count: u32) -> Result<CiarComponents> {
        self.score(fact, now, access_count)
    }

    /// Recency boost alone, for callers adjusting an existing record
    pub fn boost_for(&self, access_count: u32) -> f32 {
        recency_boost(access_count, self.alpha_boost, self.max_boost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{TurnRange, UnitKind};
    use chrono::Duration;
    use rand::{Rng, SeedableRng};

    fn unit(certainty: Option<f32>, impact: Option<f32>, observed_at: DateTime<Utc>) -> ExtractedUnit {
        ExtractedUnit {
            content: "User prefers Python".into(),
            kind: UnitKind::Fact,
            fact_type: FactType::Preference,
            certainty,
            impact,
            entities: vec!["Python".into()],
            source_turn_range: TurnRange::single(1),
            observed_at,
        }
    }

    #[test]
    fn test_fresh_confident_fact_scores_072() {
        let scorer = CiarScorer::default();
        let now = Utc::now();
        let c = scorer.score(&unit(Some(0.9), Some(0.8), now), now, 0).unwrap();
        assert!((c.score() - 0.72).abs() < 1e-4);
        assert_eq!(c.age_decay(), 1.0);
        assert_eq!(c.recency_boost(), 1.0);
    }

    #[test]
    fn test_defaults_by_type() {
        let scorer = CiarScorer::default();
        let now = Utc::now();
        let c = scorer.score(&unit(None, None, now), now, 0).unwrap();
        assert_eq!(c.certainty(), 0.8);
        assert_eq!(c.impact(), 0.8);
    }

    #[test]
    fn test_out_of_range_fails_fast() {
        let scorer = CiarScorer::default();
        let now = Utc::now();
        let err = scorer.score(&unit(Some(1.3), Some(0.5), now), now, 0).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_half_life_decay() {
        let scorer = CiarScorer::default();
        let now = Utc::now();
        let c = scorer
            .score(&unit(Some(1.0), Some(1.0), now - Duration::days(30)), now, 0)
            .unwrap();
        assert!((c.age_decay() - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_explicit_lambda_overrides_half_life() {
        let config = CiarConfig {
            lambda_decay: Some(0.0),
            ..CiarConfig::default()
        };
        let scorer = CiarScorer::new(&config).unwrap();
        let now = Utc::now();
        let c = scorer
            .score(&unit(Some(0.9), Some(0.9), now - Duration::days(365)), now, 0)
            .unwrap();
        assert_eq!(c.age_decay(), 1.0);
    }

    #[test]
    fn test_score_always_in_unit_interval() {
        let scorer = CiarScorer::default();
        let now = Utc::now();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..2_000 {
            let certainty = rng.gen_range(0.0..=1.0);
            let impact = rng.gen_range(0.0..=1.0);
            let age_days = rng.gen_range(-5..400);
            let access = rng.gen_range(0..200);
            let c = scorer
                .score(
                    &unit(Some(certainty), Some(impact), now - Duration::days(age_days)),
                    now,
                    access,
                )
                .unwrap();
            assert!((0.0..=1.0).contains(&c.score()));
        }
    }

    #[test]
    fn test_more_access_never_lowers_score() {
        let scorer = CiarScorer::default();
        let now = Utc::now();
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        for _ in 0..500 {
            let u = unit(
                Some(rng.gen_range(0.0..=1.0)),
                Some(rng.gen_range(0.0..=1.0)),
                now - Duration::hours(rng.gen_range(0..2_000)),
            );
            let mut previous = 0.0;
            for access in 0..25 {
                let score = scorer.score(&u, now, access).unwrap().score();
                assert!(score >= previous);
                previous = score;
            }
        }
    }
}
