//! Candidate selection for one pass: pick at most one candidate per source record.

use edl_core::{CandidateExtract, CandidatePool, MatchedPair, SourceRecord};

use crate::config::MatchingConfig;
use crate::similarity::similarity;

pub trait ExtractMatcher: Send + Sync {
    /// Best candidate for `source`, or `None` when nothing in the pool is acceptable.
    fn match_one(&self, source: SourceRecord, pool: CandidatePool) -> Option<MatchedPair>;

    /// Apply `match_one` to every tuple, dropping records without a match.
    /// Output keeps input order.
    fn match_all(&self, pulled: Vec<(SourceRecord, CandidatePool)>) -> Vec<MatchedPair> {
        pulled
            .into_iter()
            .filter_map(|(source, pool)| self.match_one(source, pool))
            .collect()
    }
}

/// First pass. The phone lookup already narrows the pool to one candidate,
/// so the match is that candidate, unscored.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByPhoneMatcher;

impl ExtractMatcher for ByPhoneMatcher {
    fn match_one(&self, source: SourceRecord, pool: CandidatePool) -> Option<MatchedPair> {
        pool.into_iter()
            .next()
            .map(|candidate| MatchedPair::new(source, candidate))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateScore {
    /// Position of the candidate in its pool.
    pub index: usize,
    pub address_similarity: f64,
    pub name_similarity: f64,
    pub score: f64,
}

/// Second pass: weighted name + address similarity with a two-threshold gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByAddressMatcher {
    config: MatchingConfig,
}

impl ByAddressMatcher {
    pub fn new(config: MatchingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// Zero unless both similarities clear the lower threshold and at least
    /// one clears the upper threshold.
    pub fn blend(&self, address_similarity: f64, name_similarity: f64) -> f64 {
        let low = address_similarity.min(name_similarity);
        let high = address_similarity.max(name_similarity);
        if low < self.config.lower_threshold || high < self.config.upper_threshold {
            return 0.0;
        }
        self.config.address_weight * address_similarity + self.config.name_weight * name_similarity
    }

    pub fn score(&self, source: &SourceRecord, candidate: &CandidateExtract) -> CandidateScore {
        let address_similarity = similarity(source.address.as_deref(), candidate.address.as_deref());
        let name_similarity = similarity(source.name.as_deref(), candidate.name.as_deref());
        CandidateScore {
            index: 0,
            address_similarity,
            name_similarity,
            score: self.blend(address_similarity, name_similarity),
        }
    }

    /// Every candidate's score, best first. The sort is stable, so equal
    /// scores keep pool order.
    pub fn rank(&self, source: &SourceRecord, pool: &[CandidateExtract]) -> Vec<CandidateScore> {
        let mut scores = pool
            .iter()
            .enumerate()
            .map(|(index, candidate)| CandidateScore {
                index,
                ..self.score(source, candidate)
            })
            .collect::<Vec<_>>();
        scores.sort_by(|a, b| b.score.total_cmp(&a.score));
        scores
    }
}

impl ExtractMatcher for ByAddressMatcher {
    fn match_one(&self, source: SourceRecord, pool: CandidatePool) -> Option<MatchedPair> {
        let best = self.rank(&source, &pool).into_iter().next()?;
        if best.score <= 0.0 {
            return None;
        }
        pool.into_iter()
            .nth(best.index)
            .map(|candidate| MatchedPair::new(source, candidate))
    }
}
