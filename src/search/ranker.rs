//! Hybrid ranking of lexical and vector hits.
//!
//! ```text
//! similarity = 1 / (1 + distance)
//! score      = lexical_weight * lexical_base   (if lexical hit)
//!            + vector_weight  * similarity     (if vector hit >= min_similarity)
//! ```
//!
//! Ordering: score descending, then lexical hits first, then listing id.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use super::lexical::{normalize, MatchedField};
use crate::config::SearchConfig;
use crate::index::VectorHit;
use crate::model::IndexedListing;

/// Which signals produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Lexical only
    Text,
    /// Vector only
    Semantic,
    /// Both
    Hybrid,
}

/// One ranked listing, before the listing details are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedHit {
    pub listing_id: String,
    pub score: f32,
    pub match_type: MatchType,
    pub matched_fields: Vec<MatchedField>,
    pub vector_similarity: Option<f32>,
}

impl RankedHit {
    pub fn is_lexical(&self) -> bool {
        !self.matched_fields.is_empty()
    }
}

/// Map a cosine distance in `[0, 2]` to a similarity in `(1/3, 1]`.
pub fn similarity(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

/// Tunable scoring parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankingWeights {
    pub lexical_weight: f32,
    pub vector_weight: f32,
    pub lexical_base_score: f32,
    pub min_similarity: f32,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self::from(&SearchConfig::default())
    }
}

impl From<&SearchConfig> for RankingWeights {
    fn from(config: &SearchConfig) -> Self {
        Self {
            lexical_weight: config.lexical_weight,
            vector_weight: config.vector_weight,
            lexical_base_score: config.lexical_base_score,
            min_similarity: config.min_similarity,
        }
    }
}

/// Merges lexical and vector hits into one ordering.
#[derive(Debug, Clone, Default)]
pub struct HybridRanker {
    weights: RankingWeights,
}

impl HybridRanker {
    pub fn new(weights: RankingWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &RankingWeights {
        &self.weights
    }

    /// Rank the union of both hit sets and keep the best `limit`.
    pub fn rank(
        &self,
        vector_hits: &[VectorHit],
        lexical_hits: &BTreeMap<String, Vec<MatchedField>>,
        limit: usize,
    ) -> Vec<RankedHit> {
        let similarities = self.similarities(vector_hits);
        let mut merged: Vec<RankedHit> = Vec::with_capacity(similarities.len() + lexical_hits.len());

        for (id, fields) in lexical_hits {
            let sim = similarities.get(id.as_str()).copied();
            merged.push(self.score(id, fields.clone(), sim));
        }
        for (id, sim) in &similarities {
            if !lexical_hits.contains_key(*id) {
                merged.push(self.score(id, Vec::new(), Some(*sim)));
            }
        }

        merged.sort_by(compare);
        merged.truncate(limit);
        merged
    }

    /// Vector-only ranking for the fast path.
    pub fn rank_vector_only(&self, vector_hits: &[VectorHit], limit: usize) -> Vec<RankedHit> {
        let mut ranked: Vec<RankedHit> = self
            .similarities(vector_hits)
            .into_iter()
            .map(|(id, sim)| self.score(id, Vec::new(), Some(sim)))
            .collect();
        ranked.sort_by(compare);
        ranked.truncate(limit);
        ranked
    }

    /// Similarity per listing id, dropping hits under the threshold.
    fn similarities<'a>(&self, vector_hits: &'a [VectorHit]) -> HashMap<&'a str, f32> {
        vector_hits
            .iter()
            .map(|hit| (hit.listing_id.as_str(), similarity(hit.distance)))
            .filter(|(_, sim)| *sim >= self.weights.min_similarity)
            .collect()
    }

    fn score(&self, id: &str, matched_fields: Vec<MatchedField>, sim: Option<f32>) -> RankedHit {
        let lexical = if matched_fields.is_empty() {
            0.0
        } else {
            self.weights.lexical_weight * self.weights.lexical_base_score
        };
        let vector = sim.map_or(0.0, |s| self.weights.vector_weight * s);
        let match_type = match (matched_fields.is_empty(), sim.is_some()) {
            (false, true) => MatchType::Hybrid,
            (false, false) => MatchType::Text,
            _ => MatchType::Semantic,
        };
        RankedHit {
            listing_id: id.to_string(),
            score: lexical + vector,
            match_type,
            matched_fields,
            vector_similarity: sim,
        }
    }
}

fn compare(a: &RankedHit, b: &RankedHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.is_lexical().cmp(&a.is_lexical()))
        .then_with(|| a.listing_id.cmp(&b.listing_id))
}

/// Required criterion values, keyed by criterion label.
pub type SearchFilters = BTreeMap<String, String>;

/// Whether `listing` has, for every filter entry, a criterion with that label
/// and value (compared after normalization).
pub fn matches_filters(listing: &IndexedListing, filters: &SearchFilters) -> bool {
    filters.iter().all(|(label, value)| {
        let label = normalize(label);
        let value = normalize(value);
        listing
            .criterion_pairs()
            .any(|(l, v)| normalize(l) == label && normalize(v) == value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::listing;
    use crate::model::CriterionValue;

    fn hit(id: &str, distance: f32) -> VectorHit {
        VectorHit {
            listing_id: id.to_string(),
            distance,
        }
    }

    fn lexical(ids: &[&str]) -> BTreeMap<String, Vec<MatchedField>> {
        ids.iter()
            .map(|id| (id.to_string(), vec![MatchedField::Title]))
            .collect()
    }

    #[test]
    fn test_similarity_is_monotonic_and_bounded() {
        assert_eq!(similarity(0.0), 1.0);
        assert!((similarity(2.0) - 1.0 / 3.0).abs() < 1e-6);
        assert!(similarity(0.1) > similarity(0.2));
    }

    #[test]
    fn test_hybrid_beats_single_signal() {
        let ranker = HybridRanker::default();
        let ranked = ranker.rank(
            &[hit("both", 0.2), hit("vec", 0.0)],
            &lexical(&["both", "text"]),
            10,
        );
        let ids: Vec<_> = ranked.iter().map(|r| r.listing_id.as_str()).collect();
        assert_eq!(ids, vec!["both", "text", "vec"]);
        assert_eq!(ranked[0].match_type, MatchType::Hybrid);
        assert_eq!(ranked[1].match_type, MatchType::Text);
        assert_eq!(ranked[2].match_type, MatchType::Semantic);
    }

    #[test]
    fn test_scores_are_non_increasing_and_truncated() {
        let ranker = HybridRanker::default();
        let hits: Vec<_> = (0..20).map(|i| hit(&format!("l{:02}", i), i as f32 * 0.05)).collect();
        let ranked = ranker.rank(&hits, &lexical(&["l07", "l15"]), 5);
        assert_eq!(ranked.len(), 5);
        assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_tie_prefers_lexical_then_id() {
        // Equal scores: a lexical-only hit worth 1.0 vs a vector-only hit at distance 0.
        let ranker = HybridRanker::default();
        let ranked = ranker.rank(&[hit("a", 0.0), hit("c", 0.0)], &lexical(&["b"]), 10);
        let ids: Vec<_> = ranked.iter().map(|r| r.listing_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(ranked[0].score, ranked[1].score);
    }

    #[test]
    fn test_min_similarity_drops_weak_vector_hits() {
        let ranker = HybridRanker::default();
        let ranked = ranker.rank(&[hit("weak", 1.5), hit("weak_lex", 1.5)], &lexical(&["weak_lex"]), 10);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].listing_id, "weak_lex");
        assert_eq!(ranked[0].vector_similarity, None);
        assert_eq!(ranked[0].match_type, MatchType::Text);
    }

    #[test]
    fn test_vector_only_ranking() {
        let ranker = HybridRanker::default();
        let ranked = ranker.rank_vector_only(&[hit("b", 0.3), hit("a", 0.3), hit("c", 0.1)], 2);
        let ids: Vec<_> = ranked.iter().map(|r| r.listing_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert!(ranked.iter().all(|r| r.match_type == MatchType::Semantic));
    }

    #[test]
    fn test_weights_are_tunable() {
        let ranker = HybridRanker::new(RankingWeights {
            lexical_weight: 0.1,
            ..RankingWeights::default()
        });
        let ranked = ranker.rank(&[hit("vec", 0.0)], &lexical(&["text"]), 10);
        assert_eq!(ranked[0].listing_id, "vec");
    }

    #[test]
    fn test_filters_compare_normalized_label_and_value() {
        let mut l = listing("b", "Vélo", "");
        l.criteria = vec![CriterionValue {
            criterion_id: "brand".into(),
            value: "Trék".into(),
        }];
        let labels = HashMap::from([("brand".to_string(), "Marque".to_string())]);
        let indexed = IndexedListing::resolve(l, &labels);

        let ok = SearchFilters::from([("marque".to_string(), "TREK".to_string())]);
        let wrong = SearchFilters::from([("Marque".to_string(), "Giant".to_string())]);
        assert!(matches_filters(&indexed, &ok));
        assert!(!matches_filters(&indexed, &wrong));
        assert!(matches_filters(&indexed, &SearchFilters::new()));
    }

    #[test]
    fn test_filter_on_label_containing_separator() {
        let mut l = listing("t", "Maillot", "");
        l.criteria = vec![CriterionValue {
            criterion_id: "size".into(),
            value: "M".into(),
        }];
        let labels = HashMap::from([("size".to_string(), "Taille: homme".to_string())]);
        let indexed = IndexedListing::resolve(l, &labels);

        let filters = SearchFilters::from([("taille: homme".to_string(), "m".to_string())]);
        assert!(matches_filters(&indexed, &filters));
        let partial = SearchFilters::from([("Taille".to_string(), "homme: M".to_string())]);
        assert!(!matches_filters(&indexed, &partial));
    }
}
