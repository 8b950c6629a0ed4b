//! Merge of vector and keyword results under a weighted relevance score.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{HybridConfig, SearchResult, rank_results};
use crate::services::keyword::KeywordHit;

/// Weighted scorer combining semantic similarity, keyword hits and recency.
///
/// `score = semantic * w_sem + (hit ? w_key : 0) + recency(age) * w_rec`
/// where `recency(age) = max(0, 1 - age / horizon)`. Weights need not sum to 1,
/// so hybrid scores are only comparable with each other.
#[derive(Debug, Clone)]
pub struct HybridSearchEngine {
    config: HybridConfig,
}

impl HybridSearchEngine {
    pub fn new(config: HybridConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HybridConfig {
        &self.config
    }

    /// Linear decay from 1 at age zero to 0 at the horizon.
    pub fn recency_score(&self, age_days: f64) -> f32 {
        if self.config.recency_horizon_days <= 0.0 {
            return 0.0;
        }
        (1.0 - age_days.max(0.0) / self.config.recency_horizon_days).max(0.0) as f32
    }

    pub fn score(&self, semantic: f32, keyword_hit: bool, age_days: f64) -> f32 {
        let keyword = if keyword_hit {
            self.config.keyword_weight
        } else {
            0.0
        };
        semantic * self.config.semantic_weight
            + keyword
            + self.recency_score(age_days) * self.config.recency_weight
    }

    /// Merge by result id and rescore. Vector results keep their similarity as
    /// the semantic signal; keyword-only results use the configured fallback.
    pub fn merge(
        &self,
        vector: Vec<SearchResult>,
        keyword: Vec<KeywordHit>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Vec<SearchResult> {
        let mut merged: HashMap<String, (SearchResult, f32)> = HashMap::new();

        for result in vector {
            let semantic = result.score;
            merged.insert(result.id.clone(), (result, semantic));
        }

        for hit in keyword {
            merged
                .entry(hit.id.clone())
                .and_modify(|(result, _)| result.keyword_match = true)
                .or_insert_with(|| {
                    (
                        SearchResult {
                            id: hit.id,
                            content: hit.content,
                            metadata: hit.metadata,
                            distance: None,
                            score: 0.0,
                            keyword_match: true,
                        },
                        self.config.keyword_only_similarity,
                    )
                });
        }

        let mut results: Vec<SearchResult> = merged
            .into_values()
            .map(|(mut result, semantic)| {
                let age = result.metadata.document.age_in_days(now);
                result.score = self.score(semantic, result.keyword_match, age);
                result
            })
            .collect();

        rank_results(&mut results);
        results.truncate(limit);
        results
    }
}

impl Default for HybridSearchEngine {
    fn default() -> Self {
        Self::new(HybridConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkMetadata;
    use crate::services::vector_store::memory::tests::record;
    use chrono::Duration;
    use proptest::prelude::*;

    fn metadata(doc: &str, age_days: i64, now: DateTime<Utc>) -> ChunkMetadata {
        let mut m = record(doc, 0, vec![1.0]).metadata;
        m.document.uploaded_at = now - Duration::days(age_days);
        m
    }

    fn vector_result(
        doc: &str,
        similarity: f32,
        age_days: i64,
        now: DateTime<Utc>,
    ) -> SearchResult {
        SearchResult {
            id: format!("{doc}_chunk_0"),
            content: format!("content of {doc}"),
            metadata: metadata(doc, age_days, now),
            distance: Some(1.0 - similarity),
            score: similarity,
            keyword_match: false,
        }
    }

    fn keyword_hit(doc: &str, age_days: i64, now: DateTime<Utc>) -> KeywordHit {
        KeywordHit {
            id: format!("{doc}_chunk_0"),
            content: format!("content of {doc}"),
            metadata: metadata(doc, age_days, now),
            score: 1.0,
        }
    }

    #[test]
    fn test_recency_decay() {
        let engine = HybridSearchEngine::default();
        assert!((engine.recency_score(0.0) - 1.0).abs() < 1e-6);
        assert!((engine.recency_score(182.5) - 0.5).abs() < 1e-6);
        assert_eq!(engine.recency_score(365.0), 0.0);
        assert_eq!(engine.recency_score(1000.0), 0.0);
    }

    #[test]
    fn test_score_with_default_weights() {
        let engine = HybridSearchEngine::default();
        // 0.8 * 0.7 + 0.3 + 1.0 * 0.1
        assert!((engine.score(0.8, true, 0.0) - 0.96).abs() < 1e-5);
        assert!((engine.score(0.8, false, 400.0) - 0.56).abs() < 1e-5);
    }

    #[test]
    fn test_merge_collapses_duplicate_ids() {
        let now = Utc::now();
        let engine = HybridSearchEngine::default();
        let merged = engine.merge(
            vec![
                vector_result("a", 0.9, 0, now),
                vector_result("b", 0.5, 0, now),
            ],
            vec![keyword_hit("a", 0, now), keyword_hit("c", 0, now)],
            10,
            now,
        );

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].id, "a_chunk_0");
        assert!(merged[0].keyword_match);
        assert!(merged[0].distance.is_some());

        let c = merged.iter().find(|r| r.id == "c_chunk_0").unwrap();
        assert!(c.keyword_match);
        assert!(c.distance.is_none());
        // 0 * 0.7 + 0.3 + 0.1
        assert!((c.score - 0.4).abs() < 1e-5);
    }

    #[test]
    fn test_merge_truncates_to_limit() {
        let now = Utc::now();
        let engine = HybridSearchEngine::default();
        let merged = engine.merge(
            vec![
                vector_result("a", 0.9, 0, now),
                vector_result("b", 0.8, 0, now),
                vector_result("c", 0.7, 0, now),
            ],
            Vec::new(),
            2,
            now,
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].id, "b_chunk_0");
    }

    proptest! {
        #[test]
        fn prop_younger_never_scores_below_older(
            semantic in 0.0f32..1.0,
            hit in any::<bool>(),
            young in 0.0f64..2000.0,
            extra in 0.0f64..2000.0,
        ) {
            let engine = HybridSearchEngine::default();
            let younger = engine.score(semantic, hit, young);
            let older = engine.score(semantic, hit, young + extra);
            prop_assert!(younger >= older);
        }
    }
}
