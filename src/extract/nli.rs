//! NLI candidate selection and judging.
//!
//! Candidate (fragment, claim) pairs are gated by an embedding-similarity
//! prefilter to bound classifier cost. This module is also the single
//! place where a raw NLI score becomes edge nli_confidence, so the
//! calibration transform is applied here and nowhere else.

use crate::calibrate::Calibration;
use crate::config::ExtractionConfig;
use crate::error::Result;
use crate::extract::NliClassifier;
use crate::graph::types::{ClaimId, Edge, FragmentId};
use crate::storage::store::Store;

/// One shortlisted (claim, fragment) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePair {
    pub claim_id: ClaimId,
    pub claim_text: String,
    pub fragment_id: FragmentId,
    pub fragment_text: String,
    pub similarity: f64,
}

/// Cosine similarity; zero when either vector is empty or zero-length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Shortlist pairs: per claim, the top-K most similar fragments above the
/// similarity floor, capped per (claim, page) batch. Excess is dropped
/// lowest-similarity first.
pub fn select_candidate_pairs(
    claims: &[(ClaimId, String, Vec<f32>)],
    fragments: &[(FragmentId, String, Vec<f32>)],
    config: &ExtractionConfig,
) -> Vec<CandidatePair> {
    let mut pairs = Vec::new();
    for (claim_id, claim_text, claim_embedding) in claims {
        let mut scored: Vec<(f64, usize)> = fragments
            .iter()
            .enumerate()
            .map(|(i, (_, _, fragment_embedding))| {
                (cosine_similarity(claim_embedding, fragment_embedding), i)
            })
            .filter(|(similarity, _)| *similarity >= config.min_similarity)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let keep = config.top_k_fragments.min(config.max_pairs_per_claim_page);
        for (similarity, i) in scored.into_iter().take(keep) {
            let (fragment_id, fragment_text, _) = &fragments[i];
            pairs.push(CandidatePair {
                claim_id: claim_id.clone(),
                claim_text: claim_text.clone(),
                fragment_id: fragment_id.clone(),
                fragment_text: fragment_text.clone(),
                similarity,
            });
        }
    }
    pairs
}

/// Judge the shortlisted pairs and persist the resulting edges.
///
/// Returns the number of edges written. Re-judgement replaces by the
/// (claim, fragment) key, so running twice never inflates counts.
pub async fn judge_pairs(
    store: &Store,
    nli: &dyn NliClassifier,
    calibration: &Calibration,
    pairs: &[CandidatePair],
) -> Result<u32> {
    let mut written = 0u32;
    for pair in pairs {
        let judgement = match nli.classify(&pair.fragment_text, &pair.claim_text).await {
            Ok(judgement) => judgement,
            Err(e) => {
                tracing::warn!(error = %e, "nli classification failed; pair skipped");
                continue;
            }
        };

        // The one calibration application point.
        let confidence = calibration.apply(judgement.score);
        let edge = Edge::nli(&pair.fragment_id, &pair.claim_id, judgement.label, confidence);
        store.upsert_nli_edge(&edge)?;
        store.refresh_claim_counts(&pair.claim_id)?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::NliJudgement;
    use crate::graph::types::{Claim, ClaimType, Fragment, FragmentType, Page, PageType, Relation, Task};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cosine() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_prefilter_keeps_top_k_above_floor() {
        let config = ExtractionConfig {
            top_k_fragments: 2,
            max_pairs_per_claim_page: 8,
            min_similarity: 0.3,
            ..Default::default()
        };
        let claim = (ClaimId::new(), "c".to_string(), vec![1.0f32, 0.0]);
        let fragments = vec![
            (FragmentId::new(), "exact".to_string(), vec![1.0f32, 0.0]),
            (FragmentId::new(), "close".to_string(), vec![0.9f32, 0.4]),
            (FragmentId::new(), "orthogonal".to_string(), vec![0.0f32, 1.0]),
            (FragmentId::new(), "near".to_string(), vec![0.8f32, 0.6]),
        ];
        let pairs = select_candidate_pairs(&[claim], &fragments, &config);
        // Orthogonal filtered by floor; top-2 of the rest kept.
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].fragment_text, "exact");
        assert!(pairs[0].similarity >= pairs[1].similarity);
    }

    #[test]
    fn test_pair_cap_binds() {
        let config = ExtractionConfig {
            top_k_fragments: 10,
            max_pairs_per_claim_page: 1,
            min_similarity: 0.0,
            ..Default::default()
        };
        let claim = (ClaimId::new(), "c".to_string(), vec![1.0f32]);
        let fragments = vec![
            (FragmentId::new(), "a".to_string(), vec![1.0f32]),
            (FragmentId::new(), "b".to_string(), vec![0.5f32]),
        ];
        let pairs = select_candidate_pairs(&[claim], &fragments, &config);
        assert_eq!(pairs.len(), 1);
    }

    struct FixedNli(Relation, f64);

    #[async_trait]
    impl NliClassifier for FixedNli {
        async fn classify(&self, _premise: &str, _hypothesis: &str) -> crate::error::Result<NliJudgement> {
            Ok(NliJudgement {
                label: self.0,
                score: self.1,
            })
        }
    }

    #[tokio::test]
    async fn test_judge_pairs_persists_calibrated_edges() {
        let store = Store::in_memory().unwrap();
        let task = Task::new("h");
        store.insert_task(&task).unwrap();
        let page = Page::new("https://a.org/1", "a.org", PageType::Article);
        let (page_id, _) = store.upsert_page(&page).unwrap();
        let fragment = Fragment::new(page_id, FragmentType::Paragraph, "text", 0);
        store.insert_fragment(&fragment).unwrap();
        let claim = Claim::new(task.id.clone(), "claim", ClaimType::Factual);
        store.insert_claim(&claim).unwrap();

        let pairs = vec![CandidatePair {
            claim_id: claim.id.clone(),
            claim_text: claim.claim_text.clone(),
            fragment_id: fragment.id.clone(),
            fragment_text: fragment.text_content.clone(),
            similarity: 0.9,
        }];

        let nli = FixedNli(Relation::Supports, 0.9);
        // Temperature 2.0 flattens the raw 0.9 toward 0.5.
        let calibration = Calibration::Temperature { t: 2.0 };
        let written = judge_pairs(&store, &nli, &calibration, &pairs).await.unwrap();
        assert_eq!(written, 1);

        let edges = store.nli_edges_for_claim(&claim.id).unwrap();
        assert_eq!(edges.len(), 1);
        let stored = edges[0].nli_confidence.unwrap();
        assert!(stored < 0.9 && stored > 0.5);

        let updated = store.get_claim(&claim.id).unwrap().unwrap();
        assert_eq!(updated.supporting_count, 1);

        // Judging again replaces rather than inflating.
        judge_pairs(&store, &nli, &calibration, &pairs).await.unwrap();
        assert_eq!(store.nli_edges_for_claim(&claim.id).unwrap().len(), 1);
    }
}
