//! Drives the LLM extractor and NLI classifier over one page.

use crate::calibrate::Calibration;
use crate::config::ExtractionConfig;
use crate::error::Result;
use crate::extract::nli::{judge_pairs, select_candidate_pairs};
use crate::extract::validate::{parse_claims, parse_fragments, RawClaim, RawFragment};
use crate::extract::{EmbeddingClient, LlmExtractor, NliClassifier};
use crate::graph::types::*;
use crate::storage::store::Store;
use std::sync::Arc;

/// What one page contributed to the graph.
#[derive(Debug, Clone, Default)]
pub struct PageExtraction {
    pub fragment_ids: Vec<FragmentId>,
    pub claim_ids: Vec<ClaimId>,
    pub edges_written: u32,
}

/// Fragment/claim extractor over one page's content.
pub struct FragmentClaimExtractor {
    store: Store,
    llm: Arc<dyn LlmExtractor>,
    nli: Arc<dyn NliClassifier>,
    embedding: Arc<dyn EmbeddingClient>,
    calibration: Calibration,
    config: ExtractionConfig,
}

impl FragmentClaimExtractor {
    pub fn new(
        store: Store,
        llm: Arc<dyn LlmExtractor>,
        nli: Arc<dyn NliClassifier>,
        embedding: Arc<dyn EmbeddingClient>,
        calibration: Calibration,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            store,
            llm,
            nli,
            embedding,
            calibration,
            config,
        }
    }

    /// Process a page that only has an abstract: one abstract fragment,
    /// then claims and judging over it.
    pub async fn process_abstract(
        &self,
        task: &Task,
        page_id: &PageId,
        abstract_text: &str,
    ) -> Result<PageExtraction> {
        let mut extraction = PageExtraction::default();

        if !self.store.page_has_abstract(page_id)? {
            let fragment =
                Fragment::new(page_id.clone(), FragmentType::Abstract, abstract_text, 0);
            self.store.insert_fragment(&fragment)?;
            extraction.fragment_ids.push(fragment.id);
        }

        let fragments = self.store.fragments_for_page(page_id)?;
        self.claims_and_judge(task, fragments, &mut extraction).await?;
        Ok(extraction)
    }

    /// Process fetched page content: fragments via the LLM extractor with
    /// one validated retry, then claims and judging.
    pub async fn process_content(
        &self,
        task: &Task,
        page: &Page,
        content: &str,
    ) -> Result<PageExtraction> {
        let mut extraction = PageExtraction::default();

        let raw_fragments = self.extract_fragments_validated(&page.url, content).await;
        let raw_fragments = match raw_fragments {
            Some(fragments) => fragments,
            // Batch dropped after the retry; the job continues with what
            // the page already has.
            None => Vec::new(),
        };

        let existing = self.store.fragments_for_page(&page.id)?;
        let mut position = existing.len() as u32;
        let room = self
            .config
            .max_fragments_per_page
            .saturating_sub(existing.len());
        for raw in raw_fragments.into_iter().take(room) {
            let fragment = Fragment::new(page.id.clone(), raw.fragment_type, raw.text, position)
                .with_headings(raw.heading_hierarchy);
            self.store.insert_fragment(&fragment)?;
            extraction.fragment_ids.push(fragment.id);
            position += 1;
        }

        let fragments = self.store.fragments_for_page(&page.id)?;
        self.claims_and_judge(task, fragments, &mut extraction).await?;
        Ok(extraction)
    }

    /// Claims from the page's fragments, then NLI over shortlisted pairs.
    async fn claims_and_judge(
        &self,
        task: &Task,
        fragments: Vec<Fragment>,
        extraction: &mut PageExtraction,
    ) -> Result<()> {
        if fragments.is_empty() {
            return Ok(());
        }

        let combined: String = fragments
            .iter()
            .map(|f| f.text_content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let raw_claims = self
            .extract_claims_validated(&combined, &task.central_hypothesis)
            .await
            .unwrap_or_default();

        let claim_rows = self.persist_claims(task, raw_claims, extraction)?;
        if claim_rows.is_empty() {
            return Ok(());
        }

        // Embed both sides for the similarity prefilter.
        let claim_texts: Vec<String> = claim_rows.iter().map(|c| c.claim_text.clone()).collect();
        let fragment_texts: Vec<String> =
            fragments.iter().map(|f| f.text_content.clone()).collect();

        let claim_vectors = self.embedding.embed(&claim_texts).await?;
        let fragment_vectors = self.embedding.embed(&fragment_texts).await?;

        let claims_with_vectors: Vec<(ClaimId, String, Vec<f32>)> = claim_rows
            .iter()
            .zip(claim_vectors.iter())
            .map(|(c, v)| (c.id.clone(), c.claim_text.clone(), v.clone()))
            .collect();
        let fragments_with_vectors: Vec<(FragmentId, String, Vec<f32>)> = fragments
            .iter()
            .zip(fragment_vectors.iter())
            .map(|(f, v)| (f.id.clone(), f.text_content.clone(), v.clone()))
            .collect();

        for (claim, vector) in claim_rows.iter().zip(claim_vectors.iter()) {
            self.store.set_claim_embedding(&claim.id, vector)?;
        }
        for (fragment, vector) in fragments.iter().zip(fragment_vectors.iter()) {
            self.store.set_fragment_embedding(&fragment.id, vector)?;
        }

        let pairs =
            select_candidate_pairs(&claims_with_vectors, &fragments_with_vectors, &self.config);
        extraction.edges_written += judge_pairs(
            &self.store,
            self.nli.as_ref(),
            &self.calibration,
            &pairs,
        )
        .await?;
        Ok(())
    }

    /// Insert new claims, reusing existing task claims with identical
    /// normalized text so repeat runs never duplicate.
    fn persist_claims(
        &self,
        task: &Task,
        raw_claims: Vec<RawClaim>,
        extraction: &mut PageExtraction,
    ) -> Result<Vec<Claim>> {
        let existing = self.store.claims_for_task(&task.id)?;
        let mut room = (task.budget.max_claims as usize).saturating_sub(existing.len());
        let mut rows = Vec::new();
        for raw in raw_claims {
            let normalized = normalize_claim_text(&raw.text);
            if let Some(found) = existing
                .iter()
                .find(|c| normalize_claim_text(&c.claim_text) == normalized)
            {
                rows.push(found.clone());
                continue;
            }
            if room == 0 {
                tracing::debug!(task = %task.id, "claim budget reached; extra claims dropped");
                continue;
            }
            let claim = Claim::new(task.id.clone(), raw.text, raw.claim_type)
                .with_granularity(raw.granularity)
                .with_llm_confidence(raw.confidence);
            self.store.insert_claim(&claim)?;
            extraction.claim_ids.push(claim.id.clone());
            rows.push(claim);
            room -= 1;
        }
        Ok(rows)
    }

    async fn extract_fragments_validated(
        &self,
        url: &str,
        content: &str,
    ) -> Option<Vec<RawFragment>> {
        let first = match self.llm.extract_fragments(url, content, None).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "fragment extraction call failed");
                return None;
            }
        };
        match parse_fragments(&first) {
            Ok(fragments) => Some(fragments),
            Err(errors) => {
                let feedback = format!(
                    "Previous output failed validation: {}. Previous output was: {}",
                    errors, first
                );
                let second = match self
                    .llm
                    .extract_fragments(url, content, Some(feedback.as_str()))
                    .await
                {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::warn!(error = %e, "fragment extraction retry failed");
                        return None;
                    }
                };
                match parse_fragments(&second) {
                    Ok(fragments) => Some(fragments),
                    Err(errors) => {
                        tracing::warn!(errors = %errors, "fragment batch dropped after retry");
                        None
                    }
                }
            }
        }
    }

    async fn extract_claims_validated(
        &self,
        text: &str,
        hypothesis: &str,
    ) -> Option<Vec<RawClaim>> {
        let first = match self.llm.extract_claims(text, hypothesis, None).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "claim extraction call failed");
                return None;
            }
        };
        match parse_claims(&first) {
            Ok(claims) => Some(claims),
            Err(errors) => {
                let feedback = format!(
                    "Previous output failed validation: {}. Previous output was: {}",
                    errors, first
                );
                let second = match self
                    .llm
                    .extract_claims(text, hypothesis, Some(feedback.as_str()))
                    .await
                {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::warn!(error = %e, "claim extraction retry failed");
                        return None;
                    }
                };
                match parse_claims(&second) {
                    Ok(claims) => Some(claims),
                    Err(errors) => {
                        tracing::warn!(errors = %errors, "claim batch dropped after retry");
                        None
                    }
                }
            }
        }
    }
}

fn normalize_claim_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
