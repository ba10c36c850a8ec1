//! Fragment/claim extraction and NLI judging.
//!
//! Drives the LLM extractor over page content, validates its loosely-typed
//! output through the typed layer in [`validate`], and judges
//! fragment-claim candidate pairs with the NLI collaborator. LLM output
//! never reaches the graph without passing the validated constructors.

pub mod clients;
pub mod extractor;
pub mod nli;
pub mod validate;

pub use clients::{HttpEmbeddingClient, HttpLlmExtractor, HttpNliClassifier};
pub use extractor::{FragmentClaimExtractor, PageExtraction};
pub use nli::{cosine_similarity, select_candidate_pairs, CandidatePair};
pub use validate::{parse_claims, parse_fragments, RawClaim, RawFragment, ValidationErrors};

use crate::error::Result;
use crate::graph::types::Relation;
use async_trait::async_trait;

/// LLM extractor collaborator.
///
/// Methods return the model's raw JSON text; the caller validates it and
/// retries once with the parser errors appended as feedback.
#[async_trait]
pub trait LlmExtractor: Send + Sync {
    /// Segment rendered page content into typed fragments.
    async fn extract_fragments(
        &self,
        url: &str,
        content: &str,
        feedback: Option<&str>,
    ) -> Result<String>;

    /// Extract claims relevant to the hypothesis from the given text.
    async fn extract_claims(
        &self,
        text: &str,
        hypothesis: &str,
        feedback: Option<&str>,
    ) -> Result<String>;
}

/// One NLI verdict on a (premise, hypothesis) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NliJudgement {
    /// supports, refutes or neutral.
    pub label: Relation,
    /// Raw classifier score in [0, 1], before any calibration.
    pub score: f64,
}

/// NLI classifier collaborator.
#[async_trait]
pub trait NliClassifier: Send + Sync {
    async fn classify(&self, premise: &str, hypothesis: &str) -> Result<NliJudgement>;
}

/// Embedding collaborator.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}
