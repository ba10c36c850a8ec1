//! Evidence graph engine: per-task projection and Bayesian aggregation.
//!
//! The projection is built per request and not shared across concurrent
//! callers; persisted edges are the serialization point. Derived
//! evidence_source edges exist only inside this projection.

use crate::error::Result;
use crate::graph::types::*;
use crate::storage::store::Store;
use std::collections::{HashMap, HashSet};

/// Beta-distribution aggregate over a claim's NLI edges.
///
/// alpha = 1 + sum of supporting confidences, beta = 1 + sum of refuting
/// confidences. Neutral edges are counted but update neither. The
/// extractor's llm_confidence is never an input.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimAggregate {
    pub claim_id: ClaimId,
    pub alpha: f64,
    pub beta: f64,
    pub bayesian_truth_confidence: f64,
    pub variance: f64,
    pub uncertainty: f64,
    pub controversy: f64,
    pub supporting: u32,
    pub refuting: u32,
    pub neutral: u32,
}

impl ClaimAggregate {
    /// Aggregate NLI edges targeting one claim. An optional calibration
    /// transform may be applied to each confidence; passing None must give
    /// identical results to the identity transform.
    pub fn from_edges<'a, I>(
        claim_id: ClaimId,
        edges: I,
        transform: Option<&dyn Fn(f64) -> f64>,
    ) -> Self
    where
        I: IntoIterator<Item = &'a Edge>,
    {
        let mut alpha = 1.0;
        let mut beta = 1.0;
        let mut supporting = 0u32;
        let mut refuting = 0u32;
        let mut neutral = 0u32;

        for edge in edges {
            let confidence = edge.nli_confidence.unwrap_or(0.0);
            let confidence = match transform {
                Some(f) => f(confidence).clamp(0.0, 1.0),
                None => confidence,
            };
            match edge.relation {
                Relation::Supports => {
                    alpha += confidence;
                    supporting += 1;
                }
                Relation::Refutes => {
                    beta += confidence;
                    refuting += 1;
                }
                Relation::Neutral => neutral += 1,
                _ => {}
            }
        }

        let total = alpha + beta;
        let variance = (alpha * beta) / (total * total * (total + 1.0));
        let controversy = if total > 2.0 {
            (alpha - 1.0).min(beta - 1.0) / (total - 2.0)
        } else {
            0.0
        };

        Self {
            claim_id,
            alpha,
            beta,
            bayesian_truth_confidence: alpha / total,
            variance,
            uncertainty: variance.sqrt(),
            controversy,
            supporting,
            refuting,
            neutral,
        }
    }

    /// Both supporting and refuting evidence present.
    pub fn is_contested(&self) -> bool {
        self.supporting > 0 && self.refuting > 0
    }
}

/// Per-task in-memory projection of the evidence graph.
pub struct EvidenceGraph {
    task_id: TaskId,
    nli_edges: Vec<Edge>,
    cites_edges: Vec<Edge>,
    /// Derived Claim -> Page edges, deduplicated by (claim, page).
    evidence_source: Vec<EvidenceSourceEdge>,
    /// Fragment id -> owning page id, for edge traversal.
    fragment_pages: HashMap<String, PageId>,
    source_pages: Vec<PageId>,
}

impl EvidenceGraph {
    /// Load the projection for a task.
    ///
    /// Ingests (a) the task's claim-incident NLI edges, (b) cites edges
    /// whose source page is one of the task's source pages, (c) derived
    /// evidence_source edges synthesized from (a) and the fragments'
    /// page ids. Derived edges are held only in memory.
    pub fn load_from_db(store: &Store, task_id: &TaskId) -> Result<Self> {
        let nli_edges = store.nli_edges_for_task(task_id)?;

        let fragment_ids: Vec<FragmentId> = nli_edges
            .iter()
            .filter_map(|e| FragmentId::parse(&e.source_id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let fragments = store.fragments_by_ids(&fragment_ids)?;
        let fragment_pages: HashMap<String, PageId> = fragments
            .iter()
            .map(|f| (f.id.to_string(), f.page_id.clone()))
            .collect();

        let source_pages: Vec<PageId> = {
            let set: HashSet<PageId> = fragment_pages.values().cloned().collect();
            set.into_iter().collect()
        };
        let cites_edges = store.cites_edges_from_pages(&source_pages)?;

        let mut seen = HashSet::new();
        let mut evidence_source = Vec::new();
        for edge in &nli_edges {
            let claim_id = match ClaimId::parse(&edge.target_id) {
                Some(id) => id,
                None => continue,
            };
            let page_id = match fragment_pages.get(&edge.source_id) {
                Some(id) => id.clone(),
                None => continue,
            };
            let derived = EvidenceSourceEdge { claim_id, page_id };
            if seen.insert((derived.claim_id.clone(), derived.page_id.clone())) {
                evidence_source.push(derived);
            }
        }

        Ok(Self {
            task_id: task_id.clone(),
            nli_edges,
            cites_edges,
            evidence_source,
            fragment_pages,
            source_pages,
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn nli_edges(&self) -> &[Edge] {
        &self.nli_edges
    }

    pub fn cites_edges(&self) -> &[Edge] {
        &self.cites_edges
    }

    /// Derived evidence_source edges; never persisted.
    pub fn evidence_source_edges(&self) -> &[EvidenceSourceEdge] {
        &self.evidence_source
    }

    /// Pages with at least one fragment bearing a claim edge into the task.
    pub fn source_pages(&self) -> &[PageId] {
        &self.source_pages
    }

    /// The page a fragment belongs to, when known to this projection.
    pub fn page_of_fragment(&self, fragment_id: &FragmentId) -> Option<&PageId> {
        self.fragment_pages.get(&fragment_id.to_string())
    }

    /// Aggregate one claim's edges.
    pub fn claim_aggregate(&self, claim_id: &ClaimId) -> ClaimAggregate {
        let key = claim_id.to_string();
        ClaimAggregate::from_edges(
            claim_id.clone(),
            self.nli_edges.iter().filter(|e| e.target_id == key),
            None,
        )
    }

    /// Aggregates for every claim with at least one edge.
    pub fn all_claim_aggregates(&self) -> Vec<ClaimAggregate> {
        let mut by_claim: HashMap<String, Vec<&Edge>> = HashMap::new();
        for edge in &self.nli_edges {
            by_claim.entry(edge.target_id.clone()).or_default().push(edge);
        }
        let mut aggregates: Vec<ClaimAggregate> = by_claim
            .into_iter()
            .filter_map(|(claim_str, edges)| {
                ClaimId::parse(&claim_str).map(|id| {
                    ClaimAggregate::from_edges(id, edges.into_iter(), None)
                })
            })
            .collect();
        aggregates.sort_by(|a, b| a.claim_id.to_string().cmp(&b.claim_id.to_string()));
        aggregates
    }

    /// Claims with both supporting and refuting evidence.
    pub fn contradictions(&self) -> Vec<ClaimAggregate> {
        self.all_claim_aggregates()
            .into_iter()
            .filter(|a| a.is_contested())
            .collect()
    }

    /// Claims whose evidence spans more than one source page; candidates
    /// for cross-source NLI verification.
    pub fn multi_source_claims(&self) -> Vec<ClaimId> {
        let mut pages_per_claim: HashMap<ClaimId, HashSet<PageId>> = HashMap::new();
        for derived in &self.evidence_source {
            pages_per_claim
                .entry(derived.claim_id.clone())
                .or_default()
                .insert(derived.page_id.clone());
        }
        let mut claims: Vec<ClaimId> = pages_per_claim
            .into_iter()
            .filter(|(_, pages)| pages.len() > 1)
            .map(|(claim, _)| claim)
            .collect();
        claims.sort_by_key(|c| c.to_string());
        claims
    }

    /// Pages cited from source pages but not themselves source pages.
    pub fn reference_candidates(&self) -> Vec<PageId> {
        let sources: HashSet<String> =
            self.source_pages.iter().map(|p| p.to_string()).collect();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for edge in &self.cites_edges {
            if !sources.contains(&edge.target_id) {
                if let Some(id) = PageId::parse(&edge.target_id) {
                    if seen.insert(edge.target_id.clone()) {
                        candidates.push(id);
                    }
                }
            }
        }
        candidates
    }
}
