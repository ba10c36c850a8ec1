//! Cross-source identifier extraction and resolution.
//!
//! Extracts DOI, PMID and arXiv ids from URLs and free text, and resolves
//! non-DOI identifiers to a DOI through the academic metadata gateway. A
//! null resolution is a legitimate outcome, not an error.

use crate::error::Result;
use crate::search::academic::AcademicClient;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static DOI_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)doi\.org/(10\.\d{4,}(?:\.\d+)*/[^\s?#&]+)").expect("doi url pattern")
});

static DOI_TEXT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(10\.\d{4,}(?:\.\d+)*/[^\s\]>,;\)\x22']+)").expect("doi text pattern")
});

static PMID_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)pubmed\.ncbi\.nlm\.nih\.gov/(\d{1,9})").expect("pmid url pattern")
});

static PMID_TEXT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bPMID:?\s*(\d{1,9})\b").expect("pmid text pattern")
});

static ARXIV_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)arxiv\.org/(?:abs|pdf)/(\d{4}\.\d{4,5}(?:v\d+)?)").expect("arxiv url pattern")
});

static ARXIV_TEXT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\barXiv:\s*(\d{4}\.\d{4,5}(?:v\d+)?)\b").expect("arxiv text pattern")
});

/// Regulatory-source URL shapes (NIH reports, EMA documents) that carry a
/// DOI in the path.
static REGULATORY_DOI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:ncbi\.nlm\.nih\.gov|ema\.europa\.eu)/[^\s]*?(10\.\d{4,}/[^\s?#&]+)")
        .expect("regulatory pattern")
});

/// Identifiers found in one URL or text snippet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierSet {
    pub doi: Option<String>,
    pub pmid: Option<String>,
    pub arxiv_id: Option<String>,
}

impl IdentifierSet {
    pub fn is_empty(&self) -> bool {
        self.doi.is_none() && self.pmid.is_none() && self.arxiv_id.is_none()
    }
}

/// Extract identifiers from a URL.
pub fn extract_from_url(url: &str) -> IdentifierSet {
    let mut set = IdentifierSet::default();
    if let Some(caps) = DOI_URL_PATTERN.captures(url) {
        set.doi = Some(normalize_doi(&caps[1]));
    } else if let Some(caps) = REGULATORY_DOI_PATTERN.captures(url) {
        set.doi = Some(normalize_doi(&caps[1]));
    }
    if let Some(caps) = PMID_URL_PATTERN.captures(url) {
        set.pmid = Some(caps[1].to_string());
    }
    if let Some(caps) = ARXIV_URL_PATTERN.captures(url) {
        set.arxiv_id = Some(caps[1].to_lowercase());
    }
    set
}

/// Extract identifiers from free text.
pub fn extract_from_text(text: &str) -> IdentifierSet {
    let mut set = IdentifierSet::default();
    if let Some(caps) = DOI_TEXT_PATTERN.captures(text) {
        set.doi = Some(normalize_doi(&caps[1]));
    }
    if let Some(caps) = PMID_TEXT_PATTERN.captures(text) {
        set.pmid = Some(caps[1].to_string());
    }
    if let Some(caps) = ARXIV_TEXT_PATTERN.captures(text) {
        set.arxiv_id = Some(caps[1].to_lowercase());
    }
    set
}

/// Extract from a URL first, falling back to text-level patterns on the
/// same string (SERP snippets sometimes embed bare DOIs).
pub fn extract(input: &str) -> IdentifierSet {
    let from_url = extract_from_url(input);
    if !from_url.is_empty() {
        return from_url;
    }
    extract_from_text(input)
}

/// Lowercased bare DOI, with trailing punctuation stripped.
pub fn normalize_doi(doi: &str) -> String {
    doi.trim()
        .trim_start_matches("https://doi.org/")
        .trim_start_matches("http://doi.org/")
        .trim_start_matches("doi:")
        .trim_end_matches(['.', ',', ';', ')'])
        .to_lowercase()
}

/// Resolve a non-DOI identifier set to a DOI through the academic gateway.
///
/// PMID and arXiv are both tried before giving up; the first hit wins.
pub async fn resolve_to_doi(
    set: &IdentifierSet,
    academic: &dyn AcademicClient,
) -> Result<Option<String>> {
    if let Some(doi) = &set.doi {
        return Ok(Some(doi.clone()));
    }

    if let Some(pmid) = &set.pmid {
        match academic.doi_for_external_id("pmid", pmid).await {
            Ok(Some(doi)) => return Ok(Some(normalize_doi(&doi))),
            Ok(None) => {}
            Err(e) => tracing::debug!(pmid = %pmid, error = %e, "pmid resolution failed"),
        }
    }

    if let Some(arxiv_id) = &set.arxiv_id {
        match academic.doi_for_external_id("arxiv", arxiv_id).await {
            Ok(Some(doi)) => return Ok(Some(normalize_doi(&doi))),
            Ok(None) => {}
            Err(e) => tracing::debug!(arxiv = %arxiv_id, error = %e, "arxiv resolution failed"),
        }
    }

    Ok(None)
}
