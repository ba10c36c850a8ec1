//! Canonical paper index: one Page per work.
//!
//! Deduplicates the heterogeneous stream of SERP hits and academic API
//! records into stable canonical entries. Merge key order: DOI, then
//! normalized URL, then (normalized title, first-author surname) as a
//! last-resort fuzzy key.

use crate::graph::types::{PageType, PaperMetadata, SourceApi};
use crate::ident;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// One deduplicated work, ready to become (or merge into) a Page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEntry {
    /// Cleaned URL used as the page identity when no DOI exists.
    pub url: String,
    pub domain: String,
    pub title: Option<String>,
    pub doi: Option<String>,
    /// Sticky: once set, a later merge never clears it.
    pub abstract_text: Option<String>,
    pub metadata: PaperMetadata,
    pub page_type: PageType,
    pub first_author: Option<String>,
    /// Best (engine priority, rank) observed across SERP arms.
    pub serp_rank: Option<(u32, u32)>,
}

impl CanonicalEntry {
    /// Build from a SERP hit. Identifier extraction runs over the URL so a
    /// doi.org hit keys by DOI.
    pub fn from_serp(
        url: &str,
        title: Option<&str>,
        snippet: Option<&str>,
        engine_priority: u32,
        rank: u32,
    ) -> Self {
        let ids = ident::extract_from_url(url);
        let doi = ids.doi.or_else(|| {
            snippet
                .map(ident::extract_from_text)
                .and_then(|s| s.doi)
        });
        let cleaned = clean_url(url);
        let domain = domain_of(&cleaned);
        let page_type = if doi.is_some() {
            PageType::Academic
        } else {
            classify_domain(&domain)
        };
        Self {
            url: cleaned,
            domain,
            title: title.map(|t| t.to_string()),
            doi: doi.clone(),
            abstract_text: None,
            metadata: PaperMetadata {
                doi,
                source_api: None,
                ..Default::default()
            },
            page_type,
            first_author: None,
            serp_rank: Some((engine_priority, rank)),
        }
    }

    /// Build from an academic API record.
    #[allow(clippy::too_many_arguments)]
    pub fn from_academic(
        doi: Option<String>,
        url: Option<String>,
        title: Option<String>,
        abstract_text: Option<String>,
        first_author: Option<String>,
        metadata: PaperMetadata,
    ) -> Self {
        let doi = doi.map(|d| ident::normalize_doi(&d));
        let url = url
            .map(|u| clean_url(&u))
            .or_else(|| doi.as_ref().map(|d| format!("https://doi.org/{}", d)))
            .unwrap_or_default();
        let domain = domain_of(&url);
        let mut metadata = metadata;
        metadata.doi = metadata
            .doi
            .take()
            .map(|d| ident::normalize_doi(&d))
            .or_else(|| doi.clone());
        Self {
            url,
            domain,
            title,
            doi,
            abstract_text,
            metadata,
            page_type: PageType::Academic,
            first_author: first_author.map(|a| a.to_lowercase()),
            serp_rank: None,
        }
    }

    fn merge_key(&self) -> MergeKey {
        if let Some(doi) = &self.doi {
            return MergeKey::Doi(ident::normalize_doi(doi));
        }
        let normalized = normalize_url_key(&self.url);
        if !normalized.is_empty() {
            return MergeKey::Url(normalized);
        }
        MergeKey::Fuzzy(
            normalize_title(self.title.as_deref().unwrap_or_default()),
            self.first_author.clone().unwrap_or_default(),
        )
    }

    fn source(&self) -> SourceApi {
        self.metadata.source_api.unwrap_or(SourceApi::Extraction)
    }

    /// Merge another observation of the same work into this entry.
    fn absorb(&mut self, other: CanonicalEntry) {
        let incoming = other.source();
        let incoming_wins = incoming.priority() < self.source().priority();

        if self.doi.is_none() {
            self.doi = other.doi.clone();
        }
        if self.title.is_none() || (incoming_wins && other.title.is_some()) {
            if other.title.is_some() {
                self.title = other.title.clone();
            }
        }
        if self.first_author.is_none() {
            self.first_author = other.first_author.clone();
        }
        // Abstract presence is sticky.
        if self.abstract_text.is_none() {
            self.abstract_text = other.abstract_text.clone();
        }
        if other.page_type == PageType::Academic {
            self.page_type = PageType::Academic;
        }
        self.serp_rank = match (self.serp_rank, other.serp_rank) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.metadata.merge_from(&other.metadata, incoming);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MergeKey {
    Doi(String),
    Url(String),
    Fuzzy(String, String),
}

/// Accumulates entries for one pipeline run and yields the deduplicated
/// set. Ingestion is idempotent: feeding the same stream twice yields the
/// same entries.
#[derive(Default)]
pub struct CanonicalPaperIndex {
    entries: Vec<CanonicalEntry>,
    by_key: HashMap<MergeKey, usize>,
}

impl CanonicalPaperIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one observation; returns the canonical slot index.
    pub fn ingest(&mut self, entry: CanonicalEntry) -> usize {
        let key = entry.merge_key();
        if let Some(&slot) = self.by_key.get(&key) {
            self.entries[slot].absorb(entry);
            return slot;
        }

        // A DOI-keyed entry may still collide with an earlier URL-keyed
        // observation of the same work.
        let url_key = MergeKey::Url(normalize_url_key(&entry.url));
        if let MergeKey::Doi(_) = key {
            if let Some(&slot) = self.by_key.get(&url_key) {
                self.entries[slot].absorb(entry);
                self.by_key.insert(key, slot);
                return slot;
            }
        }

        let slot = self.entries.len();
        self.entries.push(entry);
        if let MergeKey::Url(u) = &url_key {
            if !u.is_empty() {
                self.by_key.entry(url_key.clone()).or_insert(slot);
            }
        }
        self.by_key.insert(key, slot);
        slot
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CanonicalEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<CanonicalEntry> {
        self.entries
    }
}

/// Strip tracking parameters and fragments, keep scheme and path.
pub fn clean_url(raw: &str) -> String {
    const TRACKING: &[&str] = &[
        "utm_source", "utm_medium", "utm_campaign", "utm_term", "utm_content", "fbclid",
        "gclid", "mc_cid", "mc_eid", "ref",
    ];
    match Url::parse(raw) {
        Ok(mut url) => {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| !TRACKING.contains(&k.as_ref()))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            url.set_fragment(None);
            if kept.is_empty() {
                url.set_query(None);
            } else {
                let query: String = kept
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join("&");
                url.set_query(Some(query.as_str()));
            }
            let mut out = url.to_string();
            if out.ends_with('/') && url.path() == "/" {
                out.pop();
            }
            out
        }
        Err(_) => raw.trim().to_string(),
    }
}

/// Scheme-stripped, host-lowercased key for URL-level dedup.
pub fn normalize_url_key(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(url) => {
            let host = url.host_str().unwrap_or_default().to_lowercase();
            let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
            let path = url.path().trim_end_matches('/');
            match url.query() {
                Some(q) => format!("{}{}?{}", host, path, q),
                None => format!("{}{}", host, path),
            }
        }
        Err(_) => raw.trim().to_lowercase(),
    }
}

fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn domain_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
        .map(|h| h.strip_prefix("www.").unwrap_or(&h).to_string())
        .unwrap_or_default()
}

fn classify_domain(domain: &str) -> PageType {
    if domain.ends_with(".edu") || domain.contains("ncbi.nlm.nih.gov") || domain.contains("arxiv.org")
    {
        PageType::Academic
    } else if domain.contains("wikipedia.org") || domain.contains("britannica.com") {
        PageType::Knowledge
    } else if domain.contains("reddit.com")
        || domain.contains("stackexchange.com")
        || domain.contains("news.ycombinator.com")
    {
        PageType::Forum
    } else {
        PageType::Article
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_serp_and_academic_dedup_on_doi() {
        let mut index = CanonicalPaperIndex::new();

        let serp = CanonicalEntry::from_serp(
            "https://doi.org/10.1038/nature12373?utm_source=x",
            Some("A paper"),
            None,
            0,
            1,
        );
        let academic = CanonicalEntry::from_academic(
            Some("10.1038/NATURE12373".to_string()),
            None,
            Some("A paper".to_string()),
            Some("The abstract.".to_string()),
            Some("Smith".to_string()),
            PaperMetadata {
                year: Some(2013),
                source_api: Some(SourceApi::SemanticScholar),
                ..Default::default()
            },
        );

        let a = index.ingest(serp);
        let b = index.ingest(academic);
        assert_eq!(a, b);
        assert_eq!(index.len(), 1);

        let entry = &index.entries()[0];
        assert_eq!(entry.doi.as_deref(), Some("10.1038/nature12373"));
        assert_eq!(entry.abstract_text.as_deref(), Some("The abstract."));
        assert_eq!(entry.metadata.year, Some(2013));
        assert_eq!(entry.metadata.source_api, Some(SourceApi::SemanticScholar));
        assert_eq!(entry.page_type, PageType::Academic);
    }

    #[test]
    fn test_idempotent_ingest() {
        let mut index = CanonicalPaperIndex::new();
        let entry = CanonicalEntry::from_serp("https://x.org/a", Some("t"), None, 0, 1);
        index.ingest(entry.clone());
        index.ingest(entry.clone());
        index.ingest(entry);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_url_dedup_ignores_scheme_and_tracking() {
        let mut index = CanonicalPaperIndex::new();
        index.ingest(CanonicalEntry::from_serp(
            "https://www.example.org/post?utm_campaign=a",
            Some("t"),
            None,
            0,
            1,
        ));
        index.ingest(CanonicalEntry::from_serp(
            "http://example.org/post",
            Some("t"),
            None,
            1,
            3,
        ));
        assert_eq!(index.len(), 1);
        // Best rank wins: engine priority 0 beats 1.
        assert_eq!(index.entries()[0].serp_rank, Some((0, 1)));
    }

    #[test]
    fn test_abstract_is_sticky() {
        let mut index = CanonicalPaperIndex::new();
        index.ingest(CanonicalEntry::from_academic(
            Some("10.1/x".to_string()),
            None,
            None,
            Some("kept".to_string()),
            None,
            PaperMetadata {
                source_api: Some(SourceApi::OpenAlex),
                ..Default::default()
            },
        ));
        // A later higher-priority record without an abstract does not clear it.
        index.ingest(CanonicalEntry::from_academic(
            Some("10.1/x".to_string()),
            None,
            Some("Title".to_string()),
            None,
            None,
            PaperMetadata {
                source_api: Some(SourceApi::SemanticScholar),
                ..Default::default()
            },
        ));
        let entry = &index.entries()[0];
        assert_eq!(entry.abstract_text.as_deref(), Some("kept"));
        assert_eq!(entry.title.as_deref(), Some("Title"));
    }

    #[test]
    fn test_fuzzy_key_on_title_and_author() {
        let mut index = CanonicalPaperIndex::new();
        index.ingest(CanonicalEntry::from_academic(
            None,
            None,
            Some("Attention Is All You Need".to_string()),
            None,
            Some("Vaswani".to_string()),
            PaperMetadata::default(),
        ));
        index.ingest(CanonicalEntry::from_academic(
            None,
            None,
            Some("attention is all you need!".to_string()),
            Some("abs".to_string()),
            Some("VASWANI".to_string()),
            PaperMetadata::default(),
        ));
        assert_eq!(index.len(), 1);
        assert_eq!(index.entries()[0].abstract_text.as_deref(), Some("abs"));
    }

    #[test]
    fn test_clean_url() {
        assert_eq!(
            clean_url("https://x.org/a?utm_source=s&q=1#frag"),
            "https://x.org/a?q=1"
        );
        assert_eq!(clean_url("https://x.org/"), "https://x.org");
    }

    #[test]
    fn test_normalize_url_key() {
        assert_eq!(
            normalize_url_key("https://WWW.Example.org/a/"),
            "example.org/a"
        );
        assert_eq!(
            normalize_url_key("http://example.org/a"),
            "example.org/a"
        );
    }

    #[test]
    fn test_domain_classification() {
        assert_eq!(classify_domain("en.wikipedia.org"), PageType::Knowledge);
        assert_eq!(classify_domain("reddit.com"), PageType::Forum);
        assert_eq!(classify_domain("mit.edu"), PageType::Academic);
        assert_eq!(classify_domain("nytimes.com"), PageType::Article);
    }
}
