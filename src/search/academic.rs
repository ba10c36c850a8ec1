//! Academic metadata clients: Semantic Scholar and OpenAlex.
//!
//! Two-pillar gateway; on conflicting non-null fields Semantic Scholar
//! outranks OpenAlex. Each client speaks its API's own response shape and
//! maps it into [`PaperRecord`].

use crate::error::{Error, Result};
use crate::graph::types::{PaperMetadata, SourceApi};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// A normalized academic work record.
#[derive(Debug, Clone, Default)]
pub struct PaperRecord {
    pub title: Option<String>,
    pub doi: Option<String>,
    pub url: Option<String>,
    pub abstract_text: Option<String>,
    pub year: Option<i32>,
    pub venue: Option<String>,
    pub citation_count: Option<u32>,
    pub paper_id: Option<String>,
    pub first_author: Option<String>,
    pub source: SourceApi,
}

impl PaperRecord {
    /// Paper metadata for the canonical index, tagged with the source.
    pub fn metadata(&self) -> PaperMetadata {
        PaperMetadata {
            year: self.year,
            doi: self.doi.clone(),
            venue: self.venue.clone(),
            citation_count: self.citation_count,
            source_api: Some(self.source),
            paper_id: self.paper_id.clone(),
        }
    }
}

/// Academic metadata gateway.
#[async_trait]
pub trait AcademicClient: Send + Sync {
    /// Look up one work by DOI.
    async fn paper_by_doi(&self, doi: &str) -> Result<Option<PaperRecord>>;

    /// Keyword search.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<PaperRecord>>;

    /// Works referenced by the given DOI, one hop.
    async fn references(&self, doi: &str) -> Result<Vec<PaperRecord>>;

    /// Resolve an external id ("pmid" or "arxiv") to a DOI.
    async fn doi_for_external_id(&self, scheme: &str, id: &str) -> Result<Option<String>>;

    fn source(&self) -> SourceApi;
}

fn build_http_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_default()
}

/// Map a non-success response into the error taxonomy.
fn classify_status(source: &str, status: StatusCode, retry_after: Option<u64>) -> Error {
    if status == StatusCode::TOO_MANY_REQUESTS {
        Error::rate_limited(source, retry_after)
    } else if status.is_server_error() {
        Error::transient(format!("{} returned {}", source, status))
    } else {
        Error::Http(format!("{} returned {}", source, status))
    }
}

fn retry_after_ms(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(|secs| secs * 1000)
}

// ==================== Semantic Scholar ====================

/// Semantic Scholar Graph API client.
pub struct SemanticScholarClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

const S2_FIELDS: &str = "title,externalIds,abstract,year,venue,citationCount,paperId,authors,url";

#[derive(Debug, Deserialize)]
struct S2Paper {
    #[serde(default)]
    title: Option<String>,
    #[serde(default, rename = "externalIds")]
    external_ids: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, rename = "abstract")]
    abstract_text: Option<String>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    venue: Option<String>,
    #[serde(default, rename = "citationCount")]
    citation_count: Option<u32>,
    #[serde(default, rename = "paperId")]
    paper_id: Option<String>,
    #[serde(default)]
    authors: Vec<S2Author>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct S2Author {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct S2SearchResponse {
    #[serde(default)]
    data: Vec<S2Paper>,
}

#[derive(Debug, Deserialize)]
struct S2ReferencesResponse {
    #[serde(default)]
    data: Vec<S2Reference>,
}

#[derive(Debug, Deserialize)]
struct S2Reference {
    #[serde(rename = "citedPaper")]
    cited_paper: Option<S2Paper>,
}

impl SemanticScholarClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.semanticscholar.org/graph/v1";

    pub fn new(base_url: Option<String>, api_key: Option<String>, timeout_secs: u64) -> Self {
        Self {
            http: build_http_client(timeout_secs),
            base_url: base_url.unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string()),
            api_key,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        let mut request = self.http.get(url);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let retry = retry_after_ms(&response);
            return Err(classify_status("semantic_scholar", status, retry));
        }
        let body = response.text().await?;
        let parsed = serde_json::from_str(&body)
            .map_err(|e| Error::Http(format!("semantic_scholar parse: {}", e)))?;
        Ok(Some(parsed))
    }

    fn to_record(paper: S2Paper) -> PaperRecord {
        let doi = paper.external_ids.as_ref().and_then(|ids| {
            ids.get("DOI")
                .and_then(|v| v.as_str())
                .map(|d| d.to_lowercase())
        });
        PaperRecord {
            first_author: paper
                .authors
                .first()
                .and_then(|a| a.name.as_ref())
                .and_then(|n| n.split_whitespace().last())
                .map(|s| s.to_string()),
            title: paper.title,
            doi,
            url: paper.url,
            abstract_text: paper.abstract_text,
            year: paper.year,
            venue: paper.venue,
            citation_count: paper.citation_count,
            paper_id: paper.paper_id,
            source: SourceApi::SemanticScholar,
        }
    }
}

#[async_trait]
impl AcademicClient for SemanticScholarClient {
    async fn paper_by_doi(&self, doi: &str) -> Result<Option<PaperRecord>> {
        let url = format!("{}/paper/DOI:{}?fields={}", self.base_url, doi, S2_FIELDS);
        Ok(self.get_json::<S2Paper>(&url).await?.map(Self::to_record))
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<PaperRecord>> {
        let url = format!(
            "{}/paper/search?query={}&limit={}&fields={}",
            self.base_url,
            urlencode(query),
            limit,
            S2_FIELDS
        );
        let response: Option<S2SearchResponse> = self.get_json(&url).await?;
        Ok(response
            .map(|r| r.data.into_iter().map(Self::to_record).collect())
            .unwrap_or_default())
    }

    async fn references(&self, doi: &str) -> Result<Vec<PaperRecord>> {
        let url = format!(
            "{}/paper/DOI:{}/references?fields={}&limit=100",
            self.base_url, doi, S2_FIELDS
        );
        let response: Option<S2ReferencesResponse> = self.get_json(&url).await?;
        Ok(response
            .map(|r| {
                r.data
                    .into_iter()
                    .filter_map(|reference| reference.cited_paper)
                    .map(Self::to_record)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn doi_for_external_id(&self, scheme: &str, id: &str) -> Result<Option<String>> {
        let prefix = match scheme {
            "pmid" => "PMID",
            "arxiv" => "ARXIV",
            other => {
                return Err(Error::invalid_input("scheme", format!("pmid|arxiv, got {}", other)))
            }
        };
        let url = format!(
            "{}/paper/{}:{}?fields=externalIds",
            self.base_url, prefix, id
        );
        let paper: Option<S2Paper> = self.get_json(&url).await?;
        Ok(paper.and_then(|p| {
            p.external_ids
                .and_then(|ids| ids.get("DOI").and_then(|v| v.as_str().map(|d| d.to_lowercase())))
        }))
    }

    fn source(&self) -> SourceApi {
        SourceApi::SemanticScholar
    }
}

// ==================== OpenAlex ====================

/// OpenAlex works API client.
pub struct OpenAlexClient {
    http: Client,
    base_url: String,
    polite_contact: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaWork {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    doi: Option<String>,
    #[serde(default)]
    publication_year: Option<i32>,
    #[serde(default)]
    cited_by_count: Option<u32>,
    #[serde(default)]
    primary_location: Option<OaLocation>,
    #[serde(default)]
    abstract_inverted_index: Option<HashMap<String, Vec<u32>>>,
    #[serde(default)]
    authorships: Vec<OaAuthorship>,
    #[serde(default)]
    referenced_works: Vec<String>,
    #[serde(default)]
    ids: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct OaLocation {
    #[serde(default)]
    landing_page_url: Option<String>,
    #[serde(default)]
    source: Option<OaSource>,
}

#[derive(Debug, Deserialize)]
struct OaSource {
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaAuthorship {
    #[serde(default)]
    author: Option<OaAuthor>,
}

#[derive(Debug, Deserialize)]
struct OaAuthor {
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaSearchResponse {
    #[serde(default)]
    results: Vec<OaWork>,
}

impl OpenAlexClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.openalex.org";

    pub fn new(base_url: Option<String>, polite_contact: Option<String>, timeout_secs: u64) -> Self {
        Self {
            http: build_http_client(timeout_secs),
            base_url: base_url.unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string()),
            polite_contact,
        }
    }

    fn with_mailto(&self, url: String) -> String {
        match &self.polite_contact {
            Some(contact) => {
                let sep = if url.contains('?') { '&' } else { '?' };
                format!("{}{}mailto={}", url, sep, urlencode(contact))
            }
            None => url,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let retry = retry_after_ms(&response);
            return Err(classify_status("openalex", status, retry));
        }
        let body = response.text().await?;
        let parsed = serde_json::from_str(&body)
            .map_err(|e| Error::Http(format!("openalex parse: {}", e)))?;
        Ok(Some(parsed))
    }

    fn to_record(work: OaWork) -> PaperRecord {
        PaperRecord {
            first_author: work
                .authorships
                .first()
                .and_then(|a| a.author.as_ref())
                .and_then(|a| a.display_name.as_ref())
                .and_then(|n| n.split_whitespace().last())
                .map(|s| s.to_string()),
            abstract_text: work
                .abstract_inverted_index
                .as_ref()
                .map(reconstruct_abstract),
            url: work
                .primary_location
                .as_ref()
                .and_then(|l| l.landing_page_url.clone()),
            venue: work
                .primary_location
                .as_ref()
                .and_then(|l| l.source.as_ref())
                .and_then(|s| s.display_name.clone()),
            doi: work
                .doi
                .as_ref()
                .map(|d| crate::ident::normalize_doi(d)),
            title: work.title,
            year: work.publication_year,
            citation_count: work.cited_by_count,
            paper_id: work.id,
            source: SourceApi::OpenAlex,
        }
    }
}

/// Rebuild plain text from OpenAlex's inverted abstract index.
fn reconstruct_abstract(index: &HashMap<String, Vec<u32>>) -> String {
    let mut positions: Vec<(u32, &str)> = Vec::new();
    for (word, offsets) in index {
        for &offset in offsets {
            positions.push((offset, word.as_str()));
        }
    }
    positions.sort_by_key(|(offset, _)| *offset);
    positions
        .into_iter()
        .map(|(_, word)| word)
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl AcademicClient for OpenAlexClient {
    async fn paper_by_doi(&self, doi: &str) -> Result<Option<PaperRecord>> {
        let url = self.with_mailto(format!(
            "{}/works/https://doi.org/{}",
            self.base_url, doi
        ));
        Ok(self.get_json::<OaWork>(&url).await?.map(Self::to_record))
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<PaperRecord>> {
        let url = self.with_mailto(format!(
            "{}/works?search={}&per-page={}",
            self.base_url,
            urlencode(query),
            limit
        ));
        let response: Option<OaSearchResponse> = self.get_json(&url).await?;
        Ok(response
            .map(|r| r.results.into_iter().map(Self::to_record).collect())
            .unwrap_or_default())
    }

    async fn references(&self, doi: &str) -> Result<Vec<PaperRecord>> {
        let work = match self
            .get_json::<OaWork>(&self.with_mailto(format!(
                "{}/works/https://doi.org/{}",
                self.base_url, doi
            )))
            .await?
        {
            Some(work) => work,
            None => return Ok(Vec::new()),
        };

        // referenced_works carries OpenAlex ids; resolve them in one
        // filtered listing call rather than N lookups.
        if work.referenced_works.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<&str> = work
            .referenced_works
            .iter()
            .take(50)
            .filter_map(|w| w.rsplit('/').next())
            .collect();
        let url = self.with_mailto(format!(
            "{}/works?filter=openalex_id:{}&per-page=50",
            self.base_url,
            ids.join("|")
        ));
        let response: Option<OaSearchResponse> = self.get_json(&url).await?;
        Ok(response
            .map(|r| r.results.into_iter().map(Self::to_record).collect())
            .unwrap_or_default())
    }

    async fn doi_for_external_id(&self, scheme: &str, id: &str) -> Result<Option<String>> {
        let filter = match scheme {
            "pmid" => format!("{}/works?filter=ids.pmid:{}", self.base_url, id),
            "arxiv" => {
                // OpenAlex has no direct arXiv filter; the title-level
                // search on the id is a usable proxy.
                format!("{}/works?search={}", self.base_url, urlencode(id))
            }
            other => {
                return Err(Error::invalid_input("scheme", format!("pmid|arxiv, got {}", other)))
            }
        };
        let url = self.with_mailto(filter);
        let response: Option<OaSearchResponse> = self.get_json(&url).await?;
        Ok(response
            .and_then(|r| r.results.into_iter().next())
            .and_then(|w| w.doi.map(|d| crate::ident::normalize_doi(&d))))
    }

    fn source(&self) -> SourceApi {
        SourceApi::OpenAlex
    }
}

// ==================== Two-pillar gateway ====================

/// Gateway over both pillars. Lookups try Semantic Scholar first, then
/// OpenAlex; searches run both and concatenate (the canonical index
/// deduplicates downstream). Failure of one pillar never cancels the other.
pub struct AcademicGateway {
    clients: Vec<std::sync::Arc<dyn AcademicClient>>,
}

impl AcademicGateway {
    pub fn new(clients: Vec<std::sync::Arc<dyn AcademicClient>>) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl AcademicClient for AcademicGateway {
    async fn paper_by_doi(&self, doi: &str) -> Result<Option<PaperRecord>> {
        for client in &self.clients {
            match client.paper_by_doi(doi).await {
                Ok(Some(record)) => return Ok(Some(record)),
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(source = %client.source(), error = %e, "doi lookup failed");
                    continue;
                }
            }
        }
        Ok(None)
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<PaperRecord>> {
        let mut all = Vec::new();
        for client in &self.clients {
            match client.search(query, limit).await {
                Ok(mut records) => all.append(&mut records),
                Err(e) => {
                    tracing::warn!(source = %client.source(), error = %e, "search failed")
                }
            }
        }
        Ok(all)
    }

    async fn references(&self, doi: &str) -> Result<Vec<PaperRecord>> {
        for client in &self.clients {
            match client.references(doi).await {
                Ok(records) if !records.is_empty() => return Ok(records),
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(source = %client.source(), error = %e, "references failed");
                    continue;
                }
            }
        }
        Ok(Vec::new())
    }

    async fn doi_for_external_id(&self, scheme: &str, id: &str) -> Result<Option<String>> {
        for client in &self.clients {
            match client.doi_for_external_id(scheme, id).await {
                Ok(Some(doi)) => return Ok(Some(doi)),
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(source = %client.source(), error = %e, "external id failed");
                    continue;
                }
            }
        }
        Ok(None)
    }

    fn source(&self) -> SourceApi {
        SourceApi::SemanticScholar
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}
