//! Browser-driven SERP collaborator client.
//!
//! The actual browser lives behind a driver endpoint; this client speaks a
//! small JSON protocol to it and classifies challenge responses. The SERP
//! lane is a single-slot resource upstream (a shared browser profile), so
//! callers hold the scheduler's SERP permit around [`SerpClient::search`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// One search engine result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerpResult {
    pub url: String,
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub engine: String,
    /// 1-based rank within the engine's result page.
    pub rank: u32,
}

/// SERP collaborator interface.
#[async_trait]
pub trait SerpClient: Send + Sync {
    /// Run one query against the named engine.
    async fn search(&self, query: &str, engine: &str, page: u32) -> Result<Vec<SerpResult>>;
}

/// Per-engine circuit breaker: consecutive failures open the circuit until
/// an auth resolution (or success) resets it.
#[derive(Debug)]
pub struct EngineBreaker {
    threshold: u32,
    failures: Mutex<HashMap<String, u32>>,
}

impl EngineBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_open(&self, engine: &str) -> bool {
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.get(engine).copied().unwrap_or(0) >= self.threshold
    }

    pub fn record_failure(&self, engine: &str) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        *failures.entry(engine.to_string()).or_insert(0) += 1;
    }

    pub fn record_success(&self, engine: &str) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.remove(engine);
    }

    /// Reset all engines, e.g. after an auth challenge was solved.
    pub fn reset(&self) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.clear();
    }
}

/// HTTP client for the browser driver endpoint.
pub struct BrowserSerpClient {
    http: Client,
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct DriverRequest<'a> {
    query: &'a str,
    engine: &'a str,
    page: u32,
}

#[derive(Debug, Deserialize)]
struct DriverResponse {
    #[serde(default)]
    results: Vec<DriverResult>,
    #[serde(default)]
    challenge: Option<DriverChallenge>,
}

#[derive(Debug, Deserialize)]
struct DriverResult {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    snippet: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriverChallenge {
    domain: String,
    #[serde(rename = "type")]
    challenge_type: String,
}

impl BrowserSerpClient {
    pub fn new(endpoint: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SerpClient for BrowserSerpClient {
    async fn search(&self, query: &str, engine: &str, page: u32) -> Result<Vec<SerpResult>> {
        let request = DriverRequest { query, engine, page };
        let response = self
            .http
            .post(format!("{}/serp", self.endpoint))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::transient(format!(
                "serp driver returned {} for {}",
                status, engine
            )));
        }

        let body: DriverResponse = response
            .json()
            .await
            .map_err(|e| Error::Http(format!("serp driver parse: {}", e)))?;

        if let Some(challenge) = body.challenge {
            return Err(Error::auth_challenge(challenge.domain, challenge.challenge_type));
        }

        Ok(body
            .results
            .into_iter()
            .enumerate()
            .map(|(i, r)| SerpResult {
                url: r.url,
                title: r.title,
                snippet: r.snippet,
                engine: engine.to_string(),
                rank: i as u32 + 1,
            })
            .collect())
    }
}

/// Order merged SERP results by (rank, engine priority).
pub fn order_results(results: &mut [SerpResult], engine_priority: &[String]) {
    let priority_of = |engine: &str| -> usize {
        engine_priority
            .iter()
            .position(|e| e == engine)
            .unwrap_or(engine_priority.len())
    };
    results.sort_by(|a, b| {
        a.rank
            .cmp(&b.rank)
            .then_with(|| priority_of(&a.engine).cmp(&priority_of(&b.engine)))
    });
}

/// Cache key for a SERP request tuple.
pub fn cache_key(normalized_query: &str, engines: &[String], time_range: Option<&str>, page: u32) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(normalized_query.as_bytes());
    hasher.update(b"|");
    hasher.update(engines.join(",").as_bytes());
    hasher.update(b"|");
    hasher.update(time_range.unwrap_or_default().as_bytes());
    hasher.update(b"|");
    hasher.update(page.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lowercased, whitespace-collapsed query for cache keying.
pub fn normalize_query(query: &str) -> String {
    query.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_breaker_opens_and_resets() {
        let breaker = EngineBreaker::new(2);
        assert!(!breaker.is_open("ddg"));
        breaker.record_failure("ddg");
        assert!(!breaker.is_open("ddg"));
        breaker.record_failure("ddg");
        assert!(breaker.is_open("ddg"));
        // Other engines unaffected.
        assert!(!breaker.is_open("brave"));

        breaker.reset();
        assert!(!breaker.is_open("ddg"));

        breaker.record_failure("ddg");
        breaker.record_success("ddg");
        assert!(!breaker.is_open("ddg"));
    }

    #[test]
    fn test_order_results() {
        let engines = vec!["ddg".to_string(), "brave".to_string()];
        let mut results = vec![
            SerpResult {
                url: "https://b".into(),
                title: None,
                snippet: None,
                engine: "brave".into(),
                rank: 1,
            },
            SerpResult {
                url: "https://a".into(),
                title: None,
                snippet: None,
                engine: "ddg".into(),
                rank: 1,
            },
            SerpResult {
                url: "https://c".into(),
                title: None,
                snippet: None,
                engine: "ddg".into(),
                rank: 2,
            },
        ];
        order_results(&mut results, &engines);
        // Same rank: ddg outranks brave by engine priority.
        assert_eq!(results[0].url, "https://a");
        assert_eq!(results[1].url, "https://b");
        assert_eq!(results[2].url, "https://c");
    }

    #[test]
    fn test_cache_key_sensitivity() {
        let engines = vec!["ddg".to_string()];
        let a = cache_key("q", &engines, None, 1);
        let b = cache_key("q", &engines, None, 2);
        let c = cache_key("q", &engines, Some("y"), 1);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, cache_key("q", &engines, None, 1));
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("  DPP-4   Inhibitors "), "dpp-4 inhibitors");
    }

    #[test]
    fn test_challenge_response_maps_to_auth_error() {
        let body: DriverResponse = serde_json::from_str(
            r#"{"results": [], "challenge": {"domain": "google.com", "type": "captcha"}}"#,
        )
        .unwrap();
        assert!(body.challenge.is_some());
        let challenge = body.challenge.unwrap();
        let err = Error::auth_challenge(challenge.domain, challenge.challenge_type);
        assert_eq!(err.kind(), "auth_challenge");
    }
}
