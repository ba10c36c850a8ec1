//! HTTP clients for the LLM, NLI and embedding collaborator services.

use crate::config::CollaboratorConfig;
use crate::error::{Error, Result};
use crate::extract::{EmbeddingClient, LlmExtractor, NliClassifier, NliJudgement};
use crate::graph::types::Relation;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn build_http_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_default()
}

async fn post_json<Req: Serialize, Resp: serde::de::DeserializeOwned>(
    http: &Client,
    url: &str,
    service: &str,
    request: &Req,
) -> Result<Resp> {
    let response = http.post(url).json(request).send().await?;
    let status = response.status();
    if status.as_u16() == 429 {
        return Err(Error::rate_limited(service, None));
    }
    if status.is_server_error() {
        return Err(Error::transient(format!("{} returned {}", service, status)));
    }
    if !status.is_success() {
        return Err(Error::Http(format!("{} returned {}", service, status)));
    }
    response
        .json()
        .await
        .map_err(|e| Error::Http(format!("{} parse: {}", service, e)))
}

// ==================== LLM extractor ====================

/// HTTP client for the LLM extraction service.
pub struct HttpLlmExtractor {
    http: Client,
    endpoint: String,
}

impl HttpLlmExtractor {
    pub fn new(config: &CollaboratorConfig) -> Self {
        Self {
            http: build_http_client(config.timeout_secs),
            endpoint: config.llm_endpoint.clone(),
        }
    }
}

#[derive(Serialize)]
struct FragmentRequest<'a> {
    url: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    feedback: Option<&'a str>,
}

#[derive(Serialize)]
struct ClaimRequest<'a> {
    text: &'a str,
    hypothesis: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    feedback: Option<&'a str>,
}

#[derive(Deserialize)]
struct RawOutput {
    output: String,
}

#[async_trait]
impl LlmExtractor for HttpLlmExtractor {
    async fn extract_fragments(
        &self,
        url: &str,
        content: &str,
        feedback: Option<&str>,
    ) -> Result<String> {
        let request = FragmentRequest {
            url,
            content,
            feedback,
        };
        let response: RawOutput = post_json(
            &self.http,
            &format!("{}/extract_fragments", self.endpoint),
            "llm_extractor",
            &request,
        )
        .await?;
        Ok(response.output)
    }

    async fn extract_claims(
        &self,
        text: &str,
        hypothesis: &str,
        feedback: Option<&str>,
    ) -> Result<String> {
        let request = ClaimRequest {
            text,
            hypothesis,
            feedback,
        };
        let response: RawOutput = post_json(
            &self.http,
            &format!("{}/extract_claims", self.endpoint),
            "llm_extractor",
            &request,
        )
        .await?;
        Ok(response.output)
    }
}

// ==================== NLI classifier ====================

/// HTTP client for the NLI classifier service.
pub struct HttpNliClassifier {
    http: Client,
    endpoint: String,
}

impl HttpNliClassifier {
    pub fn new(config: &CollaboratorConfig) -> Self {
        Self {
            http: build_http_client(config.timeout_secs),
            endpoint: config.nli_endpoint.clone(),
        }
    }
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    premise: &'a str,
    hypothesis: &'a str,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    label: String,
    score: f64,
}

#[async_trait]
impl NliClassifier for HttpNliClassifier {
    async fn classify(&self, premise: &str, hypothesis: &str) -> Result<NliJudgement> {
        let request = ClassifyRequest { premise, hypothesis };
        let response: ClassifyResponse = post_json(
            &self.http,
            &format!("{}/classify", self.endpoint),
            "nli_classifier",
            &request,
        )
        .await?;

        let label = match Relation::parse(&response.label) {
            Some(relation) if relation.is_nli() => relation,
            _ => {
                return Err(Error::LlmParse(format!(
                    "nli label '{}' is not supports|refutes|neutral",
                    response.label
                )))
            }
        };
        Ok(NliJudgement {
            label,
            score: response.score.clamp(0.0, 1.0),
        })
    }
}

// ==================== Embeddings ====================

/// HTTP client for the embedding service.
pub struct HttpEmbeddingClient {
    http: Client,
    endpoint: String,
}

impl HttpEmbeddingClient {
    pub fn new(config: &CollaboratorConfig) -> Self {
        Self {
            http: build_http_client(config.timeout_secs),
            endpoint: config.embedding_endpoint.clone(),
        }
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    vectors: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbedRequest { texts };
        let response: EmbedResponse = post_json(
            &self.http,
            &format!("{}/embed", self.endpoint),
            "embedding",
            &request,
        )
        .await?;
        if response.vectors.len() != texts.len() {
            return Err(Error::Http(format!(
                "embedding count mismatch: {} texts, {} vectors",
                texts.len(),
                response.vectors.len()
            )));
        }
        Ok(response.vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_response_label_validation() {
        let good: ClassifyResponse =
            serde_json::from_str(r#"{"label": "supports", "score": 0.93}"#).unwrap();
        assert_eq!(Relation::parse(&good.label), Some(Relation::Supports));

        // cites is a relation but not a legal NLI label.
        let bad: ClassifyResponse =
            serde_json::from_str(r#"{"label": "cites", "score": 0.5}"#).unwrap();
        let relation = Relation::parse(&bad.label).unwrap();
        assert!(!relation.is_nli());
    }

    #[test]
    fn test_request_shapes_serialize() {
        let request = ClaimRequest {
            text: "t",
            hypothesis: "h",
            feedback: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("feedback"));

        let request = ClaimRequest {
            text: "t",
            hypothesis: "h",
            feedback: Some("errors"),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("feedback"));
    }
}
