//! Page fetcher with challenge classification and optional SOCKS routing.

use crate::auth::ChallengeType;
use crate::config::FetchConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Outcome of fetching a URL.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Page content retrieved.
    Content(FetchedPage),
    /// The site answered with a human-resolvable challenge.
    Challenge {
        domain: String,
        challenge_type: ChallengeType,
    },
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub content: String,
    pub content_type: Option<String>,
}

/// Fetcher collaborator interface.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchOutcome>;
}

/// reqwest-backed fetcher; flagged domains are routed through the SOCKS
/// proxy when one is configured.
pub struct HttpPageFetcher {
    direct: Client,
    proxied: Option<Client>,
    proxied_domains: Vec<String>,
}

impl HttpPageFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let direct = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("fetch client: {}", e)))?;

        let proxied = match &config.socks_proxy {
            Some(proxy_url) => {
                let proxy = reqwest::Proxy::all(proxy_url)
                    .map_err(|e| Error::Config(format!("socks proxy: {}", e)))?;
                Some(
                    Client::builder()
                        .timeout(timeout)
                        .proxy(proxy)
                        .build()
                        .map_err(|e| Error::Config(format!("proxied client: {}", e)))?,
                )
            }
            None => None,
        };

        Ok(Self {
            direct,
            proxied,
            proxied_domains: config.proxied_domains.clone(),
        })
    }

    fn client_for(&self, domain: &str) -> &Client {
        if let Some(proxied) = &self.proxied {
            if self
                .proxied_domains
                .iter()
                .any(|d| domain == d || domain.ends_with(&format!(".{}", d)))
            {
                return proxied;
            }
        }
        &self.direct
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchOutcome> {
        let domain = crate::index::domain_of(url);
        let response = self.client_for(&domain).get(url).send().await?;

        let status = response.status();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if status.is_server_error() {
            return Err(Error::transient(format!("{} returned {}", domain, status)));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::rate_limited(domain, None));
        }

        let body = response.text().await?;

        if let Some(challenge_type) = classify_challenge(status.as_u16(), &final_url, &body) {
            return Ok(FetchOutcome::Challenge {
                domain,
                challenge_type,
            });
        }

        Ok(FetchOutcome::Content(FetchedPage {
            url: url.to_string(),
            final_url,
            status: status.as_u16(),
            content: body,
            content_type,
        }))
    }
}

/// Classify a response as a challenge page, if it is one.
///
/// Heuristics: login redirects, CAPTCHA markers in the body, and geo-wall
/// phrasing. Plain 403/401 without markers still counts as a login wall.
pub fn classify_challenge(status: u16, final_url: &str, body: &str) -> Option<ChallengeType> {
    let lowered_url = final_url.to_lowercase();
    if lowered_url.contains("/login") || lowered_url.contains("signin") {
        return Some(ChallengeType::Login);
    }

    let sample: String = body.chars().take(4096).collect::<String>().to_lowercase();
    if sample.contains("captcha") || sample.contains("are you a robot") {
        return Some(ChallengeType::Captcha);
    }
    if sample.contains("not available in your country")
        || sample.contains("not available in your region")
    {
        return Some(ChallengeType::GeoWall);
    }
    if status == 401 || status == 403 {
        return Some(ChallengeType::Login);
    }
    None
}
