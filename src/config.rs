//! Configuration for the research server.
//!
//! Every field carries a serde default so a missing or partial config file
//! still yields a runnable server. No environment variable is mandatory.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level configuration, loaded from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub budget: BudgetDefaults,
    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,
    #[serde(default)]
    pub serp: SerpConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub collaborators: CollaboratorConfig,
}

impl Config {
    /// Load configuration from a JSON file. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))
    }

    /// Settings for a named academic source, falling back to defaults.
    pub fn source(&self, name: &str) -> SourceConfig {
        self.sources.get(name).cloned().unwrap_or_default()
    }

    /// Path of the SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        self.data.data_dir.join(&self.data.db_file)
    }
}

/// Data directory layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_db_file")]
    pub db_file: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            db_file: default_db_file(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_db_file() -> String {
    "dossier.db".to_string()
}

/// Worker pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of cooperative workers sharing the job table.
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// Idle poll interval between claim attempts, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_worker_count() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    250
}

/// Per-task budget defaults, applied when create_task omits them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetDefaults {
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_max_fragments")]
    pub max_fragments: u32,
    #[serde(default = "default_max_claims")]
    pub max_claims: u32,
    #[serde(default = "default_wall_clock_secs")]
    pub wall_clock_secs: u64,
}

impl Default for BudgetDefaults {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            max_fragments: default_max_fragments(),
            max_claims: default_max_claims(),
            wall_clock_secs: default_wall_clock_secs(),
        }
    }
}

fn default_max_pages() -> u32 {
    40
}

fn default_max_fragments() -> u32 {
    800
}

fn default_max_claims() -> u32 {
    120
}

fn default_wall_clock_secs() -> u64 {
    1800
}

/// Settings for one academic API source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    /// Token bucket refill, requests per minute.
    #[serde(default = "default_rate_per_minute")]
    pub rate_per_minute: u32,
    /// Token bucket burst size.
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_source_retries")]
    pub max_retries: u32,
    /// Contact email for polite pools.
    #[serde(default)]
    pub polite_contact: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            rate_per_minute: default_rate_per_minute(),
            burst: default_burst(),
            timeout_secs: default_source_timeout_secs(),
            max_retries: default_source_retries(),
            polite_contact: None,
            api_key: None,
        }
    }
}

fn default_rate_per_minute() -> u32 {
    60
}

fn default_burst() -> u32 {
    5
}

fn default_source_timeout_secs() -> u64 {
    20
}

fn default_source_retries() -> u32 {
    3
}

/// Browser SERP settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerpConfig {
    /// Browser driver endpoint (CDP or equivalent).
    #[serde(default = "default_serp_endpoint")]
    pub endpoint: String,
    /// Engines in priority order.
    #[serde(default = "default_engines")]
    pub engines: Vec<String>,
    /// Per-arm timeout for the parallel query join, in seconds.
    #[serde(default = "default_arm_timeout_secs")]
    pub arm_timeout_secs: u64,
    /// Cache TTL for SERP responses, in seconds.
    #[serde(default = "default_serp_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Consecutive failures before an engine's circuit opens.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
}

impl Default for SerpConfig {
    fn default() -> Self {
        Self {
            endpoint: default_serp_endpoint(),
            engines: default_engines(),
            arm_timeout_secs: default_arm_timeout_secs(),
            cache_ttl_secs: default_serp_cache_ttl_secs(),
            breaker_threshold: default_breaker_threshold(),
        }
    }
}

fn default_serp_endpoint() -> String {
    "http://127.0.0.1:9222".to_string()
}

fn default_engines() -> Vec<String> {
    vec!["duckduckgo".to_string(), "brave".to_string()]
}

fn default_arm_timeout_secs() -> u64 {
    45
}

fn default_serp_cache_ttl_secs() -> u64 {
    86_400
}

fn default_breaker_threshold() -> u32 {
    3
}

/// Page fetcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    /// SOCKS proxy for anonymous fetches, e.g. "socks5://127.0.0.1:9050".
    #[serde(default)]
    pub socks_proxy: Option<String>,
    /// Domains routed through the proxy.
    #[serde(default)]
    pub proxied_domains: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
            socks_proxy: None,
            proxied_domains: Vec::new(),
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

/// Extraction and NLI candidate bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Fragments kept per page; excess dropped.
    #[serde(default = "default_max_fragments_per_page")]
    pub max_fragments_per_page: usize,
    /// NLI candidate pairs per (claim, page).
    #[serde(default = "default_max_pairs_per_claim_page")]
    pub max_pairs_per_claim_page: usize,
    /// Fragments shortlisted per claim by embedding similarity.
    #[serde(default = "default_top_k_fragments")]
    pub top_k_fragments: usize,
    /// Similarity floor for the prefilter.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_fragments_per_page: default_max_fragments_per_page(),
            max_pairs_per_claim_page: default_max_pairs_per_claim_page(),
            top_k_fragments: default_top_k_fragments(),
            min_similarity: default_min_similarity(),
        }
    }
}

fn default_max_fragments_per_page() -> usize {
    200
}

fn default_max_pairs_per_claim_page() -> usize {
    8
}

fn default_top_k_fragments() -> usize {
    12
}

fn default_min_similarity() -> f64 {
    0.25
}

/// NLI score calibration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Source tag selecting which stored parameters apply.
    #[serde(default = "default_calibration_source")]
    pub source: String,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source: default_calibration_source(),
        }
    }
}

fn default_calibration_source() -> String {
    "default".to_string()
}

/// Endpoints of the external model services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    #[serde(default = "default_llm_endpoint")]
    pub llm_endpoint: String,
    #[serde(default = "default_nli_endpoint")]
    pub nli_endpoint: String,
    #[serde(default = "default_embedding_endpoint")]
    pub embedding_endpoint: String,
    #[serde(default = "default_collaborator_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            llm_endpoint: default_llm_endpoint(),
            nli_endpoint: default_nli_endpoint(),
            embedding_endpoint: default_embedding_endpoint(),
            timeout_secs: default_collaborator_timeout_secs(),
        }
    }
}

fn default_llm_endpoint() -> String {
    "http://127.0.0.1:8831".to_string()
}

fn default_nli_endpoint() -> String {
    "http://127.0.0.1:8832".to_string()
}

fn default_embedding_endpoint() -> String {
    "http://127.0.0.1:8833".to_string()
}

fn default_collaborator_timeout_secs() -> u64 {
    60
}

/// Automatic retry policy for failed jobs.
///
/// The default is no automatic retries: the client decides whether to
/// requeue. Raising max_auto_retries opts into scheduler-side retries of
/// transient-class failures with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_auto_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_auto_retries: 0,
            base_delay_ms: default_retry_base_delay_ms(),
            backoff_factor: default_retry_backoff_factor(),
        }
    }
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_backoff_factor() -> f64 {
    2.0
}

impl RetryPolicy {
    /// Backoff delay before the given retry attempt (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt as i32);
        let millis = (self.base_delay_ms as f64 * factor).round().max(0.0) as u64;
        std::time::Duration::from_millis(millis)
    }
}
