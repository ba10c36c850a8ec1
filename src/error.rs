//! Error types for dossier-core.

use thiserror::Error;

/// Result type alias using dossier-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running research work.
///
/// Variants map onto the recovery taxonomy: transient errors are retried
/// with backoff, rate limits honor retry-after, challenge pages surface an
/// auth item, and cancellation is its own kind rather than a failure.
#[derive(Error, Debug)]
pub enum Error {
    /// Transient network failure, 5xx, or timeout; retryable with backoff
    #[error("Transient error: {message}")]
    Transient { message: String },

    /// Rate limited (429 or equivalent) by an external source
    #[error("Rate limited by {source_name}")]
    RateLimited {
        source_name: String,
        retry_after_ms: Option<u64>,
    },

    /// A challenge page (CAPTCHA, login, geo-wall) that needs a human
    #[error("Auth challenge on {domain}: {challenge}")]
    AuthChallenge { domain: String, challenge: String },

    /// LLM output failed JSON parsing or schema validation
    #[error("LLM output parse error: {0}")]
    LlmParse(String),

    /// A data-model invariant was violated; recovered by replacement
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Read query exceeded its wall-clock or VM-step budget
    #[error("Query exceeded {kind} limit")]
    QueryLimit { kind: DeadlineKind },

    /// Tool input failed schema validation
    #[error("Invalid input at {path}: expected {expected}")]
    InvalidInput { path: String, expected: String },

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// HTTP transport error from a collaborator
    #[error("HTTP error: {0}")]
    Http(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation was cancelled cooperatively
    #[error("Cancelled")]
    Cancelled,

    /// Task budget exhausted
    #[error("Budget exhausted: {resource}")]
    BudgetExhausted { resource: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Which deadline fired first on a capped read query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    WallClock,
    VmSteps,
}

impl std::fmt::Display for DeadlineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WallClock => write!(f, "wall_clock"),
            Self::VmSteps => write!(f, "vm_steps"),
        }
    }
}

impl Error {
    /// Create a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Create a rate-limited error.
    pub fn rate_limited(source: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        Self::RateLimited {
            source_name: source.into(),
            retry_after_ms,
        }
    }

    /// Create an auth challenge error.
    pub fn auth_challenge(domain: impl Into<String>, challenge: impl Into<String>) -> Self {
        Self::AuthChallenge {
            domain: domain.into(),
            challenge: challenge.into(),
        }
    }

    /// Create an invalid input error with a field path.
    pub fn invalid_input(path: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::InvalidInput {
            path: path.into(),
            expected: expected.into(),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a budget exhausted error.
    pub fn budget_exhausted(resource: impl Into<String>) -> Self {
        Self::BudgetExhausted {
            resource: resource.into(),
        }
    }

    /// Stable kind tag used by the tool surface for structured errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::RateLimited { .. } => "rate_limited",
            Self::AuthChallenge { .. } => "auth_challenge",
            Self::LlmParse(_) => "llm_parse",
            Self::Invariant(_) => "invariant",
            Self::QueryLimit { .. } => "query_limit",
            Self::InvalidInput { .. } => "invalid_input",
            Self::Storage(_) => "storage",
            Self::Http(_) => "http",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::Cancelled => "cancelled",
            Self::BudgetExhausted { .. } => "budget_exhausted",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether a worker may retry the failed operation with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimited { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Self::Transient {
                message: e.to_string(),
            }
        } else {
            Self::Http(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(Error::transient("x").kind(), "transient");
        assert_eq!(Error::Cancelled.kind(), "cancelled");
        assert_eq!(
            Error::QueryLimit {
                kind: DeadlineKind::VmSteps
            }
            .kind(),
            "query_limit"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::transient("timeout").is_retryable());
        assert!(Error::rate_limited("openalex", Some(1000)).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::auth_challenge("example.org", "captcha").is_retryable());
    }
}
