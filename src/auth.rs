//! Authentication intervention queue.
//!
//! When a fetch classifies a response as a challenge page (CAPTCHA, login,
//! geo-wall) the blocked work is parked in `awaiting_auth` and a pending
//! item is surfaced for a human. Resolution requeues the blocked jobs at
//! their original priority; skipping cancels them with a note.

use crate::error::{Error, Result};
use crate::jobs::types::{JobId, JobState};
use crate::storage::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an auth queue item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthItemId(pub Uuid);

impl AuthItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for AuthItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AuthItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of challenge the fetcher observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    Captcha,
    Login,
    GeoWall,
}

impl std::fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Captcha => write!(f, "captcha"),
            Self::Login => write!(f, "login"),
            Self::GeoWall => write!(f, "geo_wall"),
        }
    }
}

impl ChallengeType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "captcha" => Some(Self::Captcha),
            "login" => Some(Self::Login),
            "geo_wall" => Some(Self::GeoWall),
            _ => None,
        }
    }
}

/// Status of an auth queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Pending,
    Resolved,
    Skipped,
}

impl std::fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Resolved => write!(f, "resolved"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl AuthStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "resolved" => Some(Self::Resolved),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Client action on a pending item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthAction {
    Solved,
    Skipped,
}

impl AuthAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "solved" => Some(Self::Solved),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// A surfaced challenge awaiting human intervention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthItem {
    pub id: AuthItemId,
    pub domain: String,
    pub challenge_type: ChallengeType,
    pub blocking_job_ids: Vec<JobId>,
    pub status: AuthStatus,
    pub created_at: DateTime<Utc>,
}

impl AuthItem {
    pub fn new(
        domain: impl Into<String>,
        challenge_type: ChallengeType,
        blocking_job_ids: Vec<JobId>,
    ) -> Self {
        Self {
            id: AuthItemId::new(),
            domain: domain.into(),
            challenge_type,
            blocking_job_ids,
            status: AuthStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of resolving an item, for the caller to act on.
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub domain: String,
    pub requeued: Vec<JobId>,
    pub cancelled: Vec<JobId>,
}

/// Store-backed intervention queue.
#[derive(Clone)]
pub struct AuthQueue {
    store: Store,
}

impl AuthQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Surface a challenge and park the blocked jobs.
    ///
    /// The domain must be at least registrable granularity; bare TLDs and
    /// known multi-part public suffixes are rejected as too broad.
    pub fn report_challenge(
        &self,
        domain: &str,
        challenge_type: ChallengeType,
        blocking_job_ids: Vec<JobId>,
    ) -> Result<AuthItem> {
        validate_domain_granularity(domain)?;

        let item = AuthItem::new(domain, challenge_type, blocking_job_ids.clone());
        self.store.insert_auth_item(&item)?;
        for job_id in &blocking_job_ids {
            self.store
                .transition_job(job_id, JobState::AwaitingAuth, None)?;
        }
        tracing::info!(domain = %item.domain, challenge = %item.challenge_type, "auth challenge surfaced");
        Ok(item)
    }

    pub fn pending(&self) -> Result<Vec<AuthItem>> {
        self.store.pending_auth_items()
    }

    /// Resolve a pending item. Solved requeues the blocked jobs; skipped
    /// cancels them with a note.
    pub fn resolve(&self, id: &AuthItemId, action: AuthAction) -> Result<ResolveOutcome> {
        let item = self
            .store
            .get_auth_item(id)?
            .ok_or_else(|| Error::invalid_input("item_id", "a pending auth item"))?;

        let status = match action {
            AuthAction::Solved => AuthStatus::Resolved,
            AuthAction::Skipped => AuthStatus::Skipped,
        };
        if !self.store.set_auth_item_status(id, status)? {
            return Err(Error::invalid_input("item_id", "a pending auth item"));
        }

        let mut outcome = ResolveOutcome {
            domain: item.domain.clone(),
            requeued: Vec::new(),
            cancelled: Vec::new(),
        };
        for job_id in &item.blocking_job_ids {
            match action {
                AuthAction::Solved => {
                    if self.store.requeue_blocked_job(job_id)? {
                        outcome.requeued.push(job_id.clone());
                    }
                }
                AuthAction::Skipped => {
                    if self.store.transition_job(
                        job_id,
                        JobState::Cancelled,
                        Some("auth challenge skipped"),
                    )? {
                        outcome.cancelled.push(job_id.clone());
                    }
                }
            }
        }
        Ok(outcome)
    }
}

/// Multi-part public suffixes that may not be used as a bare block target.
const MULTI_PART_SUFFIXES: &[&str] = &[
    "co.uk", "ac.uk", "gov.uk", "org.uk", "co.jp", "ne.jp", "or.jp", "com.au", "net.au",
    "org.au", "co.nz", "com.br", "com.cn", "com.tw", "co.in", "co.kr", "com.mx", "com.sg",
];

/// Reject TLD-wide or public-suffix-wide domains; blocks must be at least
/// registrable-domain granularity.
pub fn validate_domain_granularity(domain: &str) -> Result<()> {
    let domain = domain.trim().trim_start_matches('.').to_lowercase();
    if domain.is_empty() || !domain.contains('.') {
        return Err(Error::invalid_input(
            "domain",
            "a registrable domain, not a TLD",
        ));
    }
    if MULTI_PART_SUFFIXES.contains(&domain.as_str()) {
        return Err(Error::invalid_input(
            "domain",
            "a registrable domain, not a public suffix",
        ));
    }
    Ok(())
}
