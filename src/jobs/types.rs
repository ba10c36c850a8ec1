//! Job types for the scheduler.
//!
//! Job state transitions form a DAG: queued -> running -> {completed,
//! failed, cancelled}, and queued/running -> awaiting_auth -> queued.

use crate::graph::types::{PageId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Process one queued target (query, url or doi).
    TargetQueue,
    /// Cross-source NLI verification over multi-source claims.
    VerifyNli,
    /// One-hop citation expansion for an academic source page.
    CitationGraph,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TargetQueue => write!(f, "target_queue"),
            Self::VerifyNli => write!(f, "verify_nli"),
            Self::CitationGraph => write!(f, "citation_graph"),
        }
    }
}

impl JobKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "target_queue" => Some(Self::TargetQueue),
            "verify_nli" => Some(Self::VerifyNli),
            "citation_graph" => Some(Self::CitationGraph),
            _ => None,
        }
    }
}

/// Job priority; lower numeric rank is claimed first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn rank(&self) -> i32 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }

    pub fn from_rank(rank: i32) -> Self {
        match rank {
            0 => Self::High,
            2 => Self::Low,
            _ => Self::Medium,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl Priority {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    AwaitingAuth,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::AwaitingAuth => write!(f, "awaiting_auth"),
        }
    }
}

impl JobState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "awaiting_auth" => Some(Self::AwaitingAuth),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (Self::Queued, Self::Running)
            | (Self::Queued, Self::Cancelled)
            | (Self::Queued, Self::AwaitingAuth)
            | (Self::Running, Self::Completed)
            | (Self::Running, Self::Failed)
            | (Self::Running, Self::Cancelled)
            | (Self::Running, Self::AwaitingAuth)
            | (Self::AwaitingAuth, Self::Queued)
            | (Self::AwaitingAuth, Self::Cancelled) => true,
            _ => false,
        }
    }
}

/// What kind of thing a queued target names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Query,
    Url,
    Doi,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::Url => write!(f, "url"),
            Self::Doi => write!(f, "doi"),
        }
    }
}

impl TargetKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "query" => Some(Self::Query),
            "url" => Some(Self::Url),
            "doi" => Some(Self::Doi),
            _ => None,
        }
    }
}

/// A client-queued research target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub value: String,
    #[serde(default)]
    pub priority: Priority,
}

impl Target {
    pub fn query(value: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Query,
            value: value.into(),
            priority: Priority::Medium,
        }
    }

    pub fn doi(value: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Doi,
            value: value.into(),
            priority: Priority::Medium,
        }
    }

    pub fn url(value: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Url,
            value: value.into(),
            priority: Priority::Medium,
        }
    }

    /// Stable key deduplicating repeated enqueues within a task.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.kind, self.value.trim().to_lowercase())
    }
}

/// Task-specific job payload, dispatched by kind tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobInput {
    Target(Target),
    VerifyNli {
        /// Retry attempt counter when auto-retry is enabled.
        #[serde(default)]
        attempt: u32,
    },
    CitationGraph {
        page_id: PageId,
        #[serde(default)]
        attempt: u32,
    },
}

impl JobInput {
    /// Dedup key preventing duplicate queued work.
    pub fn dedup_key(&self, task_id: &TaskId) -> String {
        match self {
            Self::Target(t) => format!("{}:{}", task_id, t.dedup_key()),
            Self::VerifyNli { .. } => format!("{}:verify_nli", task_id),
            Self::CitationGraph { page_id, .. } => format!("{}:citation:{}", task_id, page_id),
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Self::Target(_) => JobKind::TargetQueue,
            Self::VerifyNli { .. } => JobKind::VerifyNli,
            Self::CitationGraph { .. } => JobKind::CitationGraph,
        }
    }
}

/// One unit of scheduled research work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub task_id: TaskId,
    pub kind: JobKind,
    pub priority: Priority,
    pub state: JobState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input: JobInput,
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(task_id: TaskId, input: JobInput, priority: Priority) -> Self {
        Self {
            id: JobId::new(),
            task_id,
            kind: input.kind(),
            priority,
            state: JobState::Queued,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            input,
            error_message: None,
        }
    }
}

/// Boolean phase flags derived from the job table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestones {
    /// At least one target_queue job existed and none is still live.
    pub target_queue_drained: bool,
    /// Target queue drained and no verify_nli job is live. A task that
    /// never needed verification counts as done.
    pub nli_verification_done: bool,
    /// Target queue drained and no citation_graph job is live. A task
    /// with no academic pages counts as ready.
    pub citation_chase_ready: bool,
}

/// Cancellation severity for stop_task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    /// In-flight jobs complete naturally; queued jobs are cancelled.
    Graceful,
    /// In-flight jobs are signalled at the next suspension point.
    Immediate,
    /// As immediate, plus follow-up jobs and pending auth items.
    Full,
}

impl CancelMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "graceful" => Some(Self::Graceful),
            "immediate" => Some(Self::Immediate),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

/// Which job kinds a stop_task call touches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelScope {
    #[default]
    All,
    TargetQueueOnly,
    FollowUpsOnly,
}

impl CancelScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(Self::All),
            "target_queue_only" => Some(Self::TargetQueueOnly),
            "follow_ups_only" => Some(Self::FollowUpsOnly),
            _ => None,
        }
    }

    pub fn includes(&self, kind: JobKind) -> bool {
        match self {
            Self::All => true,
            Self::TargetQueueOnly => kind == JobKind::TargetQueue,
            Self::FollowUpsOnly => {
                matches!(kind, JobKind::VerifyNli | JobKind::CitationGraph)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_state_dag() {
        use JobState::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(AwaitingAuth));
        assert!(AwaitingAuth.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Completed));
    }

    #[test]
    fn test_priority_rank_order() {
        assert!(Priority::High.rank() < Priority::Medium.rank());
        assert!(Priority::Medium.rank() < Priority::Low.rank());
        assert_eq!(Priority::from_rank(Priority::Low.rank()), Priority::Low);
    }

    #[test]
    fn test_target_dedup_key_normalizes() {
        let a = Target::query("DPP-4 Inhibitors ");
        let b = Target::query("dpp-4 inhibitors");
        assert_eq!(a.dedup_key(), b.dedup_key());

        let c = Target::doi("10.1/x");
        assert_ne!(a.dedup_key(), c.dedup_key());
    }

    #[test]
    fn test_job_input_kind_tagging() {
        let task = TaskId::new();
        let input = JobInput::Target(Target::query("q"));
        assert_eq!(input.kind(), JobKind::TargetQueue);
        assert!(input.dedup_key(&task).contains("query:q"));

        let follow = JobInput::VerifyNli { attempt: 0 };
        assert_eq!(follow.kind(), JobKind::VerifyNli);
    }

    #[test]
    fn test_cancel_scope_filters_kinds() {
        assert!(CancelScope::All.includes(JobKind::CitationGraph));
        assert!(CancelScope::TargetQueueOnly.includes(JobKind::TargetQueue));
        assert!(!CancelScope::TargetQueueOnly.includes(JobKind::CitationGraph));
        assert!(CancelScope::FollowUpsOnly.includes(JobKind::VerifyNli));
        assert!(!CancelScope::FollowUpsOnly.includes(JobKind::TargetQueue));
    }

    #[test]
    fn test_job_serde_roundtrip() {
        let job = Job::new(
            TaskId::new(),
            JobInput::Target(Target::doi("10.1038/nature12373")),
            Priority::High,
        );
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, JobKind::TargetQueue);
        assert_eq!(back.priority, Priority::High);
        assert_eq!(back.state, JobState::Queued);
    }
}
