//! # dossier-core
//!
//! A local-first research server. On behalf of an external reasoning
//! client it discovers sources on the public web and in academic APIs,
//! extracts claims and evidence fragments, classifies the evidential
//! relation between them with an external NLI service, and persists the
//! whole as an append-only evidence graph in SQLite.
//!
//! ## Core components
//!
//! - **storage**: the SQLite store, versioned schema and the read-only
//!   query surface
//! - **graph**: entity types, the per-task evidence graph engine, Bayesian
//!   aggregation, analytics and named views
//! - **search**: the unified pipeline over browser SERP and academic APIs
//! - **extract**: LLM-driven fragment/claim extraction and NLI judging
//! - **jobs**: the priority job scheduler with its worker pool
//! - **tools**: the stdio request/response tool protocol
//!
//! ## Example
//!
//! ```rust,ignore
//! use dossier_core::jobs::Target;
//!
//! let task = scheduler.create_task("DPP-4 inhibitors reduce HbA1c", None, vec![])?;
//! scheduler.queue_targets(&task.id, &[Target::query("DPP-4 inhibitors efficacy")], false)?;
//! let status = scheduler.wait_status(&task.id, 180, true).await?;
//! ```

pub mod auth;
pub mod calibrate;
pub mod config;
pub mod error;
pub mod extract;
pub mod graph;
pub mod ident;
pub mod index;
pub mod jobs;
pub mod search;
pub mod storage;
pub mod tools;

// Re-exports for convenience
pub use auth::{AuthAction, AuthItem, AuthItemId, AuthQueue, AuthStatus, ChallengeType};
pub use calibrate::{Calibration, CalibrationStats};
pub use config::Config;
pub use error::{DeadlineKind, Error, Result};
pub use extract::{
    EmbeddingClient, FragmentClaimExtractor, HttpEmbeddingClient, HttpLlmExtractor,
    HttpNliClassifier, LlmExtractor, NliClassifier, NliJudgement,
};
pub use graph::{
    calculate_betweenness_centrality, calculate_pagerank, AnalyticsGraph, ClaimAggregate,
    EvidenceGraph,
};
pub use graph::types::{
    AdoptionStatus, Claim, ClaimId, ClaimType, Edge, EdgeId, EntityKind, Fragment, FragmentId,
    FragmentType, Granularity, Page, PageId, PageType, PaperMetadata, Relation, SourceApi, Task,
    TaskBudget, TaskId, TaskMetrics, TaskStatus,
};
pub use index::{CanonicalEntry, CanonicalPaperIndex};
pub use jobs::{
    CancelMode, CancelScope, Job, JobId, JobInput, JobKind, JobState, Milestones, Priority,
    Scheduler, SourceLimiters, StatusSnapshot, Target, TargetKind,
};
pub use search::{
    AcademicClient, AcademicGateway, BrowserSerpClient, EngineBreaker, HttpPageFetcher,
    OpenAlexClient, PageFetcher, PaperRecord, SearchPipeline, SemanticScholarClient, SerpClient,
    SerpResult,
};
pub use storage::{QueryOptions, QueryResult, Store};
pub use tools::{build_registry, serve_stdio, ServerState, ToolRegistry};
