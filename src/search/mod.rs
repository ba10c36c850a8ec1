//! Unified search: SERP arm, academic arm, fetching and the pipeline.

pub mod academic;
pub mod fetch;
pub mod pipeline;
pub mod serp;

pub use academic::{AcademicClient, AcademicGateway, OpenAlexClient, PaperRecord, SemanticScholarClient};
pub use fetch::{FetchOutcome, FetchedPage, HttpPageFetcher, PageFetcher};
pub use pipeline::{RateLimitedAcademic, SearchPipeline, TargetOutcome};
pub use serp::{BrowserSerpClient, EngineBreaker, SerpClient, SerpResult};
