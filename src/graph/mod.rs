//! Evidence graph: entity types, per-task engine, analytics and views.

pub mod analytics;
pub mod engine;
pub mod types;
pub mod views;

pub use analytics::{calculate_betweenness_centrality, calculate_pagerank, AnalyticsGraph};
pub use engine::{ClaimAggregate, EvidenceGraph};
pub use types::*;
pub use views::{find_view, list_views, run_view, ViewDef, VIEWS};
