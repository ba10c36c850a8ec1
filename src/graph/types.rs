//! Entity types for the evidence graph.
//!
//! Task, Claim, and Job are task-scoped; Page, Fragment, and Edge are
//! global. A page URL is unique across tasks and may be reused; task-scoped
//! views slice the global data via claim-incident traversal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

/// Unique identifier for a page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId(pub Uuid);

/// Unique identifier for a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentId(pub Uuid);

/// Unique identifier for a claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimId(pub Uuid);

/// Unique identifier for an edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub Uuid);

macro_rules! impl_id {
    ($name:ident) => {
        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

impl_id!(TaskId);
impl_id!(PageId);
impl_id!(FragmentId);
impl_id!(ClaimId);
impl_id!(EdgeId);

/// Lifecycle status of a research task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Exploring,
    Paused,
    Failed,
    Completed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Exploring => write!(f, "exploring"),
            Self::Paused => write!(f, "paused"),
            Self::Failed => write!(f, "failed"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl TaskStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "exploring" => Some(Self::Exploring),
            "paused" => Some(Self::Paused),
            "failed" => Some(Self::Failed),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Resource caps for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBudget {
    pub max_pages: u32,
    pub max_fragments: u32,
    pub max_claims: u32,
    pub wall_clock_secs: u64,
}

impl Default for TaskBudget {
    fn default() -> Self {
        Self {
            max_pages: 40,
            max_fragments: 800,
            max_claims: 120,
            wall_clock_secs: 1800,
        }
    }
}

/// Running counts snapshot for a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub pages: u32,
    pub fragments: u32,
    pub claims: u32,
    pub edges: u32,
}

/// A research task: one central hypothesis explored under a budget.
///
/// Tasks are never deleted; stop_task transitions to paused and the same
/// id can be resumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub central_hypothesis: String,
    pub budget: TaskBudget,
    pub priority_domains: Vec<String>,
    pub status: TaskStatus,
    pub metrics: TaskMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(central_hypothesis: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            central_hypothesis: central_hypothesis.into(),
            budget: TaskBudget::default(),
            priority_domains: Vec::new(),
            status: TaskStatus::Created,
            metrics: TaskMetrics::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_budget(mut self, budget: TaskBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_priority_domains(mut self, domains: Vec<String>) -> Self {
        self.priority_domains = domains;
        self
    }
}

/// Coarse classification of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    Article,
    Academic,
    Knowledge,
    Forum,
    /// Fetched and parsed to zero fragments; still counts toward budget.
    Empty,
    Other,
}

impl std::fmt::Display for PageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Article => write!(f, "article"),
            Self::Academic => write!(f, "academic"),
            Self::Knowledge => write!(f, "knowledge"),
            Self::Forum => write!(f, "forum"),
            Self::Empty => write!(f, "empty"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl PageType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "article" => Some(Self::Article),
            "academic" => Some(Self::Academic),
            "knowledge" => Some(Self::Knowledge),
            "forum" => Some(Self::Forum),
            "empty" => Some(Self::Empty),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Which API a paper metadata field came from. Ordering is merge priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceApi {
    SemanticScholar,
    OpenAlex,
    /// Fallback tag for fields observed outside the academic APIs.
    #[default]
    Extraction,
}

impl SourceApi {
    /// Lower rank wins a merge conflict.
    pub fn priority(&self) -> u8 {
        match self {
            Self::SemanticScholar => 0,
            Self::OpenAlex => 1,
            Self::Extraction => 2,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "semantic_scholar" => Some(Self::SemanticScholar),
            "openalex" => Some(Self::OpenAlex),
            "extraction" => Some(Self::Extraction),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SemanticScholar => write!(f, "semantic_scholar"),
            Self::OpenAlex => write!(f, "openalex"),
            Self::Extraction => write!(f, "extraction"),
        }
    }
}

/// Academic metadata carried by a page, merged across sources.
///
/// Merge is fill-nulls-only with source priority semantic_scholar >
/// openalex > extraction; a non-null field from a higher-priority source is
/// never overwritten.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citation_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_api: Option<SourceApi>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paper_id: Option<String>,
}

impl PaperMetadata {
    /// Merge fields from another record observed via `incoming_source`.
    ///
    /// Null fields are filled unconditionally; non-null fields are replaced
    /// only when the incoming source outranks the recorded one.
    pub fn merge_from(&mut self, other: &PaperMetadata, incoming_source: SourceApi) {
        let existing_rank = self
            .source_api
            .map(|s| s.priority())
            .unwrap_or(u8::MAX);
        let incoming_wins = incoming_source.priority() < existing_rank;

        merge_field(&mut self.year, &other.year, incoming_wins);
        merge_field(&mut self.doi, &other.doi, incoming_wins);
        merge_field(&mut self.venue, &other.venue, incoming_wins);
        merge_field(&mut self.citation_count, &other.citation_count, incoming_wins);
        merge_field(&mut self.paper_id, &other.paper_id, incoming_wins);

        if incoming_wins {
            self.source_api = Some(incoming_source);
        } else if self.source_api.is_none() {
            self.source_api = Some(incoming_source);
        }
    }
}

fn merge_field<T: Clone>(dst: &mut Option<T>, src: &Option<T>, incoming_wins: bool) {
    if src.is_some() && (dst.is_none() || incoming_wins) {
        *dst = src.clone();
    }
}

/// A fetched or referenced web page or paper. Global, keyed by URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: PageId,
    /// Canonicalized URL, unique across the store.
    pub url: String,
    pub domain: String,
    pub page_type: PageType,
    pub fetched_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub paper_metadata: Option<PaperMetadata>,
}

impl Page {
    pub fn new(url: impl Into<String>, domain: impl Into<String>, page_type: PageType) -> Self {
        Self {
            id: PageId::new(),
            url: url.into(),
            domain: domain.into(),
            page_type,
            fetched_at: None,
            title: None,
            paper_metadata: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_metadata(mut self, metadata: PaperMetadata) -> Self {
        self.paper_metadata = Some(metadata);
        self
    }

    pub fn is_academic(&self) -> bool {
        self.page_type == PageType::Academic
    }
}

/// Structural kind of a content fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentType {
    Paragraph,
    Heading,
    List,
    Table,
    Quote,
    Figure,
    Code,
    Abstract,
}

impl std::fmt::Display for FragmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paragraph => write!(f, "paragraph"),
            Self::Heading => write!(f, "heading"),
            Self::List => write!(f, "list"),
            Self::Table => write!(f, "table"),
            Self::Quote => write!(f, "quote"),
            Self::Figure => write!(f, "figure"),
            Self::Code => write!(f, "code"),
            Self::Abstract => write!(f, "abstract"),
        }
    }
}

impl FragmentType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "paragraph" => Some(Self::Paragraph),
            "heading" => Some(Self::Heading),
            "list" => Some(Self::List),
            "table" => Some(Self::Table),
            "quote" => Some(Self::Quote),
            "figure" => Some(Self::Figure),
            "code" => Some(Self::Code),
            "abstract" => Some(Self::Abstract),
            _ => None,
        }
    }
}

/// One level of the heading path above a fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadingLevel {
    pub level: u8,
    pub text: String,
}

/// A page-scoped snippet of content that can serve as evidence.
/// Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub id: FragmentId,
    pub page_id: PageId,
    pub fragment_type: FragmentType,
    pub text_content: String,
    /// Ordered heading path, outermost first.
    pub heading_hierarchy: Vec<HeadingLevel>,
    /// Source-order position within the page.
    pub position: u32,
    pub bm25_score: Option<f64>,
    pub embed_score: Option<f64>,
    pub rerank_score: Option<f64>,
}

impl Fragment {
    pub fn new(
        page_id: PageId,
        fragment_type: FragmentType,
        text_content: impl Into<String>,
        position: u32,
    ) -> Self {
        Self {
            id: FragmentId::new(),
            page_id,
            fragment_type,
            text_content: text_content.into(),
            heading_hierarchy: Vec::new(),
            position,
            bm25_score: None,
            embed_score: None,
            rerank_score: None,
        }
    }

    pub fn with_headings(mut self, headings: Vec<HeadingLevel>) -> Self {
        self.heading_hierarchy = headings;
        self
    }
}

/// Kind of assertion a claim makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimType {
    Factual,
    Causal,
    Comparative,
    Predictive,
    Normative,
}

impl std::fmt::Display for ClaimType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Factual => write!(f, "factual"),
            Self::Causal => write!(f, "causal"),
            Self::Comparative => write!(f, "comparative"),
            Self::Predictive => write!(f, "predictive"),
            Self::Normative => write!(f, "normative"),
        }
    }
}

impl ClaimType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "factual" => Some(Self::Factual),
            "causal" => Some(Self::Causal),
            "comparative" => Some(Self::Comparative),
            "predictive" => Some(Self::Predictive),
            "normative" => Some(Self::Normative),
            _ => None,
        }
    }
}

/// Whether a claim is a single proposition or a composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Atomic,
    Composite,
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Atomic => write!(f, "atomic"),
            Self::Composite => write!(f, "composite"),
        }
    }
}

impl Granularity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "atomic" => Some(Self::Atomic),
            "composite" => Some(Self::Composite),
            _ => None,
        }
    }
}

/// Client-driven adoption state of a claim. Feedback flips this without
/// deleting rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdoptionStatus {
    Adopted,
    Pending,
    NotAdopted,
}

impl std::fmt::Display for AdoptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adopted => write!(f, "adopted"),
            Self::Pending => write!(f, "pending"),
            Self::NotAdopted => write!(f, "not_adopted"),
        }
    }
}

impl AdoptionStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "adopted" => Some(Self::Adopted),
            "pending" => Some(Self::Pending),
            "not_adopted" => Some(Self::NotAdopted),
            _ => None,
        }
    }
}

/// A task-scoped assertion extracted from page content.
///
/// `llm_confidence` is the extractor's self-reported quality, kept for
/// ordering only; it never feeds truth aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,
    pub task_id: TaskId,
    pub claim_text: String,
    pub claim_type: ClaimType,
    pub granularity: Granularity,
    pub llm_confidence: f64,
    pub adoption_status: AdoptionStatus,
    pub supporting_count: u32,
    pub refuting_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Claim {
    pub fn new(task_id: TaskId, claim_text: impl Into<String>, claim_type: ClaimType) -> Self {
        Self {
            id: ClaimId::new(),
            task_id,
            claim_text: claim_text.into(),
            claim_type,
            granularity: Granularity::Atomic,
            llm_confidence: 0.5,
            adoption_status: AdoptionStatus::Pending,
            supporting_count: 0,
            refuting_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_llm_confidence(mut self, confidence: f64) -> Self {
        self.llm_confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

/// Closed set of edge relations. Dispatch is by tag, not by subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Supports,
    Refutes,
    Neutral,
    Cites,
    /// Derived Claim -> Page edge, synthesized in memory and never persisted.
    EvidenceSource,
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Supports => write!(f, "supports"),
            Self::Refutes => write!(f, "refutes"),
            Self::Neutral => write!(f, "neutral"),
            Self::Cites => write!(f, "cites"),
            Self::EvidenceSource => write!(f, "evidence_source"),
        }
    }
}

impl Relation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "supports" => Some(Self::Supports),
            "refutes" => Some(Self::Refutes),
            "neutral" => Some(Self::Neutral),
            "cites" => Some(Self::Cites),
            "evidence_source" => Some(Self::EvidenceSource),
            _ => None,
        }
    }

    /// Whether this is an NLI judgement relation (Fragment -> Claim).
    pub fn is_nli(&self) -> bool {
        matches!(self, Self::Supports | Self::Refutes | Self::Neutral)
    }

    /// Whether edges of this relation may be persisted.
    pub fn is_persistable(&self) -> bool {
        !matches!(self, Self::EvidenceSource)
    }

    /// The legal (source, target) entity kinds for this relation.
    pub fn endpoint_kinds(&self) -> (EntityKind, EntityKind) {
        match self {
            Self::Supports | Self::Refutes | Self::Neutral => {
                (EntityKind::Fragment, EntityKind::Claim)
            }
            Self::Cites => (EntityKind::Page, EntityKind::Page),
            Self::EvidenceSource => (EntityKind::Claim, EntityKind::Page),
        }
    }
}

/// Entity kinds an edge endpoint may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Fragment,
    Claim,
    Page,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fragment => write!(f, "fragment"),
            Self::Claim => write!(f, "claim"),
            Self::Page => write!(f, "page"),
        }
    }
}

impl EntityKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fragment" => Some(Self::Fragment),
            "claim" => Some(Self::Claim),
            "page" => Some(Self::Page),
            _ => None,
        }
    }
}

/// Where a cites edge was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationSource {
    SemanticScholar,
    OpenAlex,
    Extraction,
}

impl std::fmt::Display for CitationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SemanticScholar => write!(f, "semantic_scholar"),
            Self::OpenAlex => write!(f, "openalex"),
            Self::Extraction => write!(f, "extraction"),
        }
    }
}

impl CitationSource {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "semantic_scholar" => Some(Self::SemanticScholar),
            "openalex" => Some(Self::OpenAlex),
            "extraction" => Some(Self::Extraction),
            _ => None,
        }
    }
}

/// A typed directed relationship between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source_kind: EntityKind,
    pub source_id: String,
    pub target_kind: EntityKind,
    pub target_id: String,
    pub relation: Relation,
    pub nli_label: Option<String>,
    pub nli_confidence: Option<f64>,
    pub citation_source: Option<CitationSource>,
    pub human_corrected: bool,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    /// An NLI judgement edge Fragment -> Claim.
    pub fn nli(
        fragment_id: &FragmentId,
        claim_id: &ClaimId,
        relation: Relation,
        nli_confidence: f64,
    ) -> Self {
        debug_assert!(relation.is_nli());
        Self {
            id: EdgeId::new(),
            source_kind: EntityKind::Fragment,
            source_id: fragment_id.to_string(),
            target_kind: EntityKind::Claim,
            target_id: claim_id.to_string(),
            relation,
            nli_label: Some(relation.to_string()),
            nli_confidence: Some(nli_confidence.clamp(0.0, 1.0)),
            citation_source: None,
            human_corrected: false,
            created_at: Utc::now(),
        }
    }

    /// A citation edge Page -> Page.
    pub fn cites(source: &PageId, target: &PageId, citation_source: CitationSource) -> Self {
        Self {
            id: EdgeId::new(),
            source_kind: EntityKind::Page,
            source_id: source.to_string(),
            target_kind: EntityKind::Page,
            target_id: target.to_string(),
            relation: Relation::Cites,
            nli_label: None,
            nli_confidence: None,
            citation_source: Some(citation_source),
            human_corrected: false,
            created_at: Utc::now(),
        }
    }

    /// Validate that the endpoint kinds are legal for the relation.
    pub fn endpoints_valid(&self) -> bool {
        self.relation.endpoint_kinds() == (self.source_kind, self.target_kind)
    }
}

/// A derived Claim -> Page edge held only in memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvidenceSourceEdge {
    pub claim_id: ClaimId,
    pub page_id: PageId,
}

/// An appended NLI correction; records only label changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NliCorrection {
    pub edge_id: EdgeId,
    pub predicted_label: String,
    pub correct_label: String,
    pub predicted_confidence: f64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_id_roundtrip() {
        let id = ClaimId::new();
        let parsed = ClaimId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(ClaimId::parse("not-a-uuid").is_none());
    }

    #[test]
    fn test_relation_endpoint_kinds() {
        assert_eq!(
            Relation::Supports.endpoint_kinds(),
            (EntityKind::Fragment, EntityKind::Claim)
        );
        assert_eq!(
            Relation::Cites.endpoint_kinds(),
            (EntityKind::Page, EntityKind::Page)
        );
        assert!(!Relation::EvidenceSource.is_persistable());
        assert!(Relation::Refutes.is_nli());
        assert!(!Relation::Cites.is_nli());
    }

    #[test]
    fn test_edge_constructors_are_valid() {
        let frag = FragmentId::new();
        let claim = ClaimId::new();
        let edge = Edge::nli(&frag, &claim, Relation::Supports, 0.9);
        assert!(edge.endpoints_valid());
        assert_eq!(edge.nli_confidence, Some(0.9));

        let a = PageId::new();
        let b = PageId::new();
        let cite = Edge::cites(&a, &b, CitationSource::OpenAlex);
        assert!(cite.endpoints_valid());
        assert_eq!(cite.relation, Relation::Cites);
    }

    #[test]
    fn test_metadata_merge_priority() {
        let mut meta = PaperMetadata {
            year: Some(2019),
            doi: Some("10.1/x".to_string()),
            venue: None,
            citation_count: None,
            source_api: Some(SourceApi::OpenAlex),
            paper_id: None,
        };

        // Lower-priority extraction fills nulls but never overwrites.
        let incoming = PaperMetadata {
            year: Some(2021),
            venue: Some("Nature".to_string()),
            ..Default::default()
        };
        meta.merge_from(&incoming, SourceApi::Extraction);
        assert_eq!(meta.year, Some(2019));
        assert_eq!(meta.venue, Some("Nature".to_string()));
        assert_eq!(meta.source_api, Some(SourceApi::OpenAlex));

        // Higher-priority semantic_scholar replaces conflicting fields.
        let s2 = PaperMetadata {
            year: Some(2020),
            citation_count: Some(15),
            ..Default::default()
        };
        meta.merge_from(&s2, SourceApi::SemanticScholar);
        assert_eq!(meta.year, Some(2020));
        assert_eq!(meta.citation_count, Some(15));
        assert_eq!(meta.source_api, Some(SourceApi::SemanticScholar));
    }

    #[test]
    fn test_task_builder() {
        let task = Task::new("DPP-4 inhibitors reduce HbA1c")
            .with_priority_domains(vec!["nature.com".to_string()]);
        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.metrics, TaskMetrics::default());
        assert_eq!(task.priority_domains.len(), 1);
    }

    #[test]
    fn test_status_parse_display_roundtrip() {
        for status in [
            TaskStatus::Created,
            TaskStatus::Exploring,
            TaskStatus::Paused,
            TaskStatus::Failed,
            TaskStatus::Completed,
        ] {
            assert_eq!(TaskStatus::parse(&status.to_string()), Some(status));
        }
    }
}
