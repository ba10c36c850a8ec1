//! Unified search pipeline.
//!
//! One entry point per queued target. Queries fan out to the browser SERP
//! and the academic APIs in parallel; both arms are always attempted and a
//! failed or timed-out arm never cancels the other. Results merge through
//! the canonical paper index, and each materialized page is handed to the
//! fragment/claim extractor.

use crate::auth::ChallengeType;
use crate::config::SerpConfig;
use crate::error::{Error, Result};
use crate::extract::FragmentClaimExtractor;
use crate::graph::types::*;
use crate::ident;
#[cfg_attr(not(test), allow(unused_imports))]
use crate::index::{domain_of, CanonicalEntry, CanonicalPaperIndex};
use crate::jobs::limiter::SourceLimiters;
use crate::jobs::types::{Target, TargetKind};
use crate::search::academic::AcademicClient;
use crate::search::fetch::{FetchOutcome, PageFetcher};
use crate::search::serp::{cache_key, normalize_query, order_results, EngineBreaker, SerpClient, SerpResult};
use crate::storage::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// A challenge observed while processing a target.
#[derive(Debug, Clone)]
pub struct ObservedChallenge {
    pub domain: String,
    pub challenge_type: ChallengeType,
}

/// What one target contributed.
#[derive(Debug, Clone, Default)]
pub struct TargetOutcome {
    pub pages: Vec<PageId>,
    pub academic_pages: Vec<PageId>,
    /// Set when any fetch hit a challenge page; the scheduler parks the
    /// job on it after partial results are persisted.
    pub challenge: Option<ObservedChallenge>,
    pub serp_used: bool,
}

/// Academic client decorator that takes a token from the per-source bucket
/// before every call.
pub struct RateLimitedAcademic {
    inner: Arc<dyn AcademicClient>,
    limiters: Arc<SourceLimiters>,
    source_name: String,
}

impl RateLimitedAcademic {
    pub fn new(inner: Arc<dyn AcademicClient>, limiters: Arc<SourceLimiters>) -> Self {
        let source_name = inner.source().to_string();
        Self {
            inner,
            limiters,
            source_name,
        }
    }
}

#[async_trait::async_trait]
impl AcademicClient for RateLimitedAcademic {
    async fn paper_by_doi(&self, doi: &str) -> Result<Option<crate::search::academic::PaperRecord>> {
        self.limiters.acquire(&self.source_name).await;
        self.inner.paper_by_doi(doi).await
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<crate::search::academic::PaperRecord>> {
        self.limiters.acquire(&self.source_name).await;
        self.inner.search(query, limit).await
    }

    async fn references(&self, doi: &str) -> Result<Vec<crate::search::academic::PaperRecord>> {
        self.limiters.acquire(&self.source_name).await;
        self.inner.references(doi).await
    }

    async fn doi_for_external_id(&self, scheme: &str, id: &str) -> Result<Option<String>> {
        self.limiters.acquire(&self.source_name).await;
        self.inner.doi_for_external_id(scheme, id).await
    }

    fn source(&self) -> SourceApi {
        self.inner.source()
    }
}

/// The pipeline and its collaborators.
pub struct SearchPipeline {
    store: Store,
    academic: Arc<dyn AcademicClient>,
    serp: Arc<dyn SerpClient>,
    fetcher: Arc<dyn PageFetcher>,
    extractor: Arc<FragmentClaimExtractor>,
    serp_permit: Arc<Semaphore>,
    breaker: Arc<EngineBreaker>,
    serp_config: SerpConfig,
    serp_result_limit: usize,
}

impl SearchPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        academic: Arc<dyn AcademicClient>,
        serp: Arc<dyn SerpClient>,
        fetcher: Arc<dyn PageFetcher>,
        extractor: Arc<FragmentClaimExtractor>,
        serp_permit: Arc<Semaphore>,
        breaker: Arc<EngineBreaker>,
        serp_config: SerpConfig,
    ) -> Self {
        Self {
            store,
            academic,
            serp,
            fetcher,
            extractor,
            serp_permit,
            breaker,
            serp_config,
            serp_result_limit: 10,
        }
    }

    pub fn breaker(&self) -> &Arc<EngineBreaker> {
        &self.breaker
    }

    /// Run one queued target to completion.
    pub async fn run_target(
        &self,
        task: &Task,
        target: &Target,
        cancel: &CancellationToken,
    ) -> Result<TargetOutcome> {
        match target.kind {
            TargetKind::Doi => {
                let doi = ident::normalize_doi(&target.value);
                self.run_doi(task, &doi, cancel).await
            }
            TargetKind::Url => {
                let ids = ident::extract_from_url(&target.value);
                if let Some(doi) = ids.doi {
                    // A DOI-bearing URL routes to the fast path.
                    return self.run_doi(task, &doi, cancel).await;
                }
                let entry = CanonicalEntry::from_serp(&target.value, None, None, 0, 1);
                let mut index = CanonicalPaperIndex::new();
                index.ingest(entry);
                self.materialize(task, index.into_entries(), cancel, false).await
            }
            TargetKind::Query => self.run_query(task, &target.value, cancel).await,
        }
    }

    /// DOI fast path: no SERP, metadata straight from the academic gateway.
    async fn run_doi(
        &self,
        task: &Task,
        doi: &str,
        cancel: &CancellationToken,
    ) -> Result<TargetOutcome> {
        let mut index = CanonicalPaperIndex::new();
        match self.academic.paper_by_doi(doi).await {
            Ok(Some(record)) => {
                index.ingest(CanonicalEntry::from_academic(
                    record.doi.clone().or_else(|| Some(doi.to_string())),
                    record.url.clone(),
                    record.title.clone(),
                    record.abstract_text.clone(),
                    record.first_author.clone(),
                    record.metadata(),
                ));
            }
            Ok(None) => {
                // Unknown to both pillars; keep a doi.org stub page so the
                // target leaves a trace and can be fetched.
                index.ingest(CanonicalEntry::from_academic(
                    Some(doi.to_string()),
                    None,
                    None,
                    None,
                    None,
                    PaperMetadata {
                        doi: Some(doi.to_string()),
                        ..Default::default()
                    },
                ));
            }
            Err(e) => return Err(e),
        }
        self.materialize(task, index.into_entries(), cancel, false).await
    }

    /// Query path: SERP and academic arms in parallel, then merge.
    async fn run_query(
        &self,
        task: &Task,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<TargetOutcome> {
        let arm_timeout = Duration::from_secs(self.serp_config.arm_timeout_secs);

        let serp_arm = timeout(arm_timeout, self.serp_arm(query));
        let academic_arm = timeout(arm_timeout, async {
            self.academic.search(query, self.serp_result_limit).await
        });

        let (serp_out, academic_out) = tokio::join!(serp_arm, academic_arm);

        // A timed-out or failed arm contributes nothing but leaves the
        // other arm's output intact.
        let mut serp_challenge = None;
        let serp_results = match serp_out {
            Ok(Ok(results)) => results,
            Ok(Err(Error::AuthChallenge { domain, challenge })) => {
                serp_challenge = Some(ObservedChallenge {
                    domain,
                    challenge_type: ChallengeType::parse(&challenge)
                        .unwrap_or(ChallengeType::Captcha),
                });
                Vec::new()
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "serp arm failed");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(query = %query, "serp arm timed out");
                Vec::new()
            }
        };
        let academic_records = match academic_out {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "academic arm failed");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(query = %query, "academic arm timed out");
                Vec::new()
            }
        };

        let mut index = CanonicalPaperIndex::new();

        let engine_priority = &self.serp_config.engines;
        for result in &serp_results {
            let priority = engine_priority
                .iter()
                .position(|e| *e == result.engine)
                .unwrap_or(engine_priority.len()) as u32;
            index.ingest(CanonicalEntry::from_serp(
                &result.url,
                result.title.as_deref(),
                result.snippet.as_deref(),
                priority,
                result.rank,
            ));

            // Identifier-bearing SERP hits get an enrichment lookup.
            let ids = ident::extract(&result.url);
            if !ids.is_empty() {
                if let Ok(Some(doi)) = ident::resolve_to_doi(&ids, self.academic.as_ref()).await {
                    if let Ok(Some(record)) = self.academic.paper_by_doi(&doi).await {
                        index.ingest(CanonicalEntry::from_academic(
                            record.doi.clone().or(Some(doi)),
                            record.url.clone(),
                            record.title.clone(),
                            record.abstract_text.clone(),
                            record.first_author.clone(),
                            record.metadata(),
                        ));
                    }
                }
            }
        }

        for record in academic_records {
            index.ingest(CanonicalEntry::from_academic(
                record.doi.clone(),
                record.url.clone(),
                record.title.clone(),
                record.abstract_text.clone(),
                record.first_author.clone(),
                record.metadata(),
            ));
        }

        let mut outcome = self
            .materialize(task, index.into_entries(), cancel, true)
            .await?;
        outcome.serp_used = true;
        if outcome.challenge.is_none() {
            outcome.challenge = serp_challenge;
        }
        Ok(outcome)
    }

    /// SERP arm: cache, permit, engines in priority order.
    async fn serp_arm(&self, query: &str) -> Result<Vec<SerpResult>> {
        let normalized = normalize_query(query);
        let key = cache_key(&normalized, &self.serp_config.engines, None, 1);
        if let Some(cached) = self
            .store
            .serp_cache_get(&key, self.serp_config.cache_ttl_secs)?
        {
            if let Ok(results) = serde_json::from_str::<Vec<SerpResult>>(&cached) {
                tracing::debug!(query = %normalized, "serp cache hit");
                return Ok(results);
            }
        }

        let mut all = Vec::new();
        for engine in &self.serp_config.engines {
            if self.breaker.is_open(engine) {
                tracing::debug!(engine = %engine, "circuit open; engine skipped");
                continue;
            }

            // The browser profile is exclusive: hold the permit only
            // around the SERP call itself.
            let permit = self
                .serp_permit
                .acquire()
                .await
                .map_err(|_| Error::Internal("serp permit closed".to_string()))?;
            let result = self.serp.search(query, engine, 1).await;
            drop(permit);

            match result {
                Ok(mut results) => {
                    self.breaker.record_success(engine);
                    all.append(&mut results);
                }
                Err(Error::AuthChallenge { domain, challenge }) => {
                    self.breaker.record_failure(engine);
                    return Err(Error::AuthChallenge { domain, challenge });
                }
                Err(e) => {
                    self.breaker.record_failure(engine);
                    tracing::warn!(engine = %engine, error = %e, "engine failed");
                }
            }
        }

        order_results(&mut all, &self.serp_config.engines);
        self.store.serp_cache_put(
            &key,
            &normalized,
            &self.serp_config.engines.join(","),
            None,
            1,
            &serde_json::to_string(&all)?,
        )?;
        Ok(all)
    }

    /// Turn canonical entries into pages, fragments, claims and edges.
    async fn materialize(
        &self,
        task: &Task,
        entries: Vec<CanonicalEntry>,
        cancel: &CancellationToken,
        budgeted: bool,
    ) -> Result<TargetOutcome> {
        let mut outcome = TargetOutcome::default();

        let mut entries = entries;
        // Priority domains go first, so a tight page budget spends itself
        // on the domains the client asked for.
        if !task.priority_domains.is_empty() {
            entries.sort_by_key(|entry| {
                !task
                    .priority_domains
                    .iter()
                    .any(|domain| entry.domain == *domain || entry.domain.ends_with(&format!(".{}", domain)))
            });
        }
        if budgeted {
            let used = self.store.compute_task_metrics(&task.id)?.pages as usize;
            let remaining = (task.budget.max_pages as usize).saturating_sub(used);
            if entries.len() > remaining {
                tracing::info!(
                    task = %task.id,
                    dropped = entries.len() - remaining,
                    "page budget reached; extra entries dropped"
                );
                entries.truncate(remaining);
            }
        }

        for entry in entries {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if entry.url.is_empty() {
                continue;
            }
            if self.store.is_domain_blocked(&entry.domain)? {
                tracing::debug!(domain = %entry.domain, "domain blocked; entry skipped");
                continue;
            }

            let mut page = Page::new(&entry.url, &entry.domain, entry.page_type);
            page.title = entry.title.clone();
            page.paper_metadata = Some(entry.metadata.clone());
            let (page_id, _) = self.store.upsert_page(&page)?;

            if entry.page_type == PageType::Academic {
                outcome.academic_pages.push(page_id.clone());
            }
            outcome.pages.push(page_id.clone());

            if let Some(abstract_text) = &entry.abstract_text {
                // Abstract present: persist it as a fragment, skip fetching.
                self.extractor
                    .process_abstract(task, &page_id, abstract_text)
                    .await?;
                continue;
            }

            match self.fetcher.fetch(&entry.url).await {
                Ok(FetchOutcome::Content(fetched)) => {
                    let page = self
                        .store
                        .get_page(&page_id)?
                        .ok_or_else(|| Error::Internal("page vanished".to_string()))?;
                    let extraction = self
                        .extractor
                        .process_content(task, &page, &fetched.content)
                        .await?;
                    // Zero fragments still counts toward the page budget.
                    let final_type = if self.store.fragments_for_page(&page_id)?.is_empty() {
                        PageType::Empty
                    } else {
                        page.page_type
                    };
                    self.store.mark_page_fetched(&page_id, final_type)?;
                    tracing::debug!(
                        url = %entry.url,
                        fragments = extraction.fragment_ids.len(),
                        claims = extraction.claim_ids.len(),
                        "page processed"
                    );
                }
                Ok(FetchOutcome::Challenge {
                    domain,
                    challenge_type,
                }) => {
                    outcome.challenge = Some(ObservedChallenge {
                        domain,
                        challenge_type,
                    });
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(url = %entry.url, error = %e, "fetch failed transiently");
                }
                Err(e) => {
                    tracing::warn!(url = %entry.url, error = %e, "fetch failed; entry skipped");
                }
            }
        }

        let metrics = self.store.compute_task_metrics(&task.id)?;
        self.store.set_task_metrics(&task.id, &metrics)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::Calibration;
    use crate::config::ExtractionConfig;
    use crate::extract::{EmbeddingClient, LlmExtractor, NliClassifier, NliJudgement};
    use crate::search::academic::PaperRecord;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubAcademic {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AcademicClient for StubAcademic {
        async fn paper_by_doi(&self, doi: &str) -> Result<Option<PaperRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(PaperRecord {
                title: Some("Known paper".to_string()),
                doi: Some(doi.to_string()),
                abstract_text: Some("A known abstract.".to_string()),
                year: Some(2013),
                citation_count: Some(10),
                paper_id: Some("s2-1".to_string()),
                source: SourceApi::SemanticScholar,
                ..Default::default()
            }))
        }

        async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<PaperRecord>> {
            Ok(vec![PaperRecord {
                title: Some("Search hit".to_string()),
                doi: Some("10.9/search-hit".to_string()),
                abstract_text: Some("Hit abstract.".to_string()),
                source: SourceApi::OpenAlex,
                ..Default::default()
            }])
        }

        async fn references(&self, _doi: &str) -> Result<Vec<PaperRecord>> {
            Ok(Vec::new())
        }

        async fn doi_for_external_id(&self, _scheme: &str, _id: &str) -> Result<Option<String>> {
            Ok(None)
        }

        fn source(&self) -> SourceApi {
            SourceApi::SemanticScholar
        }
    }

    struct StubSerp {
        calls: AtomicU32,
        results: Vec<SerpResult>,
    }

    #[async_trait]
    impl SerpClient for StubSerp {
        async fn search(&self, _query: &str, engine: &str, _page: u32) -> Result<Vec<SerpResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .results
                .iter()
                .cloned()
                .map(|mut r| {
                    r.engine = engine.to_string();
                    r
                })
                .collect())
        }
    }

    enum FetchScript {
        Content(&'static str),
        Challenge,
    }

    struct StubFetcher {
        calls: AtomicU32,
        script: FetchScript,
    }

    #[async_trait]
    impl PageFetcher for StubFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script {
                FetchScript::Content(body) => Ok(FetchOutcome::Content(
                    crate::search::fetch::FetchedPage {
                        url: url.to_string(),
                        final_url: url.to_string(),
                        status: 200,
                        content: body.to_string(),
                        content_type: Some("text/html".to_string()),
                    },
                )),
                FetchScript::Challenge => Ok(FetchOutcome::Challenge {
                    domain: domain_of(url),
                    challenge_type: ChallengeType::Captcha,
                }),
            }
        }
    }

    struct StubLlm {
        fragments_json: String,
    }

    #[async_trait]
    impl LlmExtractor for StubLlm {
        async fn extract_fragments(
            &self,
            _url: &str,
            _content: &str,
            _feedback: Option<&str>,
        ) -> Result<String> {
            Ok(self.fragments_json.clone())
        }

        async fn extract_claims(
            &self,
            _text: &str,
            _hypothesis: &str,
            _feedback: Option<&str>,
        ) -> Result<String> {
            Ok(r#"{"claims": [{"text": "The effect is real", "type": "causal", "confidence": 0.8}]}"#
                .to_string())
        }
    }

    struct StubNli;

    #[async_trait]
    impl NliClassifier for StubNli {
        async fn classify(&self, _p: &str, _h: &str) -> Result<NliJudgement> {
            Ok(NliJudgement {
                label: Relation::Supports,
                score: 0.9,
            })
        }
    }

    struct StubEmbedding;

    #[async_trait]
    impl EmbeddingClient for StubEmbedding {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    struct Harness {
        pipeline: SearchPipeline,
        store: Store,
        task: Task,
        serp_calls: Arc<StubSerp>,
        fetch_calls: Arc<StubFetcher>,
        academic: Arc<StubAcademic>,
    }

    fn harness(serp_results: Vec<SerpResult>, fetch: FetchScript, fragments_json: &str) -> Harness {
        let store = Store::in_memory().unwrap();
        let task = Task::new("the effect is real");
        store.insert_task(&task).unwrap();

        let academic = Arc::new(StubAcademic {
            calls: AtomicU32::new(0),
        });
        let serp = Arc::new(StubSerp {
            calls: AtomicU32::new(0),
            results: serp_results,
        });
        let fetcher = Arc::new(StubFetcher {
            calls: AtomicU32::new(0),
            script: fetch,
        });

        let extractor = Arc::new(FragmentClaimExtractor::new(
            store.clone(),
            Arc::new(StubLlm {
                fragments_json: fragments_json.to_string(),
            }),
            Arc::new(StubNli),
            Arc::new(StubEmbedding),
            Calibration::Identity,
            ExtractionConfig::default(),
        ));

        let pipeline = SearchPipeline::new(
            store.clone(),
            academic.clone(),
            serp.clone(),
            fetcher.clone(),
            extractor,
            Arc::new(Semaphore::new(1)),
            Arc::new(EngineBreaker::new(3)),
            SerpConfig::default(),
        );

        Harness {
            pipeline,
            store,
            task,
            serp_calls: serp,
            fetch_calls: fetcher,
            academic,
        }
    }

    const FRAGMENTS: &str =
        r#"{"fragments": [{"type": "paragraph", "text": "Observed a real effect."}]}"#;

    #[tokio::test]
    async fn test_doi_fast_path_skips_serp_and_fetch() {
        let h = harness(Vec::new(), FetchScript::Content("<html>"), FRAGMENTS);
        let outcome = h
            .pipeline
            .run_target(
                &h.task,
                &Target::doi("10.1038/nature12373"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.pages.len(), 1);
        assert_eq!(outcome.academic_pages.len(), 1);
        assert_eq!(h.serp_calls.calls.load(Ordering::SeqCst), 0);
        // Abstract present: no web fetch recorded for the page.
        assert_eq!(h.fetch_calls.calls.load(Ordering::SeqCst), 0);

        let page = h.store.get_page(&outcome.pages[0]).unwrap().unwrap();
        let meta = page.paper_metadata.unwrap();
        assert_eq!(meta.doi.as_deref(), Some("10.1038/nature12373"));

        let fragments = h.store.fragments_for_page(&outcome.pages[0]).unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].fragment_type, FragmentType::Abstract);
    }

    #[tokio::test]
    async fn test_query_dedups_serp_and_academic_and_is_idempotent() {
        let serp_results = vec![SerpResult {
            url: "https://doi.org/10.9/search-hit".to_string(),
            title: Some("Search hit".to_string()),
            snippet: None,
            engine: String::new(),
            rank: 1,
        }];
        let h = harness(serp_results, FetchScript::Content("<html>"), FRAGMENTS);

        let outcome = h
            .pipeline
            .run_target(&h.task, &Target::query("the effect"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.serp_used);

        // SERP doi.org hit and academic record collapse to one page.
        let count: i64 = h
            .store
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM pages WHERE json_extract(paper_metadata, '$.doi') = '10.9/search-hit'",
                    [],
                    |row| row.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 1);

        let metrics_before = h.store.compute_task_metrics(&h.task.id).unwrap();

        // Second run: same page set, no inflated counts.
        h.pipeline
            .run_target(&h.task, &Target::query("the effect"), &CancellationToken::new())
            .await
            .unwrap();
        let metrics_after = h.store.compute_task_metrics(&h.task.id).unwrap();
        assert_eq!(metrics_before, metrics_after);
    }

    #[tokio::test]
    async fn test_zero_fragment_page_recorded_as_empty() {
        let serp_results = vec![SerpResult {
            url: "https://plain.example/post".to_string(),
            title: Some("A post".to_string()),
            snippet: None,
            engine: String::new(),
            rank: 1,
        }];
        // Extractor yields no fragments for the fetched body.
        let h = harness(serp_results, FetchScript::Content("<html>"), r#"{"fragments": []}"#);

        let outcome = h
            .pipeline
            .run_target(&h.task, &Target::query("anything"), &CancellationToken::new())
            .await
            .unwrap();

        // SERP page plus the academic search hit.
        let serp_page = h
            .store
            .get_page_by_url("https://plain.example/post")
            .unwrap()
            .unwrap();
        assert_eq!(serp_page.page_type, PageType::Empty);
        assert!(outcome.pages.contains(&serp_page.id));
    }

    #[tokio::test]
    async fn test_challenge_surfaces_in_outcome() {
        let h = harness(Vec::new(), FetchScript::Challenge, FRAGMENTS);
        let outcome = h
            .pipeline
            .run_target(
                &h.task,
                &Target::url("https://walled.example/paper"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let challenge = outcome.challenge.expect("challenge should surface");
        assert_eq!(challenge.domain, "walled.example");
        assert_eq!(challenge.challenge_type, ChallengeType::Captcha);
    }

    #[tokio::test]
    async fn test_blocked_domain_skipped() {
        let h = harness(Vec::new(), FetchScript::Content("<html>"), FRAGMENTS);
        h.store
            .set_domain_policy("blocked.example", "blocked", None)
            .unwrap();

        let outcome = h
            .pipeline
            .run_target(
                &h.task,
                &Target::url("https://blocked.example/a"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(outcome.pages.is_empty());
        assert_eq!(h.fetch_calls.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_observed_between_entries() {
        let h = harness(Vec::new(), FetchScript::Content("<html>"), FRAGMENTS);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .pipeline
            .run_target(&h.task, &Target::doi("10.1/x"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        let _ = h.academic.calls.load(Ordering::SeqCst);
    }
}
