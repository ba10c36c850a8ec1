//! Priority-aware job scheduler.
//!
//! A fixed pool of cooperative workers shares the job table. Claiming is a
//! conditional update that succeeds exactly once under concurrent
//! attempts; losers retry selection. Concurrency within a task is allowed,
//! and the only cross-job ordering guarantee is the follow-up chain.

use crate::auth::{AuthAction, AuthItemId, AuthQueue, ChallengeType, ResolveOutcome};
use crate::calibrate::Calibration;
use crate::config::{ExtractionConfig, RetryPolicy, WorkerConfig};
use crate::error::{Error, Result};
use crate::extract::nli::{judge_pairs, select_candidate_pairs};
use crate::extract::NliClassifier;
use crate::graph::engine::EvidenceGraph;
use crate::graph::types::*;
use crate::index::CanonicalEntry;
use crate::jobs::types::*;
use crate::search::academic::AcademicClient;
use crate::search::pipeline::SearchPipeline;
use crate::storage::store::Store;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Point-in-time view of a task, served to get_status.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub status: TaskStatus,
    /// Job counts keyed "kind/state".
    pub progress: HashMap<String, u32>,
    pub metrics: TaskMetrics,
    pub budget: TaskBudget,
    pub milestones: Milestones,
    /// Domains with pending auth items blocking this task.
    pub waiting_for: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_summary: Option<serde_json::Value>,
}

struct RunningJob {
    task_id: TaskId,
    kind: JobKind,
    token: CancellationToken,
}

/// The scheduler. Shared behind an Arc by workers and the tool surface.
pub struct Scheduler {
    store: Store,
    pipeline: Arc<SearchPipeline>,
    academic: Arc<dyn AcademicClient>,
    nli: Arc<dyn NliClassifier>,
    calibration: Calibration,
    extraction: ExtractionConfig,
    auth: AuthQueue,
    workers: WorkerConfig,
    retry: RetryPolicy,
    running: Mutex<HashMap<JobId, RunningJob>>,
    status_tx: watch::Sender<u64>,
    shutdown: CancellationToken,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        pipeline: Arc<SearchPipeline>,
        academic: Arc<dyn AcademicClient>,
        nli: Arc<dyn NliClassifier>,
        calibration: Calibration,
        extraction: ExtractionConfig,
        workers: WorkerConfig,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(0);
        Arc::new(Self {
            auth: AuthQueue::new(store.clone()),
            store,
            pipeline,
            academic,
            nli,
            calibration,
            extraction,
            workers,
            retry,
            running: Mutex::new(HashMap::new()),
            status_tx,
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the worker pool.
    pub fn spawn_workers(self: &Arc<Self>) {
        for worker_id in 0..self.workers.count.max(1) {
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                scheduler.worker_loop(worker_id).await;
            });
        }
    }

    /// Signal workers to stop after their current job.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn auth_queue(&self) -> &AuthQueue {
        &self.auth
    }

    /// Subscribe to status-version bumps for long-polling.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.status_tx.subscribe()
    }

    fn notify(&self) {
        self.status_tx.send_modify(|version| *version += 1);
    }

    // ==================== Task lifecycle ====================

    pub fn create_task(
        &self,
        central_hypothesis: &str,
        budget: Option<TaskBudget>,
        priority_domains: Vec<String>,
    ) -> Result<Task> {
        let mut task = Task::new(central_hypothesis).with_priority_domains(priority_domains);
        if let Some(budget) = budget {
            task = task.with_budget(budget);
        }
        self.store.insert_task(&task)?;
        tracing::info!(task = %task.id, "task created");
        Ok(task)
    }

    /// Queue targets for a task. Idempotent per (task, kind, value).
    ///
    /// Fails when the task is paused unless resume is set, in which case
    /// the task transitions back to exploring.
    pub fn queue_targets(
        &self,
        task_id: &TaskId,
        targets: &[Target],
        resume: bool,
    ) -> Result<Vec<JobId>> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| Error::invalid_input("task_id", "an existing task"))?;

        match task.status {
            TaskStatus::Paused if !resume => {
                return Err(Error::invalid_input(
                    "task_id",
                    "a non-paused task (pass resume=true to resume)",
                ))
            }
            TaskStatus::Failed => {
                return Err(Error::invalid_input("task_id", "a non-failed task"))
            }
            _ => {}
        }

        let mut ids = Vec::new();
        for target in targets {
            let job = Job::new(
                task_id.clone(),
                JobInput::Target(target.clone()),
                target.priority,
            );
            let (id, _created) = self.store.enqueue_job(&job)?;
            ids.push(id);
        }

        self.store.set_task_status(task_id, TaskStatus::Exploring)?;
        self.notify();
        Ok(ids)
    }

    /// Queue unfetched cited pages as new targets.
    pub fn queue_reference_candidates(
        &self,
        task_id: &TaskId,
        include_ids: Option<Vec<PageId>>,
        exclude_ids: Option<Vec<PageId>>,
        limit: usize,
        dry_run: bool,
    ) -> Result<(u32, Vec<JobId>)> {
        if include_ids.is_some() && exclude_ids.is_some() {
            return Err(Error::invalid_input(
                "include_ids",
                "exactly one of include_ids and exclude_ids",
            ));
        }

        if !dry_run {
            let milestones = self.store.milestones(task_id)?;
            if !milestones.citation_chase_ready {
                return Err(Error::invalid_input(
                    "task_id",
                    "a task with citation_chase_ready=true",
                ));
            }
        }

        let graph = EvidenceGraph::load_from_db(&self.store, task_id)?;
        let mut candidates = graph.reference_candidates();

        if let Some(include) = &include_ids {
            let keep: HashSet<&PageId> = include.iter().collect();
            candidates.retain(|id| keep.contains(id));
        }
        if let Some(exclude) = &exclude_ids {
            let drop: HashSet<&PageId> = exclude.iter().collect();
            candidates.retain(|id| !drop.contains(id));
        }
        candidates.truncate(limit);

        if dry_run {
            return Ok((candidates.len() as u32, Vec::new()));
        }

        let pages = self.store.pages_by_ids(&candidates)?;
        let mut ids = Vec::new();
        for page in pages {
            let target = match page.paper_metadata.as_ref().and_then(|m| m.doi.as_ref()) {
                Some(doi) => Target::doi(doi.clone()),
                None => Target::url(page.url.clone()),
            };
            let job = Job::new(task_id.clone(), JobInput::Target(target), Priority::Low);
            let (id, _) = self.store.enqueue_job(&job)?;
            ids.push(id);
        }
        self.notify();
        Ok((ids.len() as u32, ids))
    }

    /// Stop a task. Graceful lets in-flight jobs finish; immediate signals
    /// them cooperatively; full also cascades to follow-ups and pending
    /// auth items.
    pub async fn stop_task(
        &self,
        task_id: &TaskId,
        mode: CancelMode,
        scope: CancelScope,
    ) -> Result<TaskStatus> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| Error::invalid_input("task_id", "an existing task"))?;

        let cancelled = self.store.cancel_queued_jobs(task_id, scope)?;
        tracing::info!(task = %task.id, cancelled, mode = ?mode, "stop requested");

        if matches!(mode, CancelMode::Immediate | CancelMode::Full) {
            let running = self.running.lock().await;
            for job in running.values() {
                if job.task_id == *task_id && scope.includes(job.kind) {
                    job.token.cancel();
                }
            }
        }

        if mode == CancelMode::Full {
            for job in self.store.awaiting_auth_jobs(task_id, scope)? {
                self.store.transition_job(
                    &job.id,
                    JobState::Cancelled,
                    Some("task stopped (full)"),
                )?;
            }
            for item in self.store.auth_items_for_task(task_id)? {
                let _ = self.auth.resolve(&item.id, AuthAction::Skipped);
            }
        }

        self.store.set_task_status(task_id, TaskStatus::Paused)?;
        self.notify();
        Ok(TaskStatus::Paused)
    }

    /// Resolve an auth item; on solved, blocked jobs requeue and the SERP
    /// circuit breaker resets.
    pub fn resolve_auth(&self, item_id: &AuthItemId, action: AuthAction) -> Result<ResolveOutcome> {
        let outcome = self.auth.resolve(item_id, action)?;
        if action == AuthAction::Solved {
            self.pipeline.breaker().reset();
        }
        self.notify();
        Ok(outcome)
    }

    // ==================== Status ====================

    pub fn status_snapshot(&self, task_id: &TaskId, detail: bool) -> Result<StatusSnapshot> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| Error::invalid_input("task_id", "an existing task"))?;

        let mut progress: HashMap<String, u32> = HashMap::new();
        for job in self.store.jobs_for_task(task_id)? {
            *progress
                .entry(format!("{}/{}", job.kind, job.state))
                .or_insert(0) += 1;
        }

        let metrics = self.store.compute_task_metrics(task_id)?;
        let milestones = self.store.milestones(task_id)?;
        let waiting_for: Vec<String> = self
            .store
            .auth_items_for_task(task_id)?
            .into_iter()
            .map(|item| item.domain)
            .collect();

        let evidence_summary = if detail {
            let mut params = serde_json::Map::new();
            params.insert(
                "task_id".to_string(),
                serde_json::Value::from(task_id.to_string()),
            );
            Some(serde_json::Value::Array(crate::graph::views::run_view(
                &self.store,
                "v_claim_evidence_summary",
                &params,
            )?))
        } else {
            None
        };

        Ok(StatusSnapshot {
            status: task.status,
            progress,
            metrics,
            budget: task.budget,
            milestones,
            waiting_for,
            evidence_summary,
        })
    }

    /// Long-polling status. With wait=0 returns immediately; otherwise
    /// unblocks on the earliest of a status/milestone/progress change or
    /// the deadline. Multiple callers may wait concurrently.
    pub async fn wait_status(
        &self,
        task_id: &TaskId,
        wait_secs: u64,
        detail: bool,
    ) -> Result<StatusSnapshot> {
        let snapshot = self.status_snapshot(task_id, detail)?;
        if wait_secs == 0 {
            return Ok(snapshot);
        }

        let fingerprint = Self::fingerprint(&snapshot);
        let deadline = Instant::now() + Duration::from_secs(wait_secs);
        let mut rx = self.subscribe();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.status_snapshot(task_id, detail);
            }
            match timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => {
                    let current = self.status_snapshot(task_id, detail)?;
                    if Self::fingerprint(&current) != fingerprint {
                        return Ok(current);
                    }
                }
                // Channel closed or deadline reached: return current state.
                Ok(Err(_)) | Err(_) => return self.status_snapshot(task_id, detail),
            }
        }
    }

    fn fingerprint(snapshot: &StatusSnapshot) -> String {
        let mut progress: Vec<(&String, &u32)> = snapshot.progress.iter().collect();
        progress.sort();
        format!(
            "{}|{:?}|{:?}|{:?}",
            snapshot.status, snapshot.milestones, progress, snapshot.metrics
        )
    }

    // ==================== Worker loop ====================

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        tracing::debug!(worker_id, "worker started");
        let poll = Duration::from_millis(self.workers.poll_interval_ms.max(10));
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.store.claim_next_job() {
                Ok(Some(job)) => {
                    self.notify();
                    self.run_job(job).await;
                    self.notify();
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(poll) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "claim failed");
                    sleep(poll).await;
                }
            }
        }
        tracing::debug!(worker_id, "worker stopped");
    }

    async fn run_job(&self, job: Job) {
        // Wall-clock budget: a task past its window runs nothing further.
        if let Ok(Some(task)) = self.store.get_task(&job.task_id) {
            let elapsed = (chrono::Utc::now() - task.created_at).num_seconds();
            if task.budget.wall_clock_secs > 0 && elapsed > task.budget.wall_clock_secs as i64 {
                let _ = self.store.transition_job(
                    &job.id,
                    JobState::Cancelled,
                    Some("wall clock budget exhausted"),
                );
                let _ = self.store.cancel_queued_jobs(&job.task_id, CancelScope::All);
                let _ = self.store.set_task_status(&job.task_id, TaskStatus::Paused);
                tracing::info!(task = %job.task_id, "wall clock budget exhausted; task paused");
                return;
            }
        }

        let token = self.shutdown.child_token();
        {
            let mut running = self.running.lock().await;
            running.insert(
                job.id.clone(),
                RunningJob {
                    task_id: job.task_id.clone(),
                    kind: job.kind,
                    token: token.clone(),
                },
            );
        }

        // Cancellation is observed at the next suspension point: the whole
        // job races against its token.
        let result = tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            result = self.dispatch(&job, &token) => result,
        };

        {
            let mut running = self.running.lock().await;
            running.remove(&job.id);
        }

        match result {
            Ok(JobEnd::Completed) => {
                self.store
                    .transition_job(&job.id, JobState::Completed, None)
                    .unwrap_or_else(|e| {
                        tracing::error!(job = %job.id, error = %e, "completion write failed");
                        false
                    });
            }
            Ok(JobEnd::AwaitingAuth) => {
                // Already parked by the auth queue.
            }
            Err(Error::Cancelled) => {
                let _ = self
                    .store
                    .transition_job(&job.id, JobState::Cancelled, Some("cancelled"));
            }
            Err(Error::AuthChallenge { domain, challenge }) => {
                let challenge_type =
                    ChallengeType::parse(&challenge).unwrap_or(ChallengeType::Captcha);
                if let Err(e) =
                    self.auth
                        .report_challenge(&domain, challenge_type, vec![job.id.clone()])
                {
                    tracing::error!(job = %job.id, error = %e, "auth challenge report failed");
                    let note = format!("auth challenge on {}", domain);
                    let _ = self
                        .store
                        .transition_job(&job.id, JobState::Failed, Some(note.as_str()));
                }
            }
            Err(e) => {
                let message = format!("{}: {}", e.kind(), e);
                tracing::warn!(job = %job.id, error = %message, "job failed");
                let _ = self
                    .store
                    .transition_job(&job.id, JobState::Failed, Some(message.as_str()));
                self.fail_task_if_recurrent_storage_errors(&job.task_id, &e);
                self.maybe_retry(&job, &e);
            }
        }

        self.complete_task_if_drained(&job.task_id);
    }

    /// Recurrent fatal storage errors take the whole task down.
    fn fail_task_if_recurrent_storage_errors(&self, task_id: &TaskId, error: &Error) {
        if !matches!(error, Error::Storage(_)) {
            return;
        }
        let storage_failures = self
            .store
            .jobs_for_task(task_id)
            .map(|jobs| {
                jobs.iter()
                    .filter(|j| {
                        j.state == JobState::Failed
                            && j.error_message
                                .as_deref()
                                .map(|m| m.starts_with("storage"))
                                .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0);
        if storage_failures >= 3 {
            tracing::error!(task = %task_id, storage_failures, "recurrent storage failures; task failed");
            let _ = self.store.set_task_status(task_id, TaskStatus::Failed);
        }
    }

    /// An exploring task with every milestone reached and no live jobs has
    /// finished its exploration.
    fn complete_task_if_drained(&self, task_id: &TaskId) {
        let done = (|| -> Result<bool> {
            let task = match self.store.get_task(task_id)? {
                Some(task) => task,
                None => return Ok(false),
            };
            if task.status != TaskStatus::Exploring {
                return Ok(false);
            }
            let milestones = self.store.milestones(task_id)?;
            Ok(milestones.target_queue_drained
                && milestones.nli_verification_done
                && milestones.citation_chase_ready
                && !self.store.has_live_jobs(task_id)?)
        })()
        .unwrap_or(false);

        if done {
            let _ = self
                .store
                .set_task_status(task_id, TaskStatus::Completed);
            tracing::info!(task = %task_id, "exploration complete");
        }
    }

    /// Failed jobs are not retried automatically unless the retry policy
    /// opts in; then only transient-class failures requeue, as fresh jobs,
    /// with exponential backoff.
    fn maybe_retry(&self, job: &Job, error: &Error) {
        if self.retry.max_auto_retries == 0 || !error.is_retryable() {
            return;
        }
        let dedup_key = job.input.dedup_key(&job.task_id);
        let attempts = match self.store.failed_attempts(&dedup_key) {
            Ok(attempts) => attempts,
            Err(_) => return,
        };
        if attempts > self.retry.max_auto_retries {
            return;
        }

        let retry_job = Job::new(job.task_id.clone(), job.input.clone(), job.priority);
        let store = self.store.clone();
        let delay = self.retry.delay_for_attempt(attempts.saturating_sub(1));
        tokio::spawn(async move {
            sleep(delay).await;
            if let Err(e) = store.enqueue_job(&retry_job) {
                tracing::warn!(error = %e, "retry enqueue failed");
            }
        });
    }

    async fn dispatch(&self, job: &Job, token: &CancellationToken) -> Result<JobEnd> {
        match &job.input {
            JobInput::Target(target) => self.run_target_job(job, target, token).await,
            JobInput::VerifyNli { .. } => {
                self.run_verify_nli(&job.task_id).await?;
                Ok(JobEnd::Completed)
            }
            JobInput::CitationGraph { page_id, .. } => {
                self.run_citation_graph(page_id).await?;
                Ok(JobEnd::Completed)
            }
        }
    }

    async fn run_target_job(
        &self,
        job: &Job,
        target: &Target,
        token: &CancellationToken,
    ) -> Result<JobEnd> {
        let task = self
            .store
            .get_task(&job.task_id)?
            .ok_or_else(|| Error::Internal(format!("task {} missing", job.task_id)))?;

        let outcome = self.pipeline.run_target(&task, target, token).await?;

        if let Some(challenge) = outcome.challenge {
            // Partial results stay persisted; the job parks on the item.
            self.auth.report_challenge(
                &challenge.domain,
                challenge.challenge_type,
                vec![job.id.clone()],
            )?;
            return Ok(JobEnd::AwaitingAuth);
        }

        // Follow-up chaining: verification and one citation expansion per
        // academic source page, once this target is done.
        if !outcome.academic_pages.is_empty() {
            let verify = Job::new(
                job.task_id.clone(),
                JobInput::VerifyNli { attempt: 0 },
                Priority::Medium,
            );
            self.store.enqueue_job(&verify)?;

            for page_id in &outcome.academic_pages {
                let citation = Job::new(
                    job.task_id.clone(),
                    JobInput::CitationGraph {
                        page_id: page_id.clone(),
                        attempt: 0,
                    },
                    Priority::Low,
                );
                self.store.enqueue_job(&citation)?;
            }
        }

        Ok(JobEnd::Completed)
    }

    /// Cross-source NLI verification: claims whose evidence spans several
    /// pages get their shortlisted fragment pairs re-judged.
    async fn run_verify_nli(&self, task_id: &TaskId) -> Result<()> {
        let graph = EvidenceGraph::load_from_db(&self.store, task_id)?;
        let multi_source: HashSet<String> = graph
            .multi_source_claims()
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        if multi_source.is_empty() {
            return Ok(());
        }

        let claims: Vec<(ClaimId, String, Vec<f32>)> = self
            .store
            .claim_embeddings(Some(task_id))?
            .into_iter()
            .filter(|(id, _, _)| multi_source.contains(&id.to_string()))
            .collect();
        let fragments = self.store.fragment_embeddings(Some(task_id))?;

        // Pairs already judged keep their stored verdict; only new
        // cross-source pairs go to the classifier.
        let judged: HashSet<(String, String)> = graph
            .nli_edges()
            .iter()
            .map(|e| (e.source_id.clone(), e.target_id.clone()))
            .collect();

        let pairs: Vec<_> = select_candidate_pairs(&claims, &fragments, &self.extraction)
            .into_iter()
            .filter(|pair| {
                !judged.contains(&(pair.fragment_id.to_string(), pair.claim_id.to_string()))
            })
            .collect();

        let written =
            judge_pairs(&self.store, self.nli.as_ref(), &self.calibration, &pairs).await?;
        tracing::info!(task = %task_id, pairs = pairs.len(), written, "cross-source verification done");
        Ok(())
    }

    /// One-hop citation expansion for an academic source page. Cited works
    /// become unfetched pages plus cites edges; further hops happen only
    /// through queue_reference_candidates.
    async fn run_citation_graph(&self, page_id: &PageId) -> Result<()> {
        let page = match self.store.get_page(page_id)? {
            Some(page) => page,
            None => return Ok(()),
        };
        let doi = match page.paper_metadata.as_ref().and_then(|m| m.doi.clone()) {
            Some(doi) => doi,
            None => {
                tracing::debug!(page = %page_id, "no doi; citation expansion skipped");
                return Ok(());
            }
        };

        let references = self.academic.references(&doi).await?;
        let citation_source = match references.first().map(|r| r.source) {
            Some(SourceApi::OpenAlex) => CitationSource::OpenAlex,
            _ => CitationSource::SemanticScholar,
        };

        let mut created = 0u32;
        for reference in references {
            let entry = CanonicalEntry::from_academic(
                reference.doi.clone(),
                reference.url.clone(),
                reference.title.clone(),
                None,
                reference.first_author.clone(),
                reference.metadata(),
            );
            if entry.url.is_empty() {
                continue;
            }
            let mut cited = Page::new(&entry.url, &entry.domain, PageType::Academic);
            cited.title = entry.title.clone();
            cited.paper_metadata = Some(entry.metadata.clone());
            let (cited_id, was_new) = self.store.upsert_page(&cited)?;
            self.store
                .insert_cites_edge(&Edge::cites(page_id, &cited_id, citation_source))?;
            if was_new {
                created += 1;
            }
        }
        tracing::info!(page = %page_id, created, "citation expansion done");
        Ok(())
    }
}

impl Scheduler {
    /// Claim and run one job inline. Test hook; workers use the same path.
    #[cfg(test)]
    pub(crate) async fn tick(&self) -> Result<bool> {
        match self.store.claim_next_job()? {
            Some(job) => {
                self.run_job(job).await;
                self.notify();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

enum JobEnd {
    Completed,
    AwaitingAuth,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SerpConfig;
    use crate::extract::{
        EmbeddingClient, FragmentClaimExtractor, LlmExtractor, NliJudgement,
    };
    use crate::search::academic::PaperRecord;
    use crate::search::fetch::{FetchOutcome, FetchedPage, PageFetcher};
    use crate::search::serp::{EngineBreaker, SerpClient, SerpResult};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::Semaphore;

    struct StubAcademic;

    #[async_trait]
    impl AcademicClient for StubAcademic {
        async fn paper_by_doi(&self, doi: &str) -> Result<Option<PaperRecord>> {
            Ok(Some(PaperRecord {
                title: Some("Paper".to_string()),
                doi: Some(doi.to_string()),
                abstract_text: Some("An abstract with findings.".to_string()),
                year: Some(2020),
                source: SourceApi::SemanticScholar,
                ..Default::default()
            }))
        }

        async fn search(&self, _q: &str, _l: usize) -> Result<Vec<PaperRecord>> {
            Ok(Vec::new())
        }

        async fn references(&self, doi: &str) -> Result<Vec<PaperRecord>> {
            Ok(vec![PaperRecord {
                title: Some("Cited work".to_string()),
                doi: Some(format!("{}-ref", doi)),
                source: SourceApi::SemanticScholar,
                ..Default::default()
            }])
        }

        async fn doi_for_external_id(&self, _s: &str, _i: &str) -> Result<Option<String>> {
            Ok(None)
        }

        fn source(&self) -> SourceApi {
            SourceApi::SemanticScholar
        }
    }

    struct StubSerp;

    #[async_trait]
    impl SerpClient for StubSerp {
        async fn search(&self, _q: &str, _e: &str, _p: u32) -> Result<Vec<SerpResult>> {
            Ok(Vec::new())
        }
    }

    struct StubFetcher;

    #[async_trait]
    impl PageFetcher for StubFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchOutcome> {
            Ok(FetchOutcome::Content(FetchedPage {
                url: url.to_string(),
                final_url: url.to_string(),
                status: 200,
                content: "<html>body</html>".to_string(),
                content_type: None,
            }))
        }
    }

    struct StubLlm;

    #[async_trait]
    impl LlmExtractor for StubLlm {
        async fn extract_fragments(
            &self,
            _u: &str,
            _c: &str,
            _f: Option<&str>,
        ) -> Result<String> {
            Ok(r#"{"fragments": [{"type": "paragraph", "text": "A finding."}]}"#.to_string())
        }

        async fn extract_claims(&self, _t: &str, _h: &str, _f: Option<&str>) -> Result<String> {
            Ok(r#"{"claims": [{"text": "The hypothesis holds", "type": "factual", "confidence": 0.7}]}"#.to_string())
        }
    }

    struct StubNli;

    #[async_trait]
    impl crate::extract::NliClassifier for StubNli {
        async fn classify(&self, _p: &str, _h: &str) -> Result<NliJudgement> {
            Ok(NliJudgement {
                label: Relation::Supports,
                score: 0.85,
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

    fn scheduler() -> (Arc<Scheduler>, Store) {
        let store = Store::in_memory().unwrap();
        let academic: Arc<dyn AcademicClient> = Arc::new(StubAcademic);
        let nli: Arc<dyn crate::extract::NliClassifier> = Arc::new(StubNli);

        let extractor = Arc::new(FragmentClaimExtractor::new(
            store.clone(),
            Arc::new(StubLlm),
            nli.clone(),
            Arc::new(StubEmbedding),
            Calibration::Identity,
            ExtractionConfig::default(),
        ));
        let pipeline = Arc::new(SearchPipeline::new(
            store.clone(),
            academic.clone(),
            Arc::new(StubSerp),
            Arc::new(StubFetcher),
            extractor,
            Arc::new(Semaphore::new(1)),
            Arc::new(EngineBreaker::new(3)),
            SerpConfig::default(),
        ));

        let scheduler = Scheduler::new(
            store.clone(),
            pipeline,
            academic,
            nli,
            Calibration::Identity,
            ExtractionConfig::default(),
            WorkerConfig::default(),
            RetryPolicy::default(),
        );
        (scheduler, store)
    }

    #[tokio::test]
    async fn test_queue_targets_idempotent() {
        let (scheduler, _store) = scheduler();
        let task = scheduler.create_task("h", None, Vec::new()).unwrap();

        let first = scheduler
            .queue_targets(&task.id, &[Target::query("one query")], false)
            .unwrap();
        let second = scheduler
            .queue_targets(&task.id, &[Target::query("ONE Query")], false)
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_target_job_chains_follow_ups() {
        let (scheduler, store) = scheduler();
        let task = scheduler.create_task("h", None, Vec::new()).unwrap();
        scheduler
            .queue_targets(&task.id, &[Target::doi("10.1/x")], false)
            .unwrap();

        assert!(scheduler.tick().await.unwrap());

        let jobs = store.jobs_for_task(&task.id).unwrap();
        let kinds: Vec<JobKind> = jobs.iter().map(|j| j.kind).collect();
        assert!(kinds.contains(&JobKind::TargetQueue));
        assert!(kinds.contains(&JobKind::VerifyNli));
        assert!(kinds.contains(&JobKind::CitationGraph));

        let target = jobs.iter().find(|j| j.kind == JobKind::TargetQueue).unwrap();
        assert_eq!(target.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_citation_job_creates_cites_edges() {
        let (scheduler, store) = scheduler();
        let task = scheduler.create_task("h", None, Vec::new()).unwrap();
        scheduler
            .queue_targets(&task.id, &[Target::doi("10.1/x")], false)
            .unwrap();

        // Drain: target, then verify_nli and citation_graph follow-ups.
        while scheduler.tick().await.unwrap() {}

        let source = store.get_page_by_doi("10.1/x").unwrap().unwrap();
        let cites = store.cites_edges_from_pages(&[source.id]).unwrap();
        assert_eq!(cites.len(), 1);

        let cited = store.get_page_by_doi("10.1/x-ref").unwrap().unwrap();
        assert!(cited.fetched_at.is_none());

        let milestones = store.milestones(&task.id).unwrap();
        assert!(milestones.target_queue_drained);
        assert!(milestones.nli_verification_done);
        assert!(milestones.citation_chase_ready);

        // All milestones hold and nothing is live: exploration is done.
        let task = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_non_academic_task_completes() {
        let (scheduler, store) = scheduler();
        let task = scheduler.create_task("h", None, Vec::new()).unwrap();
        // A plain web page: no DOI, no academic API record, so no
        // verify_nli or citation_graph follow-up is ever spawned.
        scheduler
            .queue_targets(
                &task.id,
                &[Target::url("https://plain.example/post")],
                false,
            )
            .unwrap();

        while scheduler.tick().await.unwrap() {}

        let jobs = store.jobs_for_task(&task.id).unwrap();
        assert!(jobs.iter().all(|j| j.kind == JobKind::TargetQueue));

        let milestones = store.milestones(&task.id).unwrap();
        assert!(milestones.target_queue_drained);
        assert!(milestones.nli_verification_done);
        assert!(milestones.citation_chase_ready);

        let task = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_stop_task_scope_restricts() {
        let (scheduler, store) = scheduler();
        let task = scheduler.create_task("h", None, Vec::new()).unwrap();
        scheduler
            .queue_targets(
                &task.id,
                &[
                    Target::query("q1"),
                    Target::query("q2"),
                    Target::query("q3"),
                ],
                false,
            )
            .unwrap();
        // A follow-up-kind job queued alongside.
        store
            .enqueue_job(&Job::new(
                task.id.clone(),
                JobInput::CitationGraph {
                    page_id: PageId::new(),
                    attempt: 0,
                },
                Priority::Low,
            ))
            .unwrap();

        let status = scheduler
            .stop_task(&task.id, CancelMode::Immediate, CancelScope::TargetQueueOnly)
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Paused);

        let jobs = store.jobs_for_task(&task.id).unwrap();
        for job in &jobs {
            match job.kind {
                JobKind::TargetQueue => assert_eq!(job.state, JobState::Cancelled),
                JobKind::CitationGraph => assert_eq!(job.state, JobState::Queued),
                JobKind::VerifyNli => unreachable!(),
            }
        }
    }

    #[tokio::test]
    async fn test_paused_task_requires_resume() {
        let (scheduler, _store) = scheduler();
        let task = scheduler.create_task("h", None, Vec::new()).unwrap();
        scheduler
            .stop_task(&task.id, CancelMode::Graceful, CancelScope::All)
            .await
            .unwrap();

        let denied = scheduler.queue_targets(&task.id, &[Target::query("q")], false);
        assert!(denied.is_err());

        scheduler
            .queue_targets(&task.id, &[Target::query("q")], true)
            .unwrap();
        let snapshot = scheduler.status_snapshot(&task.id, false).unwrap();
        assert_eq!(snapshot.status, TaskStatus::Exploring);
    }

    #[tokio::test]
    async fn test_paused_jobs_not_claimed() {
        let (scheduler, _store) = scheduler();
        let task = scheduler.create_task("h", None, Vec::new()).unwrap();
        scheduler
            .queue_targets(&task.id, &[Target::doi("10.1/x")], false)
            .unwrap();
        scheduler
            .stop_task(&task.id, CancelMode::Graceful, CancelScope::FollowUpsOnly)
            .await
            .unwrap();

        // Target job still queued (scope spared it) but the task is
        // paused, so nothing is claimable.
        assert!(!scheduler.tick().await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_status_unblocks_on_change() {
        let (scheduler, _store) = scheduler();
        let task = scheduler.create_task("h", None, Vec::new()).unwrap();

        let waiter = {
            let scheduler = scheduler.clone();
            let task_id = task.id.clone();
            tokio::spawn(async move { scheduler.wait_status(&task_id, 30, false).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler
            .queue_targets(&task.id, &[Target::query("q")], false)
            .unwrap();

        let snapshot = waiter.await.unwrap().unwrap();
        assert_eq!(snapshot.status, TaskStatus::Exploring);
    }

    #[tokio::test]
    async fn test_wait_zero_returns_immediately() {
        let (scheduler, _store) = scheduler();
        let task = scheduler.create_task("h", None, Vec::new()).unwrap();
        let snapshot = scheduler.wait_status(&task.id, 0, false).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Created);
        assert!(snapshot.waiting_for.is_empty());
    }

    #[tokio::test]
    async fn test_reference_candidates_require_milestone() {
        let (scheduler, _store) = scheduler();
        let task = scheduler.create_task("h", None, Vec::new()).unwrap();

        // No citation_graph job has run: precondition unmet.
        let denied = scheduler.queue_reference_candidates(&task.id, None, None, 10, false);
        assert!(denied.is_err());

        // dry_run bypasses the precondition.
        let (count, ids) = scheduler
            .queue_reference_candidates(&task.id, None, None, 10, true)
            .unwrap();
        assert_eq!(count, 0);
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn test_reference_candidates_after_chase() {
        let (scheduler, store) = scheduler();
        let task = scheduler.create_task("h", None, Vec::new()).unwrap();
        scheduler
            .queue_targets(&task.id, &[Target::doi("10.1/x")], false)
            .unwrap();
        while scheduler.tick().await.unwrap() {}

        let (count, ids) = scheduler
            .queue_reference_candidates(&task.id, None, None, 10, false)
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(ids.len(), 1);

        let jobs = store.jobs_for_task(&task.id).unwrap();
        let queued: Vec<&Job> = jobs
            .iter()
            .filter(|j| j.state == JobState::Queued && j.kind == JobKind::TargetQueue)
            .collect();
        assert_eq!(queued.len(), 1);
    }

    #[tokio::test]
    async fn test_both_include_and_exclude_rejected() {
        let (scheduler, _store) = scheduler();
        let task = scheduler.create_task("h", None, Vec::new()).unwrap();
        let err = scheduler.queue_reference_candidates(
            &task.id,
            Some(vec![PageId::new()]),
            Some(vec![PageId::new()]),
            5,
            true,
        );
        assert!(err.is_err());
    }
}
