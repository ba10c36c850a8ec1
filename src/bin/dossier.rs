//! Research server entrypoint.
//!
//! Exit codes: 0 clean shutdown, 1 unrecoverable startup failure,
//! 2 schema/migration failure.

use dossier_core::calibrate::Calibration;
use dossier_core::config::Config;
use dossier_core::extract::{
    FragmentClaimExtractor, HttpEmbeddingClient, HttpLlmExtractor, HttpNliClassifier,
};
use dossier_core::jobs::limiter::{serp_permit, SourceLimiters};
use dossier_core::jobs::Scheduler;
use dossier_core::search::pipeline::RateLimitedAcademic;
use dossier_core::search::{
    AcademicClient, AcademicGateway, BrowserSerpClient, EngineBreaker, HttpPageFetcher,
    OpenAlexClient, SearchPipeline, SemanticScholarClient,
};
use dossier_core::storage::Store;
use dossier_core::tools::{build_registry, serve_stdio, ServerState};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "runtime startup failed");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(run())
}

async fn run() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "./dossier.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration load failed");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.data.data_dir) {
        tracing::error!(error = %e, "data directory unavailable");
        return ExitCode::from(1);
    }

    let store = match Store::open(config.db_path()) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "schema initialization failed");
            return ExitCode::from(2);
        }
    };

    let calibration = if config.calibration.enabled {
        match Calibration::load(&store, &config.calibration.source) {
            Ok(calibration) => calibration,
            Err(e) => {
                tracing::error!(error = %e, "calibration load failed");
                return ExitCode::from(1);
            }
        }
    } else {
        Calibration::Identity
    };

    let limiters = Arc::new(SourceLimiters::new(&config.sources));

    let s2 = config.source("semantic_scholar");
    let oa = config.source("openalex");
    let semantic_scholar: Arc<dyn AcademicClient> = Arc::new(RateLimitedAcademic::new(
        Arc::new(SemanticScholarClient::new(
            s2.base_url.clone(),
            s2.api_key.clone(),
            s2.timeout_secs,
        )),
        limiters.clone(),
    ));
    let openalex: Arc<dyn AcademicClient> = Arc::new(RateLimitedAcademic::new(
        Arc::new(OpenAlexClient::new(
            oa.base_url.clone(),
            oa.polite_contact.clone(),
            oa.timeout_secs,
        )),
        limiters.clone(),
    ));
    let academic: Arc<dyn AcademicClient> = Arc::new(AcademicGateway::new(vec![
        semantic_scholar,
        openalex,
    ]));

    let serp = Arc::new(BrowserSerpClient::new(
        config.serp.endpoint.clone(),
        config.serp.arm_timeout_secs,
    ));
    let fetcher = match HttpPageFetcher::new(&config.fetch) {
        Ok(fetcher) => Arc::new(fetcher),
        Err(e) => {
            tracing::error!(error = %e, "fetcher startup failed");
            return ExitCode::from(1);
        }
    };

    let llm = Arc::new(HttpLlmExtractor::new(&config.collaborators));
    let nli = Arc::new(HttpNliClassifier::new(&config.collaborators));
    let embedding = Arc::new(HttpEmbeddingClient::new(&config.collaborators));

    let extractor = Arc::new(FragmentClaimExtractor::new(
        store.clone(),
        llm,
        nli.clone(),
        embedding.clone(),
        calibration,
        config.extraction.clone(),
    ));

    let pipeline = Arc::new(SearchPipeline::new(
        store.clone(),
        academic.clone(),
        serp,
        fetcher,
        extractor,
        Arc::new(serp_permit()),
        Arc::new(EngineBreaker::new(config.serp.breaker_threshold)),
        config.serp.clone(),
    ));

    let scheduler = Scheduler::new(
        store.clone(),
        pipeline,
        academic,
        nli,
        calibration,
        config.extraction.clone(),
        config.workers.clone(),
        config.retry.clone(),
    );
    scheduler.spawn_workers();

    let state = Arc::new(ServerState {
        scheduler: scheduler.clone(),
        store,
        embedding,
        calibration_source: config.calibration.source.clone(),
    });
    let registry = Arc::new(build_registry(state));

    tracing::info!(tools = registry.count(), "serving on stdio");
    let served = serve_stdio(registry).await;
    scheduler.shutdown();

    match served {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            tracing::error!(error = %e, "transport failed");
            ExitCode::from(1)
        }
    }
}
