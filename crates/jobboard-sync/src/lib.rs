//! Fetch pipeline orchestration: category taxonomy, provider runs, scheduling, seeding.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobboard_adapters::{
    transform_job, AdapterContext, JSearchAdapter, JSearchConfig, JobSearchSource,
    DEFAULT_JSEARCH_BASE_URL,
};
use jobboard_core::{CategoryDefinition, FetchSummary, JobPosting};
use jobboard_storage::{BudgetDecision, JobStore, RequestBudget, RequestBudgetConfig};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobboard-sync";

pub const DEFAULT_CATEGORIES_YAML: &str = include_str!("../categories.yaml");
pub const DEFAULT_FETCH_CRON: &str = "0 0 0 */2 * *";

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryRegistry {
    #[serde(default)]
    pub version: u32,
    pub categories: Vec<CategoryDefinition>,
}

impl CategoryRegistry {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(DEFAULT_CATEGORIES_YAML).context("parsing embedded categories.yaml")
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text)?;
        if registry.categories.is_empty() {
            anyhow::bail!("category registry is empty");
        }
        Ok(registry)
    }

    /// Load the taxonomy from `path`, or the embedded default when no override is given.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Self::builtin();
        };
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.categories.iter().map(|c| c.name.as_str()).collect()
    }

    /// Search phrases for a category; a category without any gets `"<name> internship"`.
    pub fn phrases_for(category: &CategoryDefinition) -> Vec<String> {
        if category.search_phrases.is_empty() {
            vec![format!("{} internship", category.name)]
        } else {
            category.search_phrases.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub database_path: PathBuf,
    pub api_key: String,
    pub api_host: Option<String>,
    pub api_base_url: String,
    pub max_requests_per_hour: u32,
    pub max_requests_per_run: u32,
    pub request_delay_ms: u64,
    pub scheduler_enabled: bool,
    pub fetch_cron: String,
    pub startup_delay_secs: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub categories_file: Option<PathBuf>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let budget = RequestBudgetConfig::default();
        Self {
            database_path: PathBuf::from("./jobs.db"),
            api_key: String::new(),
            api_host: None,
            api_base_url: DEFAULT_JSEARCH_BASE_URL.to_string(),
            max_requests_per_hour: budget.max_per_hour,
            max_requests_per_run: budget.per_run_ceiling,
            request_delay_ms: budget.min_interval.as_millis() as u64,
            scheduler_enabled: true,
            fetch_cron: DEFAULT_FETCH_CRON.to_string(),
            startup_delay_secs: 10,
            user_agent: "jobboard-bot/0.1".to_string(),
            http_timeout_secs: 20,
            categories_file: None,
        }
    }
}

impl FetchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            api_key: std::env::var("RAPIDAPI_KEY").unwrap_or_default(),
            api_host: std::env::var("RAPIDAPI_HOST")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            api_base_url: std::env::var("JOBS_API_BASE_URL").unwrap_or(defaults.api_base_url),
            max_requests_per_hour: env_parse("FETCH_MAX_REQUESTS_PER_HOUR")
                .unwrap_or(defaults.max_requests_per_hour),
            max_requests_per_run: env_parse("FETCH_MAX_REQUESTS_PER_RUN")
                .unwrap_or(defaults.max_requests_per_run),
            request_delay_ms: env_parse("FETCH_REQUEST_DELAY_MS")
                .unwrap_or(defaults.request_delay_ms),
            scheduler_enabled: std::env::var("FETCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            fetch_cron: std::env::var("FETCH_CRON").unwrap_or(defaults.fetch_cron),
            startup_delay_secs: env_parse("FETCH_STARTUP_DELAY_SECS")
                .unwrap_or(defaults.startup_delay_secs),
            user_agent: std::env::var("JOBBOARD_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            categories_file: std::env::var("CATEGORIES_FILE").ok().map(PathBuf::from),
        }
    }

    /// Fetching needs a provider key; without one the trigger and scheduler stay off.
    pub fn fetching_enabled(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn budget_config(&self) -> RequestBudgetConfig {
        RequestBudgetConfig {
            max_per_hour: self.max_requests_per_hour,
            per_run_ceiling: self.max_requests_per_run,
            min_interval: Duration::from_millis(self.request_delay_ms),
            ..Default::default()
        }
    }

    pub fn jsearch_config(&self) -> JSearchConfig {
        JSearchConfig {
            base_url: self.api_base_url.clone(),
            api_key: self.api_key.clone(),
            api_host: self.api_host.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchRunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub requests_issued: u32,
    pub postings_fetched: usize,
    pub summary: FetchSummary,
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Completed(FetchRunReport),
    AlreadyRunning,
}

/// Postings gathered from the provider in one run, before persistence.
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    pub postings: Vec<JobPosting>,
    pub requests_issued: u32,
}

/// Clears the in-flight flag when a run ends, including on early return.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct FetchPipeline {
    store: JobStore,
    source: Arc<dyn JobSearchSource>,
    budget: Arc<RequestBudget>,
    registry: Arc<CategoryRegistry>,
    running: AtomicBool,
}

impl FetchPipeline {
    pub fn new(
        store: JobStore,
        source: Arc<dyn JobSearchSource>,
        budget: Arc<RequestBudget>,
        registry: Arc<CategoryRegistry>,
    ) -> Self {
        Self {
            store,
            source,
            budget,
            registry,
            running: AtomicBool::new(false),
        }
    }

    /// Wire the JSearch adapter and a fresh request budget from configuration.
    pub fn from_config(
        config: &FetchConfig,
        store: JobStore,
        registry: Arc<CategoryRegistry>,
    ) -> Result<Self> {
        let adapter = JSearchAdapter::new(config.jsearch_config()).context("building JSearch adapter")?;
        let budget = Arc::new(RequestBudget::new(config.budget_config()));
        Ok(Self::new(store, Arc::new(adapter), budget, registry))
    }

    pub fn budget(&self) -> &Arc<RequestBudget> {
        &self.budget
    }

    pub fn registry(&self) -> &Arc<CategoryRegistry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Fetch every category, then persist what came back. A second call while
    /// one is in flight returns `AlreadyRunning` and does nothing.
    pub async fn run_full_fetch(&self) -> Result<FetchOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("fetch already in progress; skipping");
            return Ok(FetchOutcome::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let run_id = Uuid::new_v4();
        let span = info_span!("fetch_run", %run_id, source_id = self.source.source_id());
        async move {
            let started_at = Utc::now();
            info!(categories = self.registry.categories.len(), "starting job fetch");

            let batch = self.fetch_postings(run_id).await;
            let postings_fetched = batch.postings.len();
            let summary = self.save_postings(&batch.postings).await?;

            let finished_at = Utc::now();
            info!(
                requests = batch.requests_issued,
                fetched = postings_fetched,
                saved = summary.saved,
                errors = summary.errors,
                "job fetch completed"
            );
            Ok::<_, anyhow::Error>(FetchOutcome::Completed(FetchRunReport {
                run_id,
                started_at,
                finished_at,
                requests_issued: batch.requests_issued,
                postings_fetched,
                summary,
            }))
        }
        .instrument(span)
        .await
    }

    /// Query the provider for each category and phrase within the request budget.
    /// Provider failures are logged and contribute no postings.
    pub async fn fetch_postings(&self, run_id: Uuid) -> FetchedBatch {
        let mut batch = FetchedBatch::default();

        'categories: for category in &self.registry.categories {
            for phrase in CategoryRegistry::phrases_for(category) {
                let decision = self.budget.acquire(batch.requests_issued).await;
                if decision != BudgetDecision::Granted {
                    info!(
                        category = %category.name,
                        ?decision,
                        "request budget refused; skipping remaining phrases"
                    );
                    continue 'categories;
                }
                batch.requests_issued += 1;

                let ctx = AdapterContext {
                    run_id,
                    category: category.name.clone(),
                };
                match self.source.search(&ctx, &phrase).await {
                    Ok(raw) => {
                        let now = Utc::now();
                        info!(category = %category.name, query = %phrase, count = raw.len(), "fetched listings");
                        batch
                            .postings
                            .extend(raw.iter().map(|job| transform_job(job, &category.name, now)));
                    }
                    Err(err) => {
                        warn!(category = %category.name, query = %phrase, error = %err, "provider search failed");
                    }
                }
            }
        }

        batch
    }

    /// Upsert postings one by one. The store must answer a ping first; after that,
    /// individual row failures are counted rather than aborting the batch.
    pub async fn save_postings(&self, postings: &[JobPosting]) -> Result<FetchSummary> {
        self.store.ping().await.context("job store unavailable")?;

        let mut summary = FetchSummary::default();
        for posting in postings {
            match self.store.upsert(posting).await {
                Ok(()) => summary.saved += 1,
                Err(err) => {
                    summary.errors += 1;
                    error!(job_id = %posting.job_id, error = %err, "failed to save posting");
                }
            }
        }
        Ok(summary)
    }
}

/// Run a fetch and log the result; used by the scheduler and the startup task.
pub async fn run_and_log(pipeline: &FetchPipeline, trigger: &str) {
    match pipeline.run_full_fetch().await {
        Ok(FetchOutcome::Completed(report)) => info!(
            trigger,
            run_id = %report.run_id,
            saved = report.summary.saved,
            errors = report.summary.errors,
            "fetch finished"
        ),
        Ok(FetchOutcome::AlreadyRunning) => info!(trigger, "fetch skipped; another run is active"),
        Err(err) => error!(trigger, error = ?err, "fetch failed"),
    }
}

/// Build and start a cron scheduler that runs the pipeline on `cron`
/// (six fields, seconds first).
pub async fn start_scheduler(pipeline: Arc<FetchPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            run_and_log(&pipeline, "schedule").await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(cron, "fetch scheduler started");
    Ok(sched)
}

pub fn spawn_startup_fetch(pipeline: Arc<FetchPipeline>, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        run_and_log(&pipeline, "startup").await;
    })
}

/// Load a JSON array of postings and upsert each one.
pub async fn seed_from_file(store: &JobStore, path: &Path) -> Result<FetchSummary> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let postings: Vec<JobPosting> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let mut summary = FetchSummary::default();
    for posting in &postings {
        if posting.job_id.trim().is_empty() {
            warn!(title = %posting.title, "seed posting without job_id skipped");
            summary.errors += 1;
            continue;
        }
        match store.upsert(posting).await {
            Ok(()) => summary.saved += 1,
            Err(err) => {
                summary.errors += 1;
                error!(job_id = %posting.job_id, error = %err, "failed to seed posting");
            }
        }
    }
    info!(path = %path.display(), saved = summary.saved, errors = summary.errors, "seed complete");
    Ok(summary)
}

pub async fn run_fetch_once_from_env() -> Result<FetchOutcome> {
    let config = FetchConfig::from_env();
    if !config.fetching_enabled() {
        anyhow::bail!("RAPIDAPI_KEY is not set; fetching is disabled");
    }
    let registry = Arc::new(CategoryRegistry::load(config.categories_file.as_deref()).await?);
    let store = JobStore::open(&config.database_path).await?;
    let pipeline = FetchPipeline::from_config(&config, store.clone(), registry)?;
    let outcome = pipeline.run_full_fetch().await;
    store.close().await;
    outcome
}
