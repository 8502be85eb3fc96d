//! SQLite job store + provider HTTP utilities for the job board.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use jobboard_core::{JobPosting, DEFAULT_CURRENCY};
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobboard-storage";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS job_listings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT UNIQUE NOT NULL,
        title TEXT NOT NULL,
        company TEXT NOT NULL,
        location TEXT NOT NULL,
        description TEXT,
        requirements TEXT,
        employment_type TEXT,
        remote_allowed BOOLEAN DEFAULT 0,
        salary_min INTEGER,
        salary_max INTEGER,
        currency TEXT DEFAULT 'USD',
        category TEXT NOT NULL,
        job_url TEXT,
        company_url TEXT,
        posted_date TEXT,
        application_deadline TEXT,
        experience_level TEXT,
        education_level TEXT,
        skills TEXT,
        benefits TEXT,
        created_at DATETIME NOT NULL,
        updated_at DATETIME NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_category ON job_listings(category)",
    "CREATE INDEX IF NOT EXISTS idx_location ON job_listings(location)",
    "CREATE INDEX IF NOT EXISTS idx_employment_type ON job_listings(employment_type)",
    "CREATE INDEX IF NOT EXISTS idx_remote_allowed ON job_listings(remote_allowed)",
    "CREATE INDEX IF NOT EXISTS idx_posted_date ON job_listings(posted_date)",
];

const SELECT_COLUMNS: &str = "SELECT id, job_id, title, company, location, description, requirements, \
     employment_type, remote_allowed, salary_min, salary_max, currency, category, job_url, \
     company_url, posted_date, application_deadline, experience_level, education_level, skills, \
     benefits, created_at, updated_at FROM job_listings";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Optional, AND-combined predicates over `job_listings`.
///
/// Empty strings and non-positive numbers behave as if absent, so raw query
/// parameters can be passed through without pre-cleaning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilters {
    pub category: Option<String>,
    pub location: Option<String>,
    pub employment_type: Option<String>,
    pub remote_only: bool,
    pub search: Option<String>,
    pub salary_min: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl JobFilters {
    /// Same predicate with pagination stripped, for total counts.
    pub fn without_pagination(&self) -> Self {
        Self {
            limit: None,
            offset: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub category: String,
    pub count: i64,
    pub avg_salary_min: Option<f64>,
    pub avg_salary_max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetCount {
    pub value: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptions {
    pub categories: Vec<FacetCount>,
    #[serde(rename = "employmentTypes")]
    pub employment_types: Vec<FacetCount>,
    pub locations: Vec<FacetCount>,
}

/// Single-table posting store. Cloning shares the underlying pool.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (creating if missing) the SQLite file at `path` and ensure the schema.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("opening sqlite database {}", path.display()))?;
        let store = Self { pool };
        store
            .init_schema()
            .await
            .with_context(|| format!("initializing schema in {}", path.display()))?;
        info!(path = %path.display(), "job store ready");
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert a posting, or overwrite the row that already carries its `job_id`.
    /// `created_at` survives the overwrite; `updated_at` is always set to now.
    pub async fn upsert(&self, job: &JobPosting) -> Result<(), StoreError> {
        let now = Utc::now();
        let currency = if job.currency.trim().is_empty() {
            DEFAULT_CURRENCY
        } else {
            job.currency.as_str()
        };
        sqlx::query(
            r#"
            INSERT INTO job_listings (
                job_id, title, company, location, description, requirements,
                employment_type, remote_allowed, salary_min, salary_max, currency,
                category, job_url, company_url, posted_date, application_deadline,
                experience_level, education_level, skills, benefits, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                title = excluded.title,
                company = excluded.company,
                location = excluded.location,
                description = excluded.description,
                requirements = excluded.requirements,
                employment_type = excluded.employment_type,
                remote_allowed = excluded.remote_allowed,
                salary_min = excluded.salary_min,
                salary_max = excluded.salary_max,
                currency = excluded.currency,
                category = excluded.category,
                job_url = excluded.job_url,
                company_url = excluded.company_url,
                posted_date = excluded.posted_date,
                application_deadline = excluded.application_deadline,
                experience_level = excluded.experience_level,
                education_level = excluded.education_level,
                skills = excluded.skills,
                benefits = excluded.benefits,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.title)
        .bind(&job.company)
        .bind(&job.location)
        .bind(&job.description)
        .bind(&job.requirements)
        .bind(&job.employment_type)
        .bind(job.remote_allowed)
        .bind(job.salary_min)
        .bind(job.salary_max)
        .bind(currency)
        .bind(&job.category)
        .bind(&job.job_url)
        .bind(&job.company_url)
        .bind(&job.posted_date)
        .bind(&job.application_deadline)
        .bind(&job.experience_level)
        .bind(&job.education_level)
        .bind(&job.skills)
        .bind(&job.benefits)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Filtered listing ordered newest-posted first.
    pub async fn query(&self, filters: &JobFilters) -> Result<Vec<JobPosting>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        qb.push(" WHERE 1=1");
        push_filter_predicates(&mut qb, filters);
        qb.push(" ORDER BY posted_date DESC, created_at DESC, id ASC");

        let limit = filters.limit.filter(|l| *l > 0);
        let offset = filters.offset.filter(|o| *o > 0);
        match (limit, offset) {
            (Some(limit), offset) => {
                qb.push(" LIMIT ").push_bind(limit);
                if let Some(offset) = offset {
                    qb.push(" OFFSET ").push_bind(offset);
                }
            }
            // sqlite only accepts OFFSET after a LIMIT; -1 means unbounded
            (None, Some(offset)) => {
                qb.push(" LIMIT -1 OFFSET ").push_bind(offset);
            }
            (None, None) => {}
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(posting_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    /// Number of rows matching `filters`, ignoring `limit`/`offset`.
    pub async fn count(&self, filters: &JobFilters) -> Result<i64, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM job_listings WHERE 1=1");
        push_filter_predicates(&mut qb, filters);
        let total = qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(total)
    }

    pub async fn get_by_id(&self, job_id: &str) -> Result<Option<JobPosting>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE job_id = ?");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(posting_from_row)
            .transpose()
            .map_err(StoreError::from)
    }

    /// Per-category salary averages over rows that carry both salary bounds.
    pub async fn aggregate_stats(&self) -> Result<Vec<CategoryStats>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT category,
                   COUNT(*) AS count,
                   AVG(salary_min) AS avg_salary_min,
                   AVG(salary_max) AS avg_salary_max
              FROM job_listings
             WHERE salary_min IS NOT NULL AND salary_max IS NOT NULL
             GROUP BY category
             ORDER BY count DESC, category ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(CategoryStats {
                category: row.try_get("category")?,
                count: row.try_get("count")?,
                avg_salary_min: row.try_get("avg_salary_min")?,
                avg_salary_max: row.try_get("avg_salary_max")?,
            });
        }
        Ok(out)
    }

    /// Distinct-value counts used to populate the client's filter controls.
    pub async fn filter_options(&self) -> Result<FilterOptions, StoreError> {
        let categories = self
            .facet_counts(
                r#"
                SELECT category AS value, COUNT(*) AS count
                  FROM job_listings
                 GROUP BY category
                 ORDER BY count DESC, value ASC
                "#,
            )
            .await?;
        let employment_types = self
            .facet_counts(
                r#"
                SELECT employment_type AS value, COUNT(*) AS count
                  FROM job_listings
                 WHERE employment_type IS NOT NULL
                 GROUP BY employment_type
                 ORDER BY count DESC, value ASC
                "#,
            )
            .await?;
        let locations = self
            .facet_counts(
                r#"
                SELECT location AS value, COUNT(*) AS count
                  FROM job_listings
                 GROUP BY location
                 ORDER BY count DESC, value ASC
                 LIMIT 50
                "#,
            )
            .await?;
        Ok(FilterOptions {
            categories,
            employment_types,
            locations,
        })
    }

    async fn facet_counts(&self, sql: &str) -> Result<Vec<FacetCount>, StoreError> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(FacetCount {
                value: row.try_get("value")?,
                count: row.try_get("count")?,
            });
        }
        Ok(out)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn push_filter_predicates(qb: &mut QueryBuilder<'_, Sqlite>, filters: &JobFilters) {
    if let Some(category) = non_empty(&filters.category) {
        qb.push(" AND category = ").push_bind(category.to_string());
    }
    // remote postings surface for any location filter
    if let Some(location) = non_empty(&filters.location) {
        qb.push(" AND (location LIKE ")
            .push_bind(format!("%{location}%"))
            .push(" OR location LIKE ")
            .push_bind("%Remote%".to_string())
            .push(")");
    }
    if let Some(employment_type) = non_empty(&filters.employment_type) {
        qb.push(" AND employment_type = ")
            .push_bind(employment_type.to_string());
    }
    if filters.remote_only {
        qb.push(" AND remote_allowed = 1");
    }
    if let Some(search) = non_empty(&filters.search) {
        let term = format!("%{search}%");
        qb.push(" AND (title LIKE ")
            .push_bind(term.clone())
            .push(" OR company LIKE ")
            .push_bind(term.clone())
            .push(" OR description LIKE ")
            .push_bind(term)
            .push(")");
    }
    if let Some(floor) = filters.salary_min.filter(|f| *f > 0) {
        qb.push(" AND (salary_min >= ")
            .push_bind(floor)
            .push(" OR salary_max >= ")
            .push_bind(floor)
            .push(")");
    }
}

fn posting_from_row(row: &SqliteRow) -> Result<JobPosting, sqlx::Error> {
    let text = |name: &str| -> Result<String, sqlx::Error> {
        Ok(row.try_get::<Option<String>, _>(name)?.unwrap_or_default())
    };
    Ok(JobPosting {
        id: Some(row.try_get("id")?),
        job_id: row.try_get("job_id")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        location: row.try_get("location")?,
        description: text("description")?,
        requirements: text("requirements")?,
        employment_type: text("employment_type")?,
        remote_allowed: row.try_get::<Option<bool>, _>("remote_allowed")?.unwrap_or(false),
        salary_min: row.try_get("salary_min")?,
        salary_max: row.try_get("salary_max")?,
        currency: row
            .try_get::<Option<String>, _>("currency")?
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        category: row.try_get("category")?,
        job_url: row.try_get("job_url")?,
        company_url: row.try_get("company_url")?,
        posted_date: row.try_get("posted_date")?,
        application_deadline: row.try_get("application_deadline")?,
        experience_level: text("experience_level")?,
        education_level: text("education_level")?,
        skills: text("skills")?,
        benefits: text("benefits")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Thin JSON-over-HTTP client for provider calls. A failed call is reported
/// once; the next scheduled run is the only retry.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        query: &[(&str, &str)],
        headers: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        async move {
            let mut request = self
                .client
                .get(url)
                .query(query)
                .header(ACCEPT, "application/json");
            for (name, value) in headers {
                request = request.header(*name, *value);
            }

            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?;
            debug!(bytes = body.len(), "provider response received");
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestBudgetConfig {
    pub max_per_hour: u32,
    pub per_run_ceiling: u32,
    pub min_interval: Duration,
    pub window: Duration,
}

impl Default for RequestBudgetConfig {
    fn default() -> Self {
        Self {
            max_per_hour: 1000,
            per_run_ceiling: 24,
            min_interval: Duration::from_millis(4000),
            window: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    Granted,
    HourlyBudgetExhausted,
    RunCeilingReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetSnapshot {
    pub requests_in_window: u32,
    pub window_started: Instant,
    pub last_request: Option<Instant>,
}

/// Rolling hourly request counter plus a minimum spacing between requests.
#[derive(Debug)]
pub struct RequestBudget {
    config: RequestBudgetConfig,
    state: Mutex<BudgetSnapshot>,
}

impl RequestBudget {
    pub fn new(config: RequestBudgetConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BudgetSnapshot {
                requests_in_window: 0,
                window_started: Instant::now(),
                last_request: None,
            }),
        }
    }

    pub fn config(&self) -> RequestBudgetConfig {
        self.config
    }

    /// Ask for one provider request. On `Granted` the caller may send
    /// immediately: the wait for `min_interval` has already happened.
    pub async fn acquire(&self, issued_this_run: u32) -> BudgetDecision {
        loop {
            let mut state = self.state.lock().await;
            if state.window_started.elapsed() > self.config.window {
                state.requests_in_window = 0;
                state.window_started = Instant::now();
            }

            if state.requests_in_window >= self.config.max_per_hour {
                return BudgetDecision::HourlyBudgetExhausted;
            }
            if issued_this_run >= self.config.per_run_ceiling {
                return BudgetDecision::RunCeilingReached;
            }

            // wait without the lock held, then re-check against fresh state
            if let Some(last) = state.last_request {
                let ready_at = last + self.config.min_interval;
                if Instant::now() < ready_at {
                    drop(state);
                    tokio::time::sleep_until(ready_at).await;
                    continue;
                }
            }

            state.requests_in_window += 1;
            state.last_request = Some(Instant::now());
            return BudgetDecision::Granted;
        }
    }

    pub async fn snapshot(&self) -> BudgetSnapshot {
        *self.state.lock().await
    }

    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        *state = BudgetSnapshot {
            requests_in_window: 0,
            window_started: Instant::now(),
            last_request: None,
        };
    }
}
