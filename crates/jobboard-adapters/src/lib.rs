//! Job-search provider adapters + raw listing normalization.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use jobboard_core::{
    EducationLevel, EmploymentType, ExperienceLevel, JobPosting, DEFAULT_CURRENCY,
    LOCATION_NOT_SPECIFIED,
};
use jobboard_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobboard-adapters";

pub const JSEARCH_SOURCE_ID: &str = "jsearch";
pub const DEFAULT_JSEARCH_BASE_URL: &str = "https://api.openwebninja.com/jsearch";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub category: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A provider that answers free-text job searches with raw listings.
#[async_trait]
pub trait JobSearchSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn search(&self, ctx: &AdapterContext, query: &str) -> Result<Vec<RawJob>, AdapterError>;
}

/// Provider listing as returned by the search endpoint. Every field is optional
/// because the provider omits or nulls fields freely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawJob {
    pub job_id: Option<String>,
    pub employer_name: Option<String>,
    pub job_title: Option<String>,
    pub job_city: Option<String>,
    pub job_state: Option<String>,
    pub job_country: Option<String>,
    pub job_description: Option<String>,
    pub job_employment_type: Option<String>,
    pub job_salary: Option<JsonValue>,
    pub job_apply_link: Option<String>,
    pub job_url: Option<String>,
    pub job_posted_at_datetime_utc: Option<String>,
    pub job_highlights: Option<JobHighlights>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobHighlights {
    #[serde(rename = "Qualifications")]
    pub qualifications: Option<JsonValue>,
    #[serde(rename = "Benefits")]
    pub benefits: Option<JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Option<Vec<JsonValue>>,
}

#[derive(Debug, Clone)]
pub struct JSearchConfig {
    pub base_url: String,
    pub api_key: String,
    pub api_host: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for JSearchConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_JSEARCH_BASE_URL.to_string(),
            api_key: String::new(),
            api_host: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// JSearch client restricted to recent US internship postings in English.
#[derive(Debug, Clone)]
pub struct JSearchAdapter {
    http: HttpFetcher,
    search_url: String,
    api_key: String,
    api_host: Option<String>,
}

impl JSearchAdapter {
    pub fn new(config: JSearchConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.timeout,
            user_agent: config.user_agent.clone(),
        })?;
        Ok(Self {
            http,
            search_url: format!("{}/search", config.base_url.trim_end_matches('/')),
            api_key: config.api_key,
            api_host: config.api_host.filter(|h| !h.trim().is_empty()),
        })
    }
}

#[async_trait]
impl JobSearchSource for JSearchAdapter {
    fn source_id(&self) -> &'static str {
        JSEARCH_SOURCE_ID
    }

    async fn search(&self, ctx: &AdapterContext, query: &str) -> Result<Vec<RawJob>, AdapterError> {
        let params = [
            ("query", query),
            ("country", "us"),
            ("language", "en"),
            ("num_pages", "10"),
            ("date_posted", "month"),
            ("employment_types", "INTERN"),
        ];
        let mut headers = vec![("x-api-key", self.api_key.as_str())];
        if let Some(host) = &self.api_host {
            headers.push(("x-rapidapi-host", host.as_str()));
        }

        let response: SearchResponse = self
            .http
            .get_json(ctx.run_id, JSEARCH_SOURCE_ID, &self.search_url, &params, &headers)
            .await?;
        let jobs = decode_raw_jobs(response.data.unwrap_or_default());
        info!(
            run_id = %ctx.run_id,
            category = %ctx.category,
            query,
            found = jobs.len(),
            "provider search returned"
        );
        Ok(jobs)
    }
}

/// Decodes listings one by one so a single malformed entry only drops itself.
fn decode_raw_jobs(items: Vec<JsonValue>) -> Vec<RawJob> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<RawJob>(item) {
            Ok(job) => Some(job),
            Err(err) => {
                warn!(error = %err, "skipping undecodable provider listing");
                None
            }
        })
        .collect()
}

/// Ordered keyword rule: the first rule with any needle present in the text wins.
#[derive(Debug, Clone, Copy)]
pub struct KeywordRule<T: Copy> {
    pub needles: &'static [&'static str],
    pub outcome: T,
}

pub const EXPERIENCE_RULES: &[KeywordRule<ExperienceLevel>] = &[
    KeywordRule {
        needles: &["senior", "5+ years", "10+ years"],
        outcome: ExperienceLevel::Senior,
    },
    KeywordRule {
        needles: &["mid", "3-5 years", "2-5 years"],
        outcome: ExperienceLevel::MidLevel,
    },
    KeywordRule {
        needles: &["entry", "0-2 years", "junior"],
        outcome: ExperienceLevel::EntryLevel,
    },
];

pub const EDUCATION_RULES: &[KeywordRule<EducationLevel>] = &[
    KeywordRule {
        needles: &["phd", "doctorate"],
        outcome: EducationLevel::Phd,
    },
    KeywordRule {
        needles: &["master", "mba"],
        outcome: EducationLevel::Masters,
    },
    KeywordRule {
        needles: &["bachelor", "degree"],
        outcome: EducationLevel::Bachelors,
    },
    KeywordRule {
        needles: &["high school", "diploma"],
        outcome: EducationLevel::HighSchool,
    },
];

pub const SKILL_VOCABULARY: &[&str] = &[
    "research",
    "analysis",
    "communication",
    "writing",
    "presentation",
    "project management",
    "leadership",
    "teamwork",
    "problem solving",
    "data analysis",
    "policy development",
    "stakeholder engagement",
    "legal research",
    "compliance",
    "regulatory affairs",
    "international relations",
    "diplomacy",
    "foreign languages",
    "negotiation",
    "advocacy",
];

pub fn first_match<T: Copy>(rules: &[KeywordRule<T>], text: &str) -> Option<T> {
    rules
        .iter()
        .find(|rule| rule.needles.iter().any(|needle| text.contains(needle)))
        .map(|rule| rule.outcome)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SalaryBound {
    Min,
    Max,
}

/// Normalize one provider listing into the stored schema, labelled with the
/// category whose search produced it.
pub fn transform_job(raw: &RawJob, category: &str, now: DateTime<Utc>) -> JobPosting {
    let qualifications = raw
        .job_highlights
        .as_ref()
        .and_then(|h| h.qualifications.as_ref());
    let benefits = raw.job_highlights.as_ref().and_then(|h| h.benefits.as_ref());
    let qualifications_text = qualifications.and_then(keyword_text);
    let salary_text = raw.job_salary.as_ref().and_then(salary_text);
    let location = format_location(raw);

    let job_id = match non_blank(&raw.job_id) {
        Some(id) => id.to_string(),
        None => synthetic_job_id(
            non_blank(&raw.employer_name).unwrap_or_default(),
            non_blank(&raw.job_title).unwrap_or_default(),
            &location,
        ),
    };

    JobPosting {
        id: None,
        job_id,
        title: non_blank(&raw.job_title).unwrap_or("N/A").to_string(),
        company: non_blank(&raw.employer_name).unwrap_or("N/A").to_string(),
        location,
        description: raw.job_description.clone().unwrap_or_default(),
        requirements: qualifications.map(format_highlight).unwrap_or_default(),
        employment_type: EmploymentType::from_provider_code(raw.job_employment_type.as_deref())
            .label()
            .to_string(),
        remote_allowed: is_remote_job(raw),
        salary_min: salary_text
            .as_deref()
            .and_then(|s| extract_salary(s, SalaryBound::Min)),
        salary_max: salary_text
            .as_deref()
            .and_then(|s| extract_salary(s, SalaryBound::Max)),
        currency: extract_currency(salary_text.as_deref()).to_string(),
        category: category.to_string(),
        job_url: non_blank(&raw.job_apply_link)
            .or(non_blank(&raw.job_url))
            .map(ToString::to_string),
        company_url: None,
        posted_date: Some(
            non_blank(&raw.job_posted_at_datetime_utc)
                .map(ToString::to_string)
                .unwrap_or_else(|| now.to_rfc3339_opts(SecondsFormat::Millis, true)),
        ),
        application_deadline: None,
        experience_level: map_experience_level(qualifications_text.as_deref())
            .label()
            .to_string(),
        education_level: extract_education_level(qualifications_text.as_deref())
            .label()
            .to_string(),
        skills: extract_skills(qualifications_text.as_deref()),
        benefits: benefits.map(format_highlight).unwrap_or_default(),
        created_at: None,
        updated_at: None,
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// "City, State" when both are known, else the most specific of city, state
/// or country.
pub fn format_location(raw: &RawJob) -> String {
    let city = non_blank(&raw.job_city);
    let state = non_blank(&raw.job_state);
    match (city, state) {
        (Some(city), Some(state)) => format!("{city}, {state}"),
        _ => city
            .or(state)
            .or(non_blank(&raw.job_country))
            .unwrap_or(LOCATION_NOT_SPECIFIED)
            .to_string(),
    }
}

pub fn is_remote_job(raw: &RawJob) -> bool {
    let place = format!(
        "{} {}",
        raw.job_city.as_deref().unwrap_or_default(),
        raw.job_state.as_deref().unwrap_or_default()
    )
    .to_lowercase();
    let mentions_remote =
        |field: &Option<String>| field.as_deref().is_some_and(|v| v.to_lowercase().contains("remote"));

    place.contains("remote")
        || place.contains("work from home")
        || mentions_remote(&raw.job_title)
        || mentions_remote(&raw.job_description)
}

fn salary_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numbers found in free text. Digit groups separated by commas form one
/// number ("50,000" is 50000) and a single decimal point is kept.
pub fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        let next_is_digit = chars.peek().is_some_and(|c| c.is_ascii_digit());
        if ch == ',' && !seen_dot && !current.is_empty() && next_is_digit {
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() && next_is_digit {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<f64>() {
            out.push(v);
        }
    }
    out
}

pub fn extract_salary(text: &str, bound: SalaryBound) -> Option<i64> {
    let nums = extract_numbers(text);
    let picked = match bound {
        SalaryBound::Min => nums.iter().copied().reduce(f64::min),
        SalaryBound::Max => nums.iter().copied().reduce(f64::max),
    }?;
    Some(picked.trunc() as i64)
}

pub fn extract_currency(text: Option<&str>) -> &'static str {
    let Some(text) = text else {
        return DEFAULT_CURRENCY;
    };
    if text.contains('€') || text.contains("EUR") {
        "EUR"
    } else if text.contains('£') || text.contains("GBP") {
        "GBP"
    } else {
        DEFAULT_CURRENCY
    }
}

/// Lowercased text used for keyword matching: arrays are space-joined.
fn keyword_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::Null => return None,
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(items) => items.iter().map(plain_text).collect::<Vec<_>>().join(" "),
        other => other.to_string(),
    };
    Some(text.to_lowercase())
}

fn plain_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Highlight sections as stored text: arrays one item per line, objects as JSON.
pub fn format_highlight(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(items) => items.iter().map(plain_text).collect::<Vec<_>>().join("\n"),
        other => other.to_string(),
    }
}

pub fn map_experience_level(qualifications: Option<&str>) -> ExperienceLevel {
    qualifications
        .and_then(|text| first_match(EXPERIENCE_RULES, text))
        .unwrap_or(ExperienceLevel::NotSpecified)
}

pub fn extract_education_level(qualifications: Option<&str>) -> EducationLevel {
    qualifications
        .and_then(|text| first_match(EDUCATION_RULES, text))
        .unwrap_or(EducationLevel::NotSpecified)
}

pub fn extract_skills(qualifications: Option<&str>) -> String {
    let Some(text) = qualifications else {
        return String::new();
    };
    SKILL_VOCABULARY
        .iter()
        .filter(|skill| text.contains(*skill))
        .copied()
        .collect::<Vec<_>>()
        .join(", ")
}

/// Stable id for listings the provider sent without one, so re-fetching the
/// same listing updates its row instead of adding another.
pub fn synthetic_job_id(employer: &str, title: &str, location: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(employer.trim().to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(title.trim().to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(location.trim().to_lowercase().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("gen_{}", &digest[..16])
}
