//! Core domain model for the job board.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobboard-core";

pub const DEFAULT_CURRENCY: &str = "USD";
pub const NOT_SPECIFIED: &str = "Not specified";
pub const LOCATION_NOT_SPECIFIED: &str = "Location not specified";

/// One persisted job/internship listing. Field names double as the
/// `job_listings` column names and the JSON contract served to the client.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobPosting {
    /// Storage-assigned surrogate key; `None` until the row has been read back.
    pub id: Option<i64>,
    pub job_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub requirements: String,
    pub employment_type: String,
    pub remote_allowed: bool,
    pub salary_min: Option<i64>,
    pub salary_max: Option<i64>,
    pub currency: String,
    pub category: String,
    pub job_url: Option<String>,
    pub company_url: Option<String>,
    pub posted_date: Option<String>,
    pub application_deadline: Option<String>,
    pub experience_level: String,
    pub education_level: String,
    pub skills: String,
    pub benefits: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmploymentType {
    FullTime,
    PartTime,
    Contract,
    Internship,
    Temporary,
}

impl EmploymentType {
    /// Maps a provider employment-type code. Unknown or missing codes fall back
    /// to `Internship` because the pipeline only searches internship postings.
    pub fn from_provider_code(code: Option<&str>) -> Self {
        match code.map(str::trim) {
            Some("FULLTIME") => Self::FullTime,
            Some("PARTTIME") => Self::PartTime,
            Some("CONTRACTOR") => Self::Contract,
            Some("INTERNSHIP") | Some("INTERN") => Self::Internship,
            Some("TEMPORARY") => Self::Temporary,
            _ => Self::Internship,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::FullTime => "Full-time",
            Self::PartTime => "Part-time",
            Self::Contract => "Contract",
            Self::Internship => "Internship",
            Self::Temporary => "Temporary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperienceLevel {
    Senior,
    MidLevel,
    EntryLevel,
    NotSpecified,
}

impl ExperienceLevel {
    pub fn label(self) -> &'static str {
        match self {
            Self::Senior => "Senior",
            Self::MidLevel => "Mid-level",
            Self::EntryLevel => "Entry-level",
            Self::NotSpecified => NOT_SPECIFIED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EducationLevel {
    Phd,
    Masters,
    Bachelors,
    HighSchool,
    NotSpecified,
}

impl EducationLevel {
    pub fn label(self) -> &'static str {
        match self {
            Self::Phd => "PhD",
            Self::Masters => "Master's",
            Self::Bachelors => "Bachelor's",
            Self::HighSchool => "High School",
            Self::NotSpecified => NOT_SPECIFIED,
        }
    }
}

/// Taxonomy entry: used both to target provider searches and to label postings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryDefinition {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub search_phrases: Vec<String>,
}

/// Result of one full fetch run, reported by the API trigger and the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FetchSummary {
    pub saved: usize,
    pub errors: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_codes_map_to_labels() {
        assert_eq!(EmploymentType::from_provider_code(Some("INTERN")).label(), "Internship");
        assert_eq!(EmploymentType::from_provider_code(Some("FULLTIME")).label(), "Full-time");
        assert_eq!(EmploymentType::from_provider_code(Some("CONTRACTOR")).label(), "Contract");
        assert_eq!(EmploymentType::from_provider_code(Some("SEASONAL")).label(), "Internship");
        assert_eq!(EmploymentType::from_provider_code(None).label(), "Internship");
    }

    #[test]
    fn posting_serializes_with_column_names() {
        let posting = JobPosting {
            job_id: "abc".into(),
            remote_allowed: true,
            salary_min: Some(50_000),
            ..Default::default()
        };
        let value = serde_json::to_value(&posting).unwrap();
        assert_eq!(value["job_id"], "abc");
        assert_eq!(value["remote_allowed"], true);
        assert_eq!(value["salary_min"], 50_000);
        assert!(value["salary_max"].is_null());
    }

    #[test]
    fn partial_seed_records_deserialize() {
        let posting: JobPosting = serde_json::from_str(
            r#"{"job_id":"real_1","title":"Officer","category":"Law"}"#,
        )
        .unwrap();
        assert_eq!(posting.title, "Officer");
        assert_eq!(posting.salary_min, None);
        assert!(!posting.remote_allowed);
    }
}
