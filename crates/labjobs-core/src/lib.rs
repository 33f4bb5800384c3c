//! Core domain model for the lab jobs tracker: job records, change events,
//! the open-jobs registry and per-date snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "labjobs-core";

/// Upstream job-board platform a company publishes its postings on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Greenhouse,
    Lever,
    Workday,
    Ashby,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Greenhouse,
        Platform::Lever,
        Platform::Workday,
        Platform::Ashby,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Greenhouse => "greenhouse",
            Platform::Lever => "lever",
            Platform::Workday => "workday",
            Platform::Ashby => "ashby",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown platform {0:?} (expected one of greenhouse, lever, workday, ashby)")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == wanted)
            .ok_or_else(|| UnknownPlatform(s.to_string()))
    }
}

/// Derived lifecycle state. Platforms never report closure; absence does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Open,
    Closed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Open => "open",
            JobStatus::Closed => "closed",
        }
    }
}

/// Collapse whitespace runs to a single space and trim; blank text becomes `None`.
pub fn normalize_text(value: Option<&str>) -> Option<String> {
    let joined = value?.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

/// One posting as observed on one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub company: String,
    pub company_name: String,
    pub platform: Platform,
    pub native_id: String,
    pub title: String,
    pub department: Option<String>,
    pub location: Option<String>,
    pub url: String,
    pub description: Option<String>,
    pub posted_at: Option<NaiveDate>,
    #[serde(default)]
    pub status: JobStatus,
    pub first_seen_at: NaiveDate,
    pub last_seen_at: NaiveDate,
}

impl JobRecord {
    /// Identity key shared by every snapshot: `{company_slug}:{platform_native_id}`.
    pub fn job_id(company_slug: &str, native_id: &str) -> String {
        format!("{company_slug}:{native_id}")
    }

    /// Open record first seen on `seen_on`. Optional fields start empty.
    pub fn new(
        company: &str,
        company_name: &str,
        platform: Platform,
        native_id: &str,
        title: &str,
        url: &str,
        seen_on: NaiveDate,
    ) -> Self {
        Self {
            id: Self::job_id(company, native_id),
            company: company.to_string(),
            company_name: company_name.to_string(),
            platform,
            native_id: native_id.to_string(),
            title: title.to_string(),
            department: None,
            location: None,
            url: url.to_string(),
            description: None,
            posted_at: None,
            status: JobStatus::Open,
            first_seen_at: seen_on,
            last_seen_at: seen_on,
        }
    }

    pub fn fields(&self) -> JobFields {
        JobFields {
            title: self.title.clone(),
            department: self.department.clone(),
            location: self.location.clone(),
            url: self.url.clone(),
            description: self.description.clone(),
        }
    }
}

/// The mutable fields compared across snapshots; also the before/after blob of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFields {
    pub title: String,
    pub department: Option<String>,
    pub location: Option<String>,
    pub url: String,
    pub description: Option<String>,
}

impl JobFields {
    /// Names of the fields whose whitespace-normalized values differ. Case-sensitive.
    pub fn changed_fields(&self, other: &JobFields) -> Vec<&'static str> {
        let pairs: [(&'static str, Option<&str>, Option<&str>); 5] = [
            ("title", Some(self.title.as_str()), Some(other.title.as_str())),
            ("department", self.department.as_deref(), other.department.as_deref()),
            ("location", self.location.as_deref(), other.location.as_deref()),
            ("url", Some(self.url.as_str()), Some(other.url.as_str())),
            ("description", self.description.as_deref(), other.description.as_deref()),
        ];
        pairs
            .into_iter()
            .filter(|(_, a, b)| normalize_text(*a) != normalize_text(*b))
            .map(|(name, _, _)| name)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Updated,
    Closed,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::New => "new",
            ChangeKind::Updated => "updated",
            ChangeKind::Closed => "closed",
        }
    }
}

/// One diff outcome for one job id on one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub date: NaiveDate,
    pub id: String,
    pub company: String,
    pub kind: ChangeKind,
    pub before: Option<JobFields>,
    pub after: Option<JobFields>,
}

/// Why a company contributed nothing to a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Fetch,
    Parse,
    Timeout,
    EmptyResult,
    Panic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyFailure {
    pub company: String,
    pub platform: Platform,
    pub kind: FailureKind,
    pub message: String,
}

/// Every record scraped on one date plus the companies that failed that day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub date: NaiveDate,
    pub records: Vec<JobRecord>,
    pub failures: Vec<CompanyFailure>,
    /// Companies disabled in the company table and therefore not scraped.
    #[serde(default)]
    pub paused: Vec<String>,
}

impl Snapshot {
    pub fn failed_companies(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|f| f.company.as_str())
    }

    /// Companies whose registry entries must survive this snapshot untouched.
    pub fn held_companies(&self) -> impl Iterator<Item = &str> {
        self.failed_companies().chain(self.paused.iter().map(String::as_str))
    }
}

/// Latest known open record per job id, carried from run to run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    /// Date of the run that produced this state; `None` before the first run.
    pub as_of: Option<NaiveDate>,
    jobs: BTreeMap<String, JobRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = JobRecord>) -> Self {
        let mut registry = Self::new();
        for record in records {
            registry.insert(record);
        }
        registry
    }

    /// Insert keyed by `record.id`, returning the record it replaced.
    pub fn insert(&mut self, record: JobRecord) -> Option<JobRecord> {
        self.jobs.insert(record.id.clone(), record)
    }

    pub fn remove(&mut self, id: &str) -> Option<JobRecord> {
        self.jobs.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&JobRecord> {
        self.jobs.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }

    /// Records in id order.
    pub fn records(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values()
    }

    /// First entry whose key disagrees with its record id.
    pub fn misfiled_entry(&self) -> Option<(&str, &JobRecord)> {
        self.jobs
            .iter()
            .find(|(key, record)| **key != record.id)
            .map(|(key, record)| (key.as_str(), record))
    }

    pub fn count_for_company(&self, company: &str) -> usize {
        self.jobs.values().filter(|r| r.company == company).count()
    }
}

/// One row of the company table: which platform a company uses and where its board lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyConfig {
    pub slug: String,
    pub display_name: String,
    pub platform: Platform,
    /// Board slug or board URL, interpreted per platform.
    pub board: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Workday tenant when it differs from the first label of the board host.
    #[serde(default)]
    pub tenant: Option<String>,
    /// Environment variable holding an optional bearer token for the board API.
    #[serde(default)]
    pub credentials_env: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    fn record(native_id: &str, title: &str) -> JobRecord {
        JobRecord::new(
            "anthropic",
            "Anthropic",
            Platform::Lever,
            native_id,
            title,
            "https://jobs.lever.co/anthropic/x",
            day(1),
        )
    }

    #[test]
    fn job_id_combines_company_slug_and_native_id() {
        assert_eq!(JobRecord::job_id("openai", "abc-123"), "openai:abc-123");
        assert_eq!(record("42", "Engineer").id, "anthropic:42");
    }

    #[test]
    fn normalize_text_collapses_whitespace_and_drops_blank() {
        assert_eq!(
            normalize_text(Some("  Research \n\t Engineer ")),
            Some("Research Engineer".to_string())
        );
        assert_eq!(normalize_text(Some("   ")), None);
        assert_eq!(normalize_text(None), None);
    }

    #[test]
    fn changed_fields_ignores_whitespace_but_not_case() {
        let a = record("1", "Research Engineer").fields();
        let mut b = a.clone();
        b.title = "Research   Engineer ".to_string();
        assert!(a.changed_fields(&b).is_empty());

        b.title = "research engineer".to_string();
        b.location = Some("London".to_string());
        assert_eq!(a.changed_fields(&b), vec!["title", "location"]);
    }

    #[test]
    fn registry_is_keyed_by_record_id_in_sorted_order() {
        let registry = Registry::from_records([record("b", "B"), record("a", "A")]);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("anthropic:a"));
        let ids: Vec<_> = registry.ids().collect();
        assert_eq!(ids, vec!["anthropic:a", "anthropic:b"]);
        assert_eq!(registry.count_for_company("anthropic"), 2);
    }

    #[test]
    fn platform_parses_case_insensitively_and_rejects_unknown() {
        assert_eq!("Workday".parse::<Platform>().unwrap(), Platform::Workday);
        assert!("smartrecruiters".parse::<Platform>().is_err());
    }

    #[test]
    fn enums_serialize_lowercase() {
        let json =
            serde_json::to_string(&(Platform::Ashby, JobStatus::Open, ChangeKind::Updated))
                .unwrap();
        assert_eq!(json, r#"["ashby","open","updated"]"#);
    }

    #[test]
    fn held_companies_cover_failed_and_paused() {
        let snapshot = Snapshot {
            date: day(2),
            records: Vec::new(),
            failures: vec![CompanyFailure {
                company: "openai".to_string(),
                platform: Platform::Ashby,
                kind: FailureKind::Timeout,
                message: "no result".to_string(),
            }],
            paused: vec!["cohere".to_string()],
        };
        let held: Vec<_> = snapshot.held_companies().collect();
        assert_eq!(held, vec!["openai", "cohere"]);
    }

    #[test]
    fn snapshot_without_paused_field_deserializes() {
        let snapshot: Snapshot =
            serde_json::from_str(r#"{"date":"2025-03-02","records":[],"failures":[]}"#).unwrap();
        assert!(snapshot.paused.is_empty());
    }

    #[test]
    fn company_config_defaults_to_enabled() {
        let cfg: CompanyConfig = serde_json::from_str(
            r#"{"slug":"openai","display_name":"OpenAI","platform":"ashby","board":"openai"}"#,
        )
        .unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.tenant, None);
    }
}
