//! Platform scraper contract plus one adapter per upstream job board.
//!
//! Each adapter fetches a company's public listing endpoint and translates the
//! platform's payload into [`JobRecord`]s. Fetching and parsing are kept apart:
//! the `parse_*` functions are pure so they can be exercised on fixture payloads.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use labjobs_core::{normalize_text, CompanyConfig, FailureKind, JobRecord, Platform};
use labjobs_storage::{FetchError, HttpFetcher};
use scraper::Html;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

mod ashby;
mod greenhouse;
mod lever;
mod workday;

pub use ashby::AshbyScraper;
pub use greenhouse::GreenhouseScraper;
pub use lever::LeverScraper;
pub use workday::WorkdayScraper;

pub const CRATE_NAME: &str = "labjobs-adapters";

/// Upper bound on pages requested from a paginated board in one scrape.
pub const MAX_PAGES: usize = 200;

const EXCERPT_CHARS: usize = 240;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected {platform} payload for {company}: {message} (payload starts {excerpt:?})")]
    Parse {
        company: String,
        platform: Platform,
        message: String,
        excerpt: String,
    },
    #[error("invalid {platform} board reference {reference:?}: {reason}")]
    BoardReference {
        platform: Platform,
        reference: String,
        reason: String,
    },
}

impl ScrapeError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ScrapeError::Fetch(_) => FailureKind::Fetch,
            ScrapeError::Parse { .. } | ScrapeError::BoardReference { .. } => FailureKind::Parse,
        }
    }
}

/// Company identity handed to an adapter at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanyIdent {
    pub slug: String,
    pub display_name: String,
    pub bearer_token: Option<String>,
}

impl CompanyIdent {
    pub fn new(slug: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            display_name: display_name.into(),
            bearer_token: None,
        }
    }

    /// Reads the optional token named by `credentials_env`; a missing variable
    /// means public-endpoint access.
    pub fn from_config(config: &CompanyConfig) -> Self {
        let bearer_token = config.credentials_env.as_deref().and_then(|var| {
            match std::env::var(var) {
                Ok(token) if !token.trim().is_empty() => Some(token),
                _ => {
                    debug!(
                        company = %config.slug,
                        var,
                        "no credentials set; using public endpoint"
                    );
                    None
                }
            }
        });
        Self {
            slug: config.slug.clone(),
            display_name: config.display_name.clone(),
            bearer_token,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeContext {
    /// Snapshot date stamped into `first_seen_at` / `last_seen_at`.
    pub date: NaiveDate,
}

/// One page of a listing payload. `raw_count` counts upstream entries before
/// any were skipped, which is what pagination decisions need.
#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    pub records: Vec<JobRecord>,
    pub raw_count: usize,
    pub total: Option<usize>,
}

#[async_trait]
pub trait PlatformScraper: Send + Sync {
    fn company(&self) -> &CompanyIdent;
    fn platform(&self) -> Platform;

    async fn scrape_jobs(
        &self,
        http: &HttpFetcher,
        ctx: &ScrapeContext,
    ) -> Result<Vec<JobRecord>, ScrapeError>;
}

/// Build the adapter for one row of the company table.
pub fn scraper_for(config: &CompanyConfig) -> Result<Arc<dyn PlatformScraper>, ScrapeError> {
    let company = CompanyIdent::from_config(config);
    Ok(match config.platform {
        Platform::Greenhouse => Arc::new(GreenhouseScraper::new(company, &config.board)?),
        Platform::Lever => Arc::new(LeverScraper::new(company, &config.board)?),
        Platform::Workday => Arc::new(WorkdayScraper::new(
            company,
            &config.board,
            config.tenant.as_deref(),
        )?),
        Platform::Ashby => Arc::new(AshbyScraper::new(company, &config.board)?),
    })
}

pub(crate) fn excerpt(payload: &str) -> String {
    payload.trim_start().chars().take(EXCERPT_CHARS).collect()
}

pub(crate) fn parse_error(
    company: &CompanyIdent,
    platform: Platform,
    message: impl Into<String>,
    payload: &str,
) -> ScrapeError {
    ScrapeError::Parse {
        company: company.slug.clone(),
        platform,
        message: message.into(),
        excerpt: excerpt(payload),
    }
}

pub(crate) fn parse_json(
    company: &CompanyIdent,
    platform: Platform,
    payload: &str,
) -> Result<JsonValue, ScrapeError> {
    serde_json::from_str(payload)
        .map_err(|e| parse_error(company, platform, format!("invalid JSON: {e}"), payload))
}

pub(crate) fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

pub(crate) fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a Vec<JsonValue>> {
    json_at(value, path)?.as_array()
}

/// Platform ids arrive as strings on some boards and integers on others.
pub(crate) fn json_id(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::String(s) => normalize_text(Some(s)),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Text of either a plain string or an object's `name`, as used for the
/// first element of location / department lists.
pub(crate) fn name_or_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => normalize_text(Some(s)),
        JsonValue::Object(_) => normalize_text(json_str(value, &["name"])),
        _ => None,
    }
}

/// Date portion of an RFC 3339 timestamp or a bare `YYYY-MM-DD`.
pub(crate) fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    raw.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

pub(crate) fn date_from_epoch_millis(millis: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(millis).map(|ts| ts.date_naive())
}

fn fragment_text(html: &str) -> String {
    Html::parse_fragment(html)
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Plain text from an HTML body. Handles bodies whose markup is itself
/// entity-escaped (`&lt;p&gt;`), as Greenhouse returns them.
pub fn html_to_text(html: &str) -> Option<String> {
    let mut text = fragment_text(html);
    if text.contains('<') && text.contains('>') {
        text = fragment_text(&text);
    }
    normalize_text(Some(&text))
}

/// Open record for a listing entry, or `None` when the entry has no usable
/// title. Optional fields are filled in by the caller.
pub(crate) fn base_record(
    company: &CompanyIdent,
    platform: Platform,
    native_id: &str,
    title: Option<&str>,
    url: &str,
    ctx: &ScrapeContext,
) -> Option<JobRecord> {
    let Some(title) = normalize_text(title) else {
        warn!(company = %company.slug, %platform, native_id, "skipping posting without a title");
        return None;
    };
    Some(JobRecord::new(
        &company.slug,
        &company.display_name,
        platform,
        native_id,
        &title,
        url.trim(),
        ctx.date,
    ))
}

/// Board token from either a bare slug or a URL on one of `hosts`.
/// `skip_prefix` drops leading API path segments such as `v1/boards`.
pub(crate) fn board_token(
    platform: Platform,
    reference: &str,
    hosts: &[&str],
    skip_prefix: &[&str],
) -> Result<String, ScrapeError> {
    let invalid = |reason: &str| ScrapeError::BoardReference {
        platform,
        reference: reference.to_string(),
        reason: reason.to_string(),
    };
    let reference_trimmed = reference.trim();
    if reference_trimmed.is_empty() {
        return Err(invalid("empty board reference"));
    }
    if !reference_trimmed.contains("://") {
        if reference_trimmed.contains(['/', '?', '#'])
            || reference_trimmed.contains(char::is_whitespace)
        {
            return Err(invalid("expected a board slug or an absolute URL"));
        }
        return Ok(reference_trimmed.to_string());
    }

    let url = Url::parse(reference_trimmed).map_err(|e| invalid(&e.to_string()))?;
    let host = url.host_str().unwrap_or_default();
    if !hosts.iter().any(|h| host == *h || host.ends_with(&format!(".{h}"))) {
        return Err(invalid(&format!("host {host:?} is not a {platform} board")));
    }
    let mut segments = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect::<Vec<_>>())
        .unwrap_or_default();
    if segments.len() > skip_prefix.len() && segments[..skip_prefix.len()] == *skip_prefix {
        segments.drain(..skip_prefix.len());
    }
    segments
        .first()
        .map(|s| s.to_string())
        .ok_or_else(|| invalid("URL has no board segment"))
}
