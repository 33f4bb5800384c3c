use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};
use labjobs_core::{normalize_text, JobRecord, Platform};
use labjobs_storage::{FetchRequest, HttpFetcher};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};
use url::Url;

use crate::{
    base_record, json_array, json_at, json_str, parse_error, parse_json, CompanyIdent,
    ParsedPage, PlatformScraper, ScrapeContext, ScrapeError, MAX_PAGES,
};

pub const PAGE_SIZE: usize = 20;

pub struct WorkdayScraper {
    company: CompanyIdent,
    board_url: String,
    api_url: String,
}

impl WorkdayScraper {
    /// `board` is the public career-site URL, e.g.
    /// `https://huggingface.wd1.myworkdayjobs.com/huggingface`.
    pub fn new(
        company: CompanyIdent,
        board: &str,
        tenant: Option<&str>,
    ) -> Result<Self, ScrapeError> {
        let invalid = |reason: String| ScrapeError::BoardReference {
            platform: Platform::Workday,
            reference: board.to_string(),
            reason,
        };
        let url = Url::parse(board.trim())
            .map_err(|e| invalid(format!("expected a board URL: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| invalid("board URL has no host".to_string()))?;
        let tenant = match tenant.and_then(|t| normalize_text(Some(t))) {
            Some(tenant) => tenant,
            None => host
                .split('.')
                .next()
                .filter(|label| !label.is_empty())
                .map(str::to_string)
                .ok_or_else(|| invalid("cannot derive tenant from host".to_string()))?,
        };
        let site = url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string)
            .ok_or_else(|| invalid("board URL has no career-site segment".to_string()))?;

        let origin = url.origin().ascii_serialization();
        let board_url = board.trim().trim_end_matches('/').to_string();
        let api_url = format!("{origin}/wday/cxs/{tenant}/{site}/jobs");
        Ok(Self {
            company,
            board_url,
            api_url,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn board_url(&self) -> &str {
        &self.board_url
    }

    pub fn page_body(offset: usize) -> JsonValue {
        json!({
            "appliedFacets": {},
            "limit": PAGE_SIZE,
            "offset": offset,
            "searchText": "",
        })
    }
}

#[async_trait]
impl PlatformScraper for WorkdayScraper {
    fn company(&self) -> &CompanyIdent {
        &self.company
    }

    fn platform(&self) -> Platform {
        Platform::Workday
    }

    async fn scrape_jobs(
        &self,
        http: &HttpFetcher,
        ctx: &ScrapeContext,
    ) -> Result<Vec<JobRecord>, ScrapeError> {
        let mut records = Vec::new();
        let mut seen = HashSet::new();
        let mut total = None;
        let mut offset = 0;

        for _ in 0..MAX_PAGES {
            let request = FetchRequest::post_json(self.api_url.clone(), Self::page_body(offset))
                .with_bearer(self.company.bearer_token.clone());
            let response = http.fetch(&self.company.slug, &request).await?;
            let page = parse_workday_page(&self.company, &self.board_url, &response.text(), ctx)?;

            // Later pages report total = 0; only the first count is trusted.
            if total.is_none() {
                total = page.total;
            }
            for record in page.records {
                if seen.insert(record.id.clone()) {
                    records.push(record);
                }
            }
            debug!(
                company = %self.company.slug,
                offset,
                listed = page.raw_count,
                ?total,
                "workday page"
            );

            offset += page.raw_count;
            if page.raw_count == 0 || total.is_some_and(|t| offset >= t) {
                break;
            }
        }

        info!(company = %self.company.slug, jobs = records.len(), "scraped workday board");
        Ok(records)
    }
}

/// Parse one `POST .../jobs` response (`{"total": n, "jobPostings": [...]}`).
pub fn parse_workday_page(
    company: &CompanyIdent,
    board_url: &str,
    payload: &str,
    ctx: &ScrapeContext,
) -> Result<ParsedPage, ScrapeError> {
    let root = parse_json(company, Platform::Workday, payload)?;
    let postings = json_array(&root, &["jobPostings"]).ok_or_else(|| {
        parse_error(company, Platform::Workday, "missing `jobPostings` array", payload)
    })?;

    let mut records = Vec::with_capacity(postings.len());
    for posting in postings {
        let external_path = json_str(posting, &["externalPath"]).unwrap_or_default();
        let native_id = json_at(posting, &["bulletFields"])
            .and_then(|f| f.get(0))
            .and_then(|f| normalize_text(f.as_str()))
            .or_else(|| {
                external_path
                    .rsplit('/')
                    .find(|s| !s.is_empty())
                    .and_then(|s| normalize_text(Some(s)))
            });
        let Some(native_id) = native_id else {
            debug!(company = %company.slug, "skipping workday posting without id");
            continue;
        };
        let url = if external_path.is_empty() {
            format!("{board_url}/job/{native_id}")
        } else {
            format!("{board_url}{external_path}")
        };
        let Some(mut record) = base_record(
            company,
            Platform::Workday,
            &native_id,
            json_str(posting, &["title"]),
            &url,
            ctx,
        ) else {
            continue;
        };
        record.location = normalize_text(json_str(posting, &["locationsText"]));
        record.posted_at = json_str(posting, &["postedOn"])
            .and_then(|raw| posted_on_date(raw, ctx.date));
        records.push(record);
    }

    let total = root
        .get("total")
        .and_then(JsonValue::as_u64)
        .map(|t| t as usize)
        .filter(|t| *t > 0);

    Ok(ParsedPage {
        records,
        raw_count: postings.len(),
        total,
    })
}

/// Resolve "Posted Today" / "Posted Yesterday" / "Posted N Days Ago" against
/// the run date. "Posted 30+ Days Ago" is too coarse to keep.
pub fn posted_on_date(raw: &str, today: NaiveDate) -> Option<NaiveDate> {
    let text = raw.trim().to_ascii_lowercase();
    let text = text.strip_prefix("posted").unwrap_or(&text).trim();
    match text {
        "today" => Some(today),
        "yesterday" => today.checked_sub_days(Days::new(1)),
        _ => {
            let count = text.strip_suffix("days ago")?.trim();
            if count.ends_with('+') {
                return None;
            }
            let days: u64 = count.parse().ok()?;
            today.checked_sub_days(Days::new(days))
        }
    }
}
