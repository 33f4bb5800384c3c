use async_trait::async_trait;
use labjobs_core::{normalize_text, JobRecord, Platform};
use labjobs_storage::{FetchRequest, HttpFetcher};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::{
    base_record, board_token, html_to_text, json_array, json_id, json_str, name_or_text,
    parse_date, parse_error, parse_json, CompanyIdent, ParsedPage, PlatformScraper,
    ScrapeContext, ScrapeError,
};

const API_BASE: &str = "https://api.ashbyhq.com/posting-api/job-board";

pub struct AshbyScraper {
    company: CompanyIdent,
    org: String,
}

impl AshbyScraper {
    pub fn new(company: CompanyIdent, board: &str) -> Result<Self, ScrapeError> {
        let org = board_token(
            Platform::Ashby,
            board,
            &["ashbyhq.com"],
            &["posting-api", "job-board"],
        )?;
        Ok(Self { company, org })
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn listing_url(&self) -> String {
        format!("{API_BASE}/{}", self.org)
    }
}

#[async_trait]
impl PlatformScraper for AshbyScraper {
    fn company(&self) -> &CompanyIdent {
        &self.company
    }

    fn platform(&self) -> Platform {
        Platform::Ashby
    }

    async fn scrape_jobs(
        &self,
        http: &HttpFetcher,
        ctx: &ScrapeContext,
    ) -> Result<Vec<JobRecord>, ScrapeError> {
        let request =
            FetchRequest::get(self.listing_url()).with_bearer(self.company.bearer_token.clone());
        let response = http.fetch(&self.company.slug, &request).await?;
        let page = parse_ashby_board(&self.company, &self.org, &response.text(), ctx)?;
        info!(company = %self.company.slug, jobs = page.records.len(), "scraped ashby board");
        Ok(page.records)
    }
}

/// Parse a job-board response; accepts `jobs` at the top level or under `jobBoard`.
pub fn parse_ashby_board(
    company: &CompanyIdent,
    org: &str,
    payload: &str,
    ctx: &ScrapeContext,
) -> Result<ParsedPage, ScrapeError> {
    let root = parse_json(company, Platform::Ashby, payload)?;
    let jobs = json_array(&root, &["jobs"])
        .or_else(|| json_array(&root, &["jobBoard", "jobs"]))
        .ok_or_else(|| parse_error(company, Platform::Ashby, "missing `jobs` array", payload))?;

    let mut records = Vec::with_capacity(jobs.len());
    for job in jobs {
        if job.get("isListed").and_then(JsonValue::as_bool) == Some(false) {
            continue;
        }
        let Some(native_id) = json_id(job, "id").or_else(|| json_id(job, "slug")) else {
            debug!(company = %company.slug, "skipping ashby job without id");
            continue;
        };
        let url = json_str(job, &["jobUrl"])
            .and_then(|u| normalize_text(Some(u)))
            .unwrap_or_else(|| format!("https://jobs.ashbyhq.com/{org}/{native_id}"));
        let Some(mut record) = base_record(
            company,
            Platform::Ashby,
            &native_id,
            json_str(job, &["title"]),
            &url,
            ctx,
        ) else {
            continue;
        };

        record.location = job
            .get("location")
            .and_then(name_or_text)
            .or_else(|| first_named(job, "locations"));
        record.department = job
            .get("department")
            .and_then(name_or_text)
            .or_else(|| job.get("team").and_then(name_or_text))
            .or_else(|| first_named(job, "departments"));
        record.description = normalize_text(json_str(job, &["descriptionPlain"]))
            .or_else(|| json_str(job, &["descriptionHtml"]).and_then(html_to_text));
        record.posted_at = json_str(job, &["publishedAt"])
            .or_else(|| json_str(job, &["publishedDate"]))
            .and_then(parse_date);
        records.push(record);
    }

    Ok(ParsedPage {
        records,
        raw_count: jobs.len(),
        total: None,
    })
}

fn first_named(job: &JsonValue, key: &str) -> Option<String> {
    json_array(job, &[key])?.first().and_then(name_or_text)
}
