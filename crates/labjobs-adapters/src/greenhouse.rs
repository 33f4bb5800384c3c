use async_trait::async_trait;
use labjobs_core::{normalize_text, JobRecord, Platform};
use labjobs_storage::{FetchRequest, HttpFetcher};
use tracing::{debug, info, warn};

use crate::{
    base_record, board_token, html_to_text, json_array, json_id, json_str, parse_date,
    parse_error, parse_json, CompanyIdent, ParsedPage, PlatformScraper, ScrapeContext,
    ScrapeError,
};

const API_BASE: &str = "https://boards-api.greenhouse.io/v1/boards";

pub struct GreenhouseScraper {
    company: CompanyIdent,
    token: String,
}

impl GreenhouseScraper {
    pub fn new(company: CompanyIdent, board: &str) -> Result<Self, ScrapeError> {
        let token =
            board_token(Platform::Greenhouse, board, &["greenhouse.io"], &["v1", "boards"])?;
        Ok(Self { company, token })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn listing_url(&self) -> String {
        format!("{API_BASE}/{}/jobs?content=true", self.token)
    }
}

#[async_trait]
impl PlatformScraper for GreenhouseScraper {
    fn company(&self) -> &CompanyIdent {
        &self.company
    }

    fn platform(&self) -> Platform {
        Platform::Greenhouse
    }

    async fn scrape_jobs(
        &self,
        http: &HttpFetcher,
        ctx: &ScrapeContext,
    ) -> Result<Vec<JobRecord>, ScrapeError> {
        let request =
            FetchRequest::get(self.listing_url()).with_bearer(self.company.bearer_token.clone());
        let response = http.fetch(&self.company.slug, &request).await?;
        let page = parse_greenhouse_jobs(&self.company, &self.token, &response.text(), ctx)?;
        if let Some(total) = page.total {
            if total != page.raw_count {
                warn!(
                    company = %self.company.slug,
                    total,
                    listed = page.raw_count,
                    "greenhouse meta.total disagrees with listing"
                );
            }
        }
        info!(company = %self.company.slug, jobs = page.records.len(), "scraped greenhouse board");
        Ok(page.records)
    }
}

/// Parse a `boards-api` job listing (`{"jobs": [...], "meta": {"total": n}}`).
pub fn parse_greenhouse_jobs(
    company: &CompanyIdent,
    token: &str,
    payload: &str,
    ctx: &ScrapeContext,
) -> Result<ParsedPage, ScrapeError> {
    let root = parse_json(company, Platform::Greenhouse, payload)?;
    let jobs = json_array(&root, &["jobs"]).ok_or_else(|| {
        parse_error(company, Platform::Greenhouse, "missing `jobs` array", payload)
    })?;

    let mut records = Vec::with_capacity(jobs.len());
    for job in jobs {
        let Some(native_id) = json_id(job, "id") else {
            debug!(company = %company.slug, "skipping greenhouse job without id");
            continue;
        };
        let url = json_str(job, &["absolute_url"])
            .and_then(|u| normalize_text(Some(u)))
            .unwrap_or_else(|| format!("https://boards.greenhouse.io/{token}/jobs/{native_id}"));
        let Some(mut record) = base_record(
            company,
            Platform::Greenhouse,
            &native_id,
            json_str(job, &["title"]),
            &url,
            ctx,
        ) else {
            continue;
        };

        record.department = json_array(job, &["departments"])
            .and_then(|d| d.first())
            .and_then(|d| normalize_text(json_str(d, &["name"])));
        record.location = normalize_text(json_str(job, &["location", "name"]));
        record.description = json_str(job, &["content"]).and_then(html_to_text);
        record.posted_at = json_str(job, &["first_published"])
            .or_else(|| json_str(job, &["updated_at"]))
            .and_then(parse_date);
        records.push(record);
    }

    let total = root
        .get("meta")
        .and_then(|m| m.get("total"))
        .and_then(|t| t.as_u64())
        .map(|t| t as usize);

    Ok(ParsedPage {
        records,
        raw_count: jobs.len(),
        total,
    })
}
