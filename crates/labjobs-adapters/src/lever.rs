use std::collections::HashSet;

use async_trait::async_trait;
use labjobs_core::{normalize_text, JobRecord, Platform};
use labjobs_storage::{FetchError, FetchRequest, HttpFetcher};
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::{
    base_record, board_token, date_from_epoch_millis, html_to_text, json_array, json_at,
    json_id, json_str, parse_error, parse_json, CompanyIdent, ParsedPage, PlatformScraper,
    ScrapeContext, ScrapeError, MAX_PAGES,
};

const API_BASE: &str = "https://api.lever.co/v0/postings";
const BOARD_BASE: &str = "https://jobs.lever.co";
pub const PAGE_SIZE: usize = 100;

pub struct LeverScraper {
    company: CompanyIdent,
    site: String,
    api_base: String,
    board_base: String,
}

impl LeverScraper {
    pub fn new(company: CompanyIdent, board: &str) -> Result<Self, ScrapeError> {
        let site = board_token(Platform::Lever, board, &["lever.co"], &["v0", "postings"])?;
        Ok(Self {
            company,
            site,
            api_base: API_BASE.to_string(),
            board_base: BOARD_BASE.to_string(),
        })
    }

    /// Point the scraper at another postings API and board host.
    pub fn with_base_urls(mut self, api_base: &str, board_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.board_base = board_base.trim_end_matches('/').to_string();
        self
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn page_url(&self, skip: usize) -> String {
        format!(
            "{}/{}?mode=json&skip={skip}&limit={PAGE_SIZE}",
            self.api_base, self.site
        )
    }

    pub fn board_url(&self) -> String {
        format!("{}/{}", self.board_base, self.site)
    }

    async fn scrape_board_page(
        &self,
        http: &HttpFetcher,
        ctx: &ScrapeContext,
    ) -> Result<Vec<JobRecord>, ScrapeError> {
        let request = FetchRequest::get(self.board_url()).accept_html();
        let response = http.fetch(&self.company.slug, &request).await?;
        let page = parse_lever_board_html(&self.company, &self.site, &response.text(), ctx)?;
        info!(company = %self.company.slug, jobs = page.records.len(), "scraped lever html board");
        Ok(page.records)
    }
}

#[async_trait]
impl PlatformScraper for LeverScraper {
    fn company(&self) -> &CompanyIdent {
        &self.company
    }

    fn platform(&self) -> Platform {
        Platform::Lever
    }

    async fn scrape_jobs(
        &self,
        http: &HttpFetcher,
        ctx: &ScrapeContext,
    ) -> Result<Vec<JobRecord>, ScrapeError> {
        let mut records = Vec::new();
        let mut seen = HashSet::new();

        for page_index in 0..MAX_PAGES {
            let skip = page_index * PAGE_SIZE;
            let request = FetchRequest::get(self.page_url(skip))
                .with_bearer(self.company.bearer_token.clone());
            let response = match http.fetch(&self.company.slug, &request).await {
                Ok(response) => response,
                Err(FetchError::HttpStatus { status: 404, .. }) if page_index == 0 => {
                    warn!(
                        company = %self.company.slug,
                        site = %self.site,
                        "lever postings API returned 404; reading the HTML board"
                    );
                    return self.scrape_board_page(http, ctx).await;
                }
                Err(err) => return Err(err.into()),
            };

            let page = parse_lever_postings(&self.company, &self.site, &response.text(), ctx)?;
            let before = records.len();
            for record in page.records {
                if seen.insert(record.id.clone()) {
                    records.push(record);
                }
            }
            debug!(company = %self.company.slug, skip, listed = page.raw_count, "lever page");

            if page.raw_count < PAGE_SIZE {
                break;
            }
            if records.len() == before {
                warn!(
                    company = %self.company.slug,
                    skip,
                    "lever page repeated earlier postings; stopping pagination"
                );
                break;
            }
        }

        info!(company = %self.company.slug, jobs = records.len(), "scraped lever board");
        Ok(records)
    }
}

/// Parse one page of the postings API (a bare JSON array).
pub fn parse_lever_postings(
    company: &CompanyIdent,
    site: &str,
    payload: &str,
    ctx: &ScrapeContext,
) -> Result<ParsedPage, ScrapeError> {
    let root = parse_json(company, Platform::Lever, payload)?;
    let postings = root
        .as_array()
        .ok_or_else(|| {
            parse_error(company, Platform::Lever, "expected a JSON array of postings", payload)
        })?;
    Ok(ParsedPage {
        records: postings
            .iter()
            .filter_map(|p| posting_record(company, site, p, ctx))
            .collect(),
        raw_count: postings.len(),
        total: None,
    })
}

/// Read postings embedded in the public board page's JSON script blobs.
pub fn parse_lever_board_html(
    company: &CompanyIdent,
    site: &str,
    html: &str,
    ctx: &ScrapeContext,
) -> Result<ParsedPage, ScrapeError> {
    let selector = Selector::parse(r#"script[type="application/json"]"#).map_err(|e| {
        parse_error(company, Platform::Lever, format!("invalid selector: {e}"), html)
    })?;
    let document = Html::parse_document(html);

    let mut postings = Vec::new();
    for script in document.select(&selector) {
        let body = script.text().collect::<String>();
        let Ok(blob) = serde_json::from_str::<JsonValue>(&body) else {
            continue;
        };
        let embedded = json_array(&blob, &["jobs"])
            .or_else(|| json_array(&blob, &["postings"]))
            .or_else(|| json_array(&blob, &["data"]))
            .or_else(|| json_array(&blob, &["props", "jobs"]));
        if let Some(items) = embedded {
            postings.extend(items.iter().cloned());
        }
    }

    if postings.is_empty() && document.select(&selector).next().is_none() {
        return Err(parse_error(
            company,
            Platform::Lever,
            "board page has no embedded postings data",
            html,
        ));
    }

    Ok(ParsedPage {
        records: postings
            .iter()
            .filter_map(|p| posting_record(company, site, p, ctx))
            .collect(),
        raw_count: postings.len(),
        total: None,
    })
}

fn posting_record(
    company: &CompanyIdent,
    site: &str,
    posting: &JsonValue,
    ctx: &ScrapeContext,
) -> Option<JobRecord> {
    let Some(native_id) = json_id(posting, "id") else {
        debug!(company = %company.slug, "skipping lever posting without id");
        return None;
    };
    let url = json_str(posting, &["hostedUrl"])
        .or_else(|| json_str(posting, &["applyUrl"]))
        .and_then(|u| normalize_text(Some(u)))
        .unwrap_or_else(|| format!("{BOARD_BASE}/{site}/{native_id}"));
    let mut record = base_record(
        company,
        Platform::Lever,
        &native_id,
        json_str(posting, &["text"]),
        &url,
        ctx,
    )?;

    record.department = normalize_text(json_str(posting, &["categories", "team"]))
        .or_else(|| normalize_text(json_str(posting, &["categories", "department"])));
    record.location = normalize_text(json_str(posting, &["categories", "location"]))
        .or_else(|| normalize_text(json_str(posting, &["location"])))
        .or_else(|| workplace_address(posting));
    record.description = normalize_text(json_str(posting, &["descriptionPlain"]))
        .or_else(|| json_str(posting, &["description"]).and_then(html_to_text));
    record.posted_at = json_at(posting, &["createdAt"])
        .and_then(JsonValue::as_i64)
        .and_then(date_from_epoch_millis);
    Some(record)
}

fn workplace_address(posting: &JsonValue) -> Option<String> {
    let parts: Vec<String> = ["city", "country"]
        .into_iter()
        .filter_map(|key| normalize_text(json_str(posting, &["workplaceAddress", key])))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}
