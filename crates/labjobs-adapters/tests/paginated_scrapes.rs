mod common;

use common::{ctx, fetcher, fixture, Reply, StubServer};
use labjobs_adapters::{CompanyIdent, LeverScraper, PlatformScraper, WorkdayScraper};
use serde_json::{json, Value};

fn lever_postings(prefix: &str, range: std::ops::Range<usize>) -> String {
    let postings: Vec<Value> = range
        .map(|i| {
            json!({
                "id": format!("{prefix}-{i}"),
                "text": format!("Research Engineer {i}"),
                "categories": {"team": "Research", "location": "San Francisco, CA"},
                "createdAt": 1_750_000_000_000u64,
            })
        })
        .collect();
    Value::Array(postings).to_string()
}

fn workday_page(total: usize, range: std::ops::Range<usize>) -> String {
    let postings: Vec<Value> = range
        .map(|i| {
            json!({
                "title": format!("Machine Learning Engineer {i}"),
                "externalPath": format!("/job/Paris/MLE_R-{i}"),
                "locationsText": "Paris",
                "postedOn": "Posted Today",
                "bulletFields": [format!("R-{i}")],
            })
        })
        .collect();
    json!({"total": total, "jobPostings": postings}).to_string()
}

#[tokio::test]
async fn lever_walks_pages_until_a_short_page() {
    let server = StubServer::start(|req| {
        if !req.path().starts_with("/v0/postings/anthropic") {
            return Reply::status(404);
        }
        match req.query("skip").as_deref() {
            Some("0") => Reply::json(lever_postings("p", 0..100)),
            Some("100") => Reply::json(lever_postings("p", 100..103)),
            _ => Reply::json(lever_postings("overrun", 0..100)),
        }
    })
    .await;

    let scraper = LeverScraper::new(CompanyIdent::new("anthropic", "Anthropic"), "anthropic")
        .expect("scraper")
        .with_base_urls(&server.url("/v0/postings"), &server.url(""));
    let records = scraper.scrape_jobs(&fetcher(), &ctx()).await.expect("scrape");

    assert_eq!(records.len(), 103);
    assert!(records.iter().all(|r| r.native_id.starts_with("p-")));
    let skips: Vec<_> = server
        .requests()
        .iter()
        .map(|r| r.query("skip").unwrap_or_default())
        .collect();
    assert_eq!(skips, vec!["0", "100"]);
}

#[tokio::test]
async fn lever_reads_the_html_board_when_the_api_is_missing() {
    let board = fixture("lever", "anthropic_board.html");
    let server = StubServer::start(move |req| {
        if req.path() == "/anthropic" {
            Reply::html(board.clone())
        } else {
            Reply::status(404)
        }
    })
    .await;

    let scraper = LeverScraper::new(CompanyIdent::new("anthropic", "Anthropic"), "anthropic")
        .expect("scraper")
        .with_base_urls(&server.url("/v0/postings"), &server.url(""));
    let records = scraper.scrape_jobs(&fetcher(), &ctx()).await.expect("scrape");

    let ids: Vec<_> = records.iter().map(|r| r.native_id.as_str()).collect();
    assert_eq!(ids, vec!["html-1", "html-2"]);
    let paths: Vec<_> = server
        .requests()
        .iter()
        .map(|r| r.path().to_string())
        .collect();
    assert_eq!(paths, vec!["/v0/postings/anthropic", "/anthropic"]);
}

#[tokio::test]
async fn workday_stops_at_the_first_page_total() {
    let server = StubServer::start(|req| {
        let body: Value = serde_json::from_str(&req.body).unwrap_or_default();
        match body["offset"].as_u64() {
            Some(0) => Reply::json(workday_page(45, 0..20)),
            Some(20) => Reply::json(workday_page(0, 20..40)),
            Some(40) => Reply::json(workday_page(0, 40..45)),
            _ => Reply::json(workday_page(0, 900..920)),
        }
    })
    .await;

    let scraper = WorkdayScraper::new(
        CompanyIdent::new("huggingface", "Hugging Face"),
        &server.url("/huggingface"),
        Some("huggingface"),
    )
    .expect("scraper");
    let records = scraper.scrape_jobs(&fetcher(), &ctx()).await.expect("scrape");

    assert_eq!(records.len(), 45);
    assert_eq!(records[44].native_id, "R-44");
    assert_eq!(records[0].posted_at, Some(ctx().date));

    let requests = server.requests();
    assert!(requests.iter().all(|r| r.method == "POST"));
    assert!(requests
        .iter()
        .all(|r| r.path() == "/wday/cxs/huggingface/huggingface/jobs"));
    let offsets: Vec<_> = requests
        .iter()
        .map(|r| serde_json::from_str::<Value>(&r.body).unwrap_or_default()["offset"].clone())
        .collect();
    assert_eq!(offsets, vec![json!(0), json!(20), json!(40)]);
}

#[tokio::test]
async fn workday_stops_on_an_empty_page_without_a_total() {
    let server = StubServer::start(|req| {
        let body: Value = serde_json::from_str(&req.body).unwrap_or_default();
        match body["offset"].as_u64() {
            Some(0) => Reply::json(workday_page(0, 0..20)),
            _ => Reply::json(workday_page(0, 0..0)),
        }
    })
    .await;

    let scraper = WorkdayScraper::new(
        CompanyIdent::new("stabilityai", "Stability AI"),
        &server.url("/Stability"),
        Some("stability"),
    )
    .expect("scraper");
    let records = scraper.scrape_jobs(&fetcher(), &ctx()).await.expect("scrape");

    assert_eq!(records.len(), 20);
    assert_eq!(server.requests().len(), 2);
}
