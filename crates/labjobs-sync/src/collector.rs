//! Concurrent per-company scraping joined into one snapshot per date.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use labjobs_adapters::{PlatformScraper, ScrapeContext, ScrapeError};
use labjobs_core::{CompanyFailure, FailureKind, JobRecord, JobStatus, Platform, Snapshot};
use labjobs_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, info_span, warn, Instrument};

use crate::ScraperRegistry;

/// What a successful scrape with zero postings means for that company.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyResultPolicy {
    /// The company has no open roles; its registry entries close.
    #[default]
    Close,
    /// Treat the empty board as a failed scrape and carry its entries forward.
    #[serde(rename = "failure")]
    TreatAsFailure,
}

impl FromStr for EmptyResultPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "close" => Ok(Self::Close),
            "failure" | "treat_as_failure" => Ok(Self::TreatAsFailure),
            other => Err(format!(
                "unknown empty-result policy {other:?} (expected close or failure)"
            )),
        }
    }
}

impl fmt::Display for EmptyResultPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Close => "close",
            Self::TreatAsFailure => "failure",
        })
    }
}

/// How one company's scrape went, kept alongside the snapshot for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanyOutcome {
    pub company: String,
    pub platform: Platform,
    pub records: usize,
    pub elapsed: Duration,
    pub failure: Option<CompanyFailure>,
}

#[derive(Debug, Clone)]
pub struct Collection {
    pub snapshot: Snapshot,
    /// In company-table order.
    pub outcomes: Vec<CompanyOutcome>,
}

impl Collection {
    /// Companies that scraped successfully but listed nothing.
    pub fn empty_companies(&self) -> impl Iterator<Item = &CompanyOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.failure.is_none() && o.records == 0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CollectorConfig {
    pub company_timeout: Duration,
    pub max_concurrent_companies: usize,
    pub empty_result_policy: EmptyResultPolicy,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            company_timeout: Duration::from_secs(180),
            max_concurrent_companies: 4,
            empty_result_policy: EmptyResultPolicy::Close,
        }
    }
}

type ScrapeResult = Result<Result<Vec<JobRecord>, ScrapeError>, tokio::time::error::Elapsed>;

pub struct SnapshotCollector {
    http: Arc<HttpFetcher>,
    config: CollectorConfig,
}

impl SnapshotCollector {
    pub fn new(http: Arc<HttpFetcher>, config: CollectorConfig) -> Self {
        Self { http, config }
    }

    /// Scrape every company in `scrapers` for `date`. Never fails as a whole:
    /// each company either contributes records or a [`CompanyFailure`].
    pub async fn collect(&self, date: NaiveDate, scrapers: &ScraperRegistry) -> Collection {
        let limit = Arc::new(Semaphore::new(self.config.max_concurrent_companies.max(1)));
        let company_timeout = self.config.company_timeout;
        let mut set = JoinSet::new();

        for (index, scraper) in scrapers.iter().enumerate() {
            let scraper = Arc::clone(scraper);
            let http = Arc::clone(&self.http);
            let limit = Arc::clone(&limit);
            let span = info_span!(
                "scrape_company",
                company = %scraper.company().slug,
                platform = %scraper.platform()
            );
            set.spawn(async move {
                let _permit = limit.acquire_owned().await.ok();
                let started = Instant::now();
                // Inner task so a panicking adapter still reports into its slot.
                let scrape = tokio::spawn(
                    async move {
                        let ctx = ScrapeContext { date };
                        let jobs = scraper.scrape_jobs(&http, &ctx);
                        tokio::time::timeout(company_timeout, jobs).await
                    }
                    .instrument(span),
                );
                let result = scrape.await;
                (index, started.elapsed(), result)
            });
        }

        let mut slots: Vec<Option<(Duration, Result<ScrapeResult, JoinError>)>> =
            (0..scrapers.len()).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, elapsed, result)) => slots[index] = Some((elapsed, result)),
                Err(err) => error!(error = %err, "collector task failed to report"),
            }
        }

        self.merge(date, scrapers, slots)
    }

    fn merge(
        &self,
        date: NaiveDate,
        scrapers: &ScraperRegistry,
        slots: Vec<Option<(Duration, Result<ScrapeResult, JoinError>)>>,
    ) -> Collection {
        let mut by_id: BTreeMap<String, JobRecord> = BTreeMap::new();
        let mut failures = Vec::new();
        let mut outcomes = Vec::with_capacity(slots.len());

        for (scraper, slot) in scrapers.iter().zip(slots) {
            let company = scraper.company().slug.clone();
            let platform = scraper.platform();
            let fail = |kind: FailureKind, message: String| CompanyFailure {
                company: company.clone(),
                platform,
                kind,
                message,
            };

            let (elapsed, result) = match slot {
                Some((elapsed, Ok(Ok(Ok(records))))) => (elapsed, Ok(records)),
                Some((elapsed, Ok(Ok(Err(err))))) => {
                    (elapsed, Err(fail(err.failure_kind(), err.to_string())))
                }
                Some((elapsed, Ok(Err(_)))) => (
                    elapsed,
                    Err(fail(
                        FailureKind::Timeout,
                        format!("no result within {}s", self.config.company_timeout.as_secs_f64()),
                    )),
                ),
                Some((elapsed, Err(join_err))) => {
                    (elapsed, Err(fail(FailureKind::Panic, join_err.to_string())))
                }
                None => (
                    Duration::ZERO,
                    Err(fail(FailureKind::Panic, "scrape task did not report".to_string())),
                ),
            };

            let result = match result {
                Ok(records)
                    if records.is_empty()
                        && self.config.empty_result_policy == EmptyResultPolicy::TreatAsFailure =>
                {
                    Err(fail(
                        FailureKind::EmptyResult,
                        "board listed no postings".to_string(),
                    ))
                }
                other => other,
            };

            match result {
                Ok(records) => {
                    let count = records.len();
                    for mut record in records {
                        record.status = JobStatus::Open;
                        record.last_seen_at = date;
                        if let Some(previous) = by_id.insert(record.id.clone(), record) {
                            warn!(
                                company = %company,
                                id = %previous.id,
                                "duplicate job id in snapshot; keeping the later record"
                            );
                        }
                    }
                    info!(
                        company = %company,
                        %platform,
                        jobs = count,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "company scraped"
                    );
                    outcomes.push(CompanyOutcome {
                        company,
                        platform,
                        records: count,
                        elapsed,
                        failure: None,
                    });
                }
                Err(failure) => {
                    warn!(
                        company = %company,
                        %platform,
                        kind = ?failure.kind,
                        error = %failure.message,
                        "company scrape failed"
                    );
                    failures.push(failure.clone());
                    outcomes.push(CompanyOutcome {
                        company,
                        platform,
                        records: 0,
                        elapsed,
                        failure: Some(failure),
                    });
                }
            }
        }

        Collection {
            snapshot: Snapshot {
                date,
                records: by_id.into_values().collect(),
                failures,
                paused: scrapers.paused().to_vec(),
            },
            outcomes,
        }
    }
}
