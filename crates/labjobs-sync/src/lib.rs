//! Daily pipeline orchestration: company table, concurrent collection, diffing,
//! registry persistence and run reporting.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use labjobs_adapters::{scraper_for, PlatformScraper, ScrapeError};
use labjobs_core::{CompanyConfig, CompanyFailure, Platform, Registry};
use labjobs_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, RegistryStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod collector;
pub mod diff;
pub mod export;

pub use collector::{
    Collection, CollectorConfig, CompanyOutcome, EmptyResultPolicy, SnapshotCollector,
};
pub use diff::{diff, Classification, DiffOutcome, DiffStats};
pub use export::{ManifestFile, OutputLayout, RunManifest};

pub const CRATE_NAME: &str = "labjobs-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("company table {path} not found")]
    MissingCompanyFile { path: PathBuf },
    #[error("reading company table {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid company table {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("company entry {index} is missing `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("duplicate company slug {0:?}")]
    DuplicateSlug(String),
    #[error("company {company}: {source}")]
    BoardReference {
        company: String,
        #[source]
        source: ScrapeError,
    },
    #[error("no company with slug {0:?} in the company table")]
    UnknownCompany(String),
}

#[derive(Debug, Clone, Deserialize)]
struct CompanyTable {
    companies: Vec<CompanyConfig>,
}

/// Parse the YAML company table and check each row before any network use.
pub fn parse_company_table(text: &str, path: &Path) -> Result<Vec<CompanyConfig>, ConfigError> {
    let table: CompanyTable = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut slugs = HashSet::new();
    for (index, company) in table.companies.iter().enumerate() {
        for (field, value) in [
            ("slug", &company.slug),
            ("display_name", &company.display_name),
            ("board", &company.board),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField { index, field });
            }
        }
        if !slugs.insert(company.slug.as_str()) {
            return Err(ConfigError::DuplicateSlug(company.slug.clone()));
        }
    }
    Ok(table.companies)
}

pub async fn load_company_table(path: &Path) -> Result<Vec<CompanyConfig>, ConfigError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::MissingCompanyFile {
                path: path.to_path_buf(),
            })
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    parse_company_table(&text, path)
}

/// One scraper per enabled company, in company-table order. Disabled companies
/// are remembered as paused so their registry entries are kept.
pub struct ScraperRegistry {
    scrapers: Vec<Arc<dyn PlatformScraper>>,
    paused: Vec<String>,
}

impl ScraperRegistry {
    pub fn from_configs(configs: &[CompanyConfig]) -> Result<Self, ConfigError> {
        let mut slugs = HashSet::new();
        let mut scrapers = Vec::new();
        let mut paused = Vec::new();
        for config in configs {
            if !slugs.insert(config.slug.as_str()) {
                return Err(ConfigError::DuplicateSlug(config.slug.clone()));
            }
            if !config.enabled {
                paused.push(config.slug.clone());
                continue;
            }
            let scraper = scraper_for(config).map_err(|source| ConfigError::BoardReference {
                company: config.slug.clone(),
                source,
            })?;
            scrapers.push(scraper);
        }
        Ok(Self { scrapers, paused })
    }

    pub fn from_scrapers(scrapers: Vec<Arc<dyn PlatformScraper>>) -> Self {
        Self {
            scrapers,
            paused: Vec::new(),
        }
    }

    pub fn with_paused(mut self, paused: Vec<String>) -> Self {
        self.paused = paused;
        self
    }

    pub fn paused(&self) -> &[String] {
        &self.paused
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn PlatformScraper>> {
        self.scrapers.iter()
    }

    pub fn len(&self) -> usize {
        self.scrapers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scrapers.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub companies_file: PathBuf,
    pub output_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub company_timeout_secs: u64,
    pub max_in_flight: usize,
    pub max_concurrent_companies: usize,
    pub max_retries: usize,
    pub request_spacing_ms: u64,
    pub empty_result_policy: EmptyResultPolicy,
    pub schedule_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            default: T,
        ) -> T {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        }

        let empty_result_policy = match lookup("LABJOBS_EMPTY_RESULT_POLICY") {
            Some(raw) => raw.parse().unwrap_or_else(|err: String| {
                warn!(error = %err, "falling back to the close policy");
                EmptyResultPolicy::Close
            }),
            None => EmptyResultPolicy::Close,
        };

        Self {
            workspace_root: lookup("LABJOBS_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            companies_file: lookup("LABJOBS_COMPANIES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("companies.yaml")),
            output_dir: lookup("LABJOBS_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("outputs")),
            user_agent: lookup("LABJOBS_USER_AGENT")
                .unwrap_or_else(|| "labjobs-tracker/0.1".to_string()),
            http_timeout_secs: parsed(&lookup, "LABJOBS_HTTP_TIMEOUT_SECS", 30),
            company_timeout_secs: parsed(&lookup, "LABJOBS_COMPANY_TIMEOUT_SECS", 180),
            max_in_flight: parsed(&lookup, "LABJOBS_MAX_IN_FLIGHT", 8),
            max_concurrent_companies: parsed(&lookup, "LABJOBS_MAX_CONCURRENT_COMPANIES", 4),
            max_retries: parsed(&lookup, "LABJOBS_MAX_RETRIES", 3),
            request_spacing_ms: parsed(&lookup, "LABJOBS_REQUEST_SPACING_MS", 500),
            empty_result_policy,
            schedule_cron: lookup("LABJOBS_SCHEDULE_CRON")
                .unwrap_or_else(|| "0 6 * * *".to_string()),
        }
    }

    pub fn companies_path(&self) -> PathBuf {
        self.workspace_root.join(&self.companies_file)
    }

    pub fn output_root(&self) -> PathBuf {
        self.workspace_root.join(&self.output_dir)
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_in_flight: self.max_in_flight,
            request_spacing: Duration::from_millis(self.request_spacing_ms),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            company_timeout: Duration::from_secs(self.company_timeout_secs),
            max_concurrent_companies: self.max_concurrent_companies,
            empty_result_policy: self.empty_result_policy,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    pub new: usize,
    pub updated: usize,
    pub closed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub companies: usize,
    pub total_scraped: usize,
    pub events: EventCounts,
    pub unchanged: usize,
    pub carried_forward: usize,
    pub open_jobs: usize,
    pub failures: Vec<CompanyFailure>,
    /// Disabled companies whose jobs were kept without scraping.
    #[serde(default)]
    pub paused: Vec<String>,
    pub outputs_dir: String,
}

impl RunSummary {
    pub fn daily_brief(&self) -> String {
        let failures = if self.failures.is_empty() {
            "- none".to_string()
        } else {
            self.failures
                .iter()
                .map(|f| format!("- {} ({}, {:?}): {}", f.company, f.platform, f.kind, f.message))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let paused = if self.paused.is_empty() {
            "none".to_string()
        } else {
            self.paused.join(", ")
        };
        format!(
            concat!(
                "# AI Lab Jobs Daily Brief: {}\n\n",
                "- Run ID: `{}`\n",
                "- Started: {}\n",
                "- Finished: {}\n",
                "- Companies scraped: {}\n",
                "- Postings scraped: {}\n",
                "- Open jobs in registry: {}\n\n",
                "## Changes\n",
                "- new: {}\n",
                "- updated: {}\n",
                "- closed: {}\n",
                "- unchanged: {}\n",
                "- carried forward: {}\n",
                "- paused companies: {}\n\n",
                "## Failed Companies\n{}\n",
            ),
            self.date,
            self.run_id,
            self.started_at,
            self.finished_at,
            self.companies,
            self.total_scraped,
            self.open_jobs,
            self.events.new,
            self.events.updated,
            self.events.closed,
            self.unchanged,
            self.carried_forward,
            paused,
            failures,
        )
    }
}

/// Per-company result of a health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompanyHealth {
    pub company: String,
    pub platform: Platform,
    pub status: HealthStatus,
    pub jobs: usize,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Empty,
    Failed,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Empty => "empty",
            HealthStatus::Failed => "failed",
        }
    }
}

impl From<&CompanyOutcome> for CompanyHealth {
    fn from(outcome: &CompanyOutcome) -> Self {
        let status = match (&outcome.failure, outcome.records) {
            (Some(_), _) => HealthStatus::Failed,
            (None, 0) => HealthStatus::Empty,
            (None, _) => HealthStatus::Ok,
        };
        Self {
            company: outcome.company.clone(),
            platform: outcome.platform,
            status,
            jobs: outcome.records,
            elapsed_ms: outcome.elapsed.as_millis() as u64,
            error: outcome.failure.as_ref().map(|f| f.message.clone()),
        }
    }
}

pub fn render_health_table(rows: &[CompanyHealth]) -> String {
    let width = rows
        .iter()
        .map(|r| r.company.len())
        .chain(std::iter::once("company".len()))
        .max()
        .unwrap_or(7);
    let mut lines = vec![format!(
        "{:<width$}  {:<10}  {:<6}  {:>5}  {:>8}  error",
        "company", "platform", "status", "jobs", "ms"
    )];
    for row in rows {
        lines.push(format!(
            "{:<width$}  {:<10}  {:<6}  {:>5}  {:>8}  {}",
            row.company,
            row.platform.as_str(),
            row.status.as_str(),
            row.jobs,
            row.elapsed_ms,
            row.error.as_deref().unwrap_or("-"),
        ));
    }
    let healthy = rows.iter().filter(|r| r.status == HealthStatus::Ok).count();
    lines.push(format!("{healthy}/{} companies healthy", rows.len()));
    lines.join("\n")
}

pub struct DailyPipeline {
    config: SyncConfig,
    http: Arc<HttpFetcher>,
    layout: OutputLayout,
    store: RegistryStore,
}

impl DailyPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_config())?;
        let layout = OutputLayout::new(config.output_root());
        let store = RegistryStore::new(layout.registry_dir());
        Ok(Self {
            config,
            http: Arc::new(http),
            layout,
            store,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    async fn scrapers(&self, only: Option<&str>) -> Result<ScraperRegistry> {
        let path = self.config.companies_path();
        let mut companies = load_company_table(&path).await?;
        if let Some(slug) = only {
            companies.retain(|c| c.slug == slug);
            let Some(company) = companies.first_mut() else {
                return Err(ConfigError::UnknownCompany(slug.to_string()).into());
            };
            company.enabled = true;
        }
        let scrapers = ScraperRegistry::from_configs(&companies)?;
        info!(
            path = %path.display(),
            companies = scrapers.len(),
            paused = scrapers.paused().len(),
            "loaded company table"
        );
        Ok(scrapers)
    }

    fn collector(&self) -> SnapshotCollector {
        SnapshotCollector::new(Arc::clone(&self.http), self.config.collector_config())
    }

    /// Scrape, diff against the stored registry and write every output for `date`.
    pub async fn run_once(&self, date: NaiveDate) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, %date, "starting daily run");

        let scrapers = self.scrapers(None).await?;
        let previous = self
            .store
            .load_baseline_for(date)
            .await
            .context("loading registry")?;

        let collection = self.collector().collect(date, &scrapers).await;
        warn_on_empty_boards(&collection, &previous);
        let outcome = diff(&previous, &collection.snapshot);

        let mut files = Vec::new();
        let snapshot = &collection.snapshot;
        files.push(
            export::write_tracked(
                &self.layout,
                "snapshot",
                &self.layout.snapshot_path(date),
                &export::jobs_parquet(&snapshot.records)?,
            )
            .await?,
        );
        files.push(
            export::write_tracked(
                &self.layout,
                "events",
                &self.layout.events_path(date),
                &export::events_parquet(&outcome.events)?,
            )
            .await?,
        );

        self.store
            .save(&outcome.next_registry)
            .await
            .context("saving registry")?;
        files.push(
            export::write_tracked(
                &self.layout,
                "registry",
                &self.layout.registry_table_path(),
                &export::jobs_parquet(outcome.next_registry.records())?,
            )
            .await?,
        );

        let summary = RunSummary {
            run_id,
            date,
            started_at,
            finished_at: Utc::now(),
            companies: scrapers.len(),
            total_scraped: snapshot.records.len(),
            events: EventCounts {
                new: outcome.stats.new,
                updated: outcome.stats.updated,
                closed: outcome.stats.closed,
            },
            unchanged: outcome.stats.unchanged,
            carried_forward: outcome.stats.carried_forward,
            open_jobs: outcome.next_registry.len(),
            failures: snapshot.failures.clone(),
            paused: snapshot.paused.clone(),
            outputs_dir: self.layout.root().display().to_string(),
        };

        let run_dir = self.layout.run_dir(date);
        let summary_json = serde_json::to_vec_pretty(&summary).context("serializing run summary")?;
        files.push(
            export::write_tracked(
                &self.layout,
                "summary",
                &run_dir.join("summary.json"),
                &summary_json,
            )
            .await?,
        );
        files.push(
            export::write_tracked(
                &self.layout,
                "daily_brief",
                &run_dir.join("daily_brief.md"),
                summary.daily_brief().as_bytes(),
            )
            .await?,
        );

        let manifest = RunManifest {
            schema_version: 1,
            run_id,
            date,
            files,
        };
        let manifest_path = run_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing run manifest")?;
        labjobs_storage::write_atomic(&manifest_path, &bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;

        info!(
            %run_id,
            scraped = summary.total_scraped,
            new = summary.events.new,
            updated = summary.events.updated,
            closed = summary.events.closed,
            carried_forward = summary.carried_forward,
            failed = summary.failures.len(),
            "daily run complete"
        );
        Ok(summary)
    }

    /// Scrape without touching the registry or outputs.
    pub async fn validate(&self, company: Option<&str>) -> Result<Vec<CompanyHealth>> {
        let scrapers = self.scrapers(company).await?;
        let collector = SnapshotCollector::new(
            Arc::clone(&self.http),
            CollectorConfig {
                empty_result_policy: EmptyResultPolicy::Close,
                ..self.config.collector_config()
            },
        );
        let collection = collector.collect(Utc::now().date_naive(), &scrapers).await;
        Ok(collection.outcomes.iter().map(CompanyHealth::from).collect())
    }
}

/// Successful scrapes that listed nothing while the registry still holds open
/// jobs for the company. Under the close policy those jobs close today.
fn warn_on_empty_boards(collection: &Collection, previous: &Registry) {
    for outcome in collection.empty_companies() {
        let open = previous.count_for_company(&outcome.company);
        if open > 0 {
            warn!(
                company = %outcome.company,
                platform = %outcome.platform,
                open,
                "board returned no postings; its open jobs will be closed"
            );
        }
    }
}

/// Cron job running the daily pipeline for the current UTC date.
pub async fn build_scheduler(pipeline: Arc<DailyPipeline>) -> Result<JobScheduler> {
    let cron = pipeline.config().schedule_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            let date = Utc::now().date_naive();
            match pipeline.run_once(date).await {
                Ok(summary) => info!(run_id = %summary.run_id, %date, "scheduled run finished"),
                Err(err) => error!(%date, error = %format!("{err:#}"), "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
