//! Parquet exports and the per-run manifest.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDate;
use labjobs_core::{ChangeEvent, JobFields, JobRecord};
use labjobs_storage::{sha256_hex, write_atomic};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Paths of everything a run writes, relative to the output root.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot_path(&self, date: NaiveDate) -> PathBuf {
        self.root.join("snapshots").join(format!("{date}.parquet"))
    }

    pub fn events_path(&self, date: NaiveDate) -> PathBuf {
        self.root.join("events").join(format!("{date}.parquet"))
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.root.join("registry")
    }

    pub fn registry_table_path(&self) -> PathBuf {
        self.registry_dir().join("current_jobs.parquet")
    }

    pub fn run_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join("runs").join(date.to_string())
    }

    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Atomically write `bytes` and describe the result for the manifest.
pub async fn write_tracked(
    layout: &OutputLayout,
    name: &str,
    path: &Path,
    bytes: &[u8],
) -> Result<ManifestFile> {
    write_atomic(path, bytes)
        .await
        .with_context(|| format!("writing {name} to {}", path.display()))?;
    Ok(ManifestFile {
        name: name.to_string(),
        path: layout.relative(path),
        sha256: sha256_hex(bytes),
        bytes: bytes.len() as u64,
    })
}

fn parquet_bytes(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(batch).context("writing record batch")?;
    writer.into_inner().context("closing parquet writer")
}

fn job_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("company", DataType::Utf8, false),
        ArrowField::new("platform", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("department", DataType::Utf8, true),
        ArrowField::new("location", DataType::Utf8, true),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("posted_at", DataType::Utf8, true),
        ArrowField::new("first_seen_at", DataType::Utf8, false),
        ArrowField::new("last_seen_at", DataType::Utf8, false),
    ]))
}

/// One row per record, in the order given.
pub fn jobs_parquet<'a>(records: impl IntoIterator<Item = &'a JobRecord>) -> Result<Vec<u8>> {
    let records: Vec<&JobRecord> = records.into_iter().collect();
    let text = |f: fn(&JobRecord) -> Option<String>| {
        StringArray::from(records.iter().map(|r| f(r)).collect::<Vec<_>>())
    };

    let batch = RecordBatch::try_new(
        job_schema(),
        vec![
            Arc::new(text(|r| Some(r.id.clone()))),
            Arc::new(text(|r| Some(r.company.clone()))),
            Arc::new(text(|r| Some(r.platform.to_string()))),
            Arc::new(text(|r| Some(r.title.clone()))),
            Arc::new(text(|r| r.department.clone())),
            Arc::new(text(|r| r.location.clone())),
            Arc::new(text(|r| Some(r.url.clone()))),
            Arc::new(text(|r| Some(r.status.as_str().to_string()))),
            Arc::new(text(|r| r.posted_at.map(|d| d.to_string()))),
            Arc::new(text(|r| Some(r.first_seen_at.to_string()))),
            Arc::new(text(|r| Some(r.last_seen_at.to_string()))),
        ],
    )
    .context("building jobs record batch")?;
    parquet_bytes(&batch)
}

fn fields_json(fields: Option<&JobFields>) -> Result<Option<String>> {
    fields
        .map(serde_json::to_string)
        .transpose()
        .context("serializing event fields")
}

/// Event log rows; `before`/`after` hold the field blobs as JSON text.
pub fn events_parquet(events: &[ChangeEvent]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("date", DataType::Utf8, false),
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("company", DataType::Utf8, false),
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("before", DataType::Utf8, true),
        ArrowField::new("after", DataType::Utf8, true),
    ]));

    let mut before = Vec::with_capacity(events.len());
    let mut after = Vec::with_capacity(events.len());
    for event in events {
        before.push(fields_json(event.before.as_ref())?);
        after.push(fields_json(event.after.as_ref())?);
    }

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                events.iter().map(|e| e.date.to_string()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                events.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                events.iter().map(|e| e.company.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                events.iter().map(|e| e.kind.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(before)),
            Arc::new(StringArray::from(after)),
        ],
    )
    .context("building events record batch")?;
    parquet_bytes(&batch)
}
