//! Day-over-day classification of job ids against the previous registry.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use labjobs_core::{ChangeEvent, ChangeKind, JobRecord, JobStatus, Registry, Snapshot};
use serde::Serialize;
use tracing::debug;

/// Where one id ended up after a diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    New,
    Updated,
    Closed,
    Unchanged,
    CarriedForward,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    pub new: usize,
    pub updated: usize,
    pub closed: usize,
    pub unchanged: usize,
    pub carried_forward: usize,
}

impl DiffStats {
    fn count(&mut self, class: Classification) {
        match class {
            Classification::New => self.new += 1,
            Classification::Updated => self.updated += 1,
            Classification::Closed => self.closed += 1,
            Classification::Unchanged => self.unchanged += 1,
            Classification::CarriedForward => self.carried_forward += 1,
        }
    }

    pub fn events(&self) -> usize {
        self.new + self.updated + self.closed
    }
}

#[derive(Debug, Clone)]
pub struct DiffOutcome {
    /// Sorted by id.
    pub events: Vec<ChangeEvent>,
    pub next_registry: Registry,
    pub stats: DiffStats,
    pub classes: BTreeMap<String, Classification>,
}

/// Compare `snapshot` against `previous` and build the next registry.
///
/// Ids missing from the snapshot close, unless their company failed or is
/// paused; those entries are carried forward untouched. When the snapshot
/// repeats an id, the later record wins.
pub fn diff(previous: &Registry, snapshot: &Snapshot) -> DiffOutcome {
    let date = snapshot.date;
    let held: HashSet<&str> = snapshot.held_companies().collect();
    let mut next = Registry::new();
    next.as_of = Some(date);
    let mut events = Vec::new();
    let mut classes = BTreeMap::new();
    let mut seen = HashSet::new();

    for record in snapshot.records.iter().rev() {
        if !seen.insert(record.id.as_str()) {
            continue;
        }
        let class = match previous.get(&record.id) {
            None => {
                let mut fresh = record.clone();
                fresh.status = JobStatus::Open;
                fresh.first_seen_at = date;
                fresh.last_seen_at = date;
                events.push(ChangeEvent {
                    date,
                    id: record.id.clone(),
                    company: record.company.clone(),
                    kind: ChangeKind::New,
                    before: None,
                    after: Some(fresh.fields()),
                });
                next.insert(fresh);
                Classification::New
            }
            Some(prior) => {
                let merged = merge_seen(prior, record, date);
                let changed = prior.fields().changed_fields(&record.fields());
                let class = if changed.is_empty() {
                    Classification::Unchanged
                } else {
                    debug!(id = %record.id, ?changed, "job fields changed");
                    events.push(ChangeEvent {
                        date,
                        id: record.id.clone(),
                        company: record.company.clone(),
                        kind: ChangeKind::Updated,
                        before: Some(prior.fields()),
                        after: Some(merged.fields()),
                    });
                    Classification::Updated
                };
                next.insert(merged);
                class
            }
        };
        classes.insert(record.id.clone(), class);
    }

    for prior in previous.records() {
        if seen.contains(prior.id.as_str()) {
            continue;
        }
        let class = if held.contains(prior.company.as_str()) {
            next.insert(prior.clone());
            Classification::CarriedForward
        } else {
            events.push(ChangeEvent {
                date,
                id: prior.id.clone(),
                company: prior.company.clone(),
                kind: ChangeKind::Closed,
                before: Some(prior.fields()),
                after: None,
            });
            Classification::Closed
        };
        classes.insert(prior.id.clone(), class);
    }

    events.sort_by(|a, b| a.id.cmp(&b.id).then(a.kind.cmp(&b.kind)));
    let mut stats = DiffStats::default();
    for class in classes.values() {
        stats.count(*class);
    }

    DiffOutcome {
        events,
        next_registry: next,
        stats,
        classes,
    }
}

/// The observed record, keeping identity dates from the registry entry.
fn merge_seen(prior: &JobRecord, observed: &JobRecord, date: NaiveDate) -> JobRecord {
    JobRecord {
        status: JobStatus::Open,
        first_seen_at: prior.first_seen_at,
        posted_at: observed.posted_at.or(prior.posted_at),
        last_seen_at: date,
        ..observed.clone()
    }
}
