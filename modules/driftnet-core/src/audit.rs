//! Harvest audit log — persisted JSON timeline of every action taken during
//! a run. This is the principal observability hook for diagnosing "where did
//! the crawl get lost."
//!
//! Each run produces a single `{DATA_DIR}/harvest-runs/{session}/{run_id}.json`
//! file containing an ordered list of events with timestamps.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::stats::HarvestStats;

// ---------------------------------------------------------------------------
// data_dir helper
// ---------------------------------------------------------------------------

/// Root data directory, controlled by `DATA_DIR` env var (default: `"data"`).
/// Deployments mount a persistent volume there.
pub fn data_dir() -> PathBuf {
    PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()))
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

pub struct AuditLog {
    pub session_id: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    inner: Mutex<Inner>,
}

struct Inner {
    events: Vec<AuditEvent>,
    seq: u32,
}

#[derive(Serialize)]
struct AuditEvent {
    seq: u32,
    ts: DateTime<Utc>,
    #[serde(flatten)]
    kind: EventKind,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    LocateStart {
        expected: Vec<String>,
        max_depth: u32,
    },
    LocateResult {
        located: bool,
        current_url: String,
        matched: Vec<String>,
        hard_stop: Option<String>,
        cache_hit: bool,
        cache_age_ms: u64,
        duration_ms: u64,
    },
    LocateError {
        error: String,
        duration_ms: u64,
    },
    RecoveryAttempt {
        round: u32,
        method: String,
        anchor_present: bool,
        overlay_absent: bool,
        success: bool,
    },
    RecoveryFailed {
        attempts: u32,
        last_url: String,
        screenshot: Option<String>,
    },
    PermitWait {
        key: String,
        keyword: Option<String>,
        waited_ms: u64,
        skipped: bool,
    },
    StepStarted {
        step: String,
    },
    StepCompleted {
        step: String,
        duration_ms: u64,
    },
    StepFailed {
        step: String,
        error: String,
    },
    CheckpointSaved {
        collected: u64,
        seen: usize,
    },
}

impl AuditLog {
    pub fn new(session_id: String, run_id: String) -> Self {
        Self {
            session_id,
            run_id,
            started_at: Utc::now(),
            inner: Mutex::new(Inner {
                events: Vec::new(),
                seq: 0,
            }),
        }
    }

    pub fn log(&self, kind: EventKind) {
        let mut inner = self.inner.lock().expect("audit log poisoned");
        let seq = inner.seq;
        inner.events.push(AuditEvent {
            seq,
            ts: Utc::now(),
            kind,
        });
        inner.seq += 1;
    }

    pub fn event_count(&self) -> usize {
        self.inner.lock().expect("audit log poisoned").events.len()
    }

    /// Serialize the audit log to JSON and write to disk.
    /// Returns the file path on success.
    pub fn save(&self, stats: &HarvestStats) -> Result<PathBuf> {
        let dir = data_dir().join("harvest-runs").join(&self.session_id);
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.json", self.run_id));

        let inner = self.inner.lock().expect("audit log poisoned");
        let output = SerializedAuditLog {
            run_id: &self.run_id,
            session_id: &self.session_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            stats: SerializedStats::from(stats),
            events: &inner.events,
        };

        std::fs::write(&path, serde_json::to_string_pretty(&output)?)?;
        info!(path = %path.display(), events = inner.events.len(), "Harvest audit log saved");

        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Serialization wrappers
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SerializedAuditLog<'a> {
    run_id: &'a str,
    session_id: &'a str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    stats: SerializedStats,
    events: &'a [AuditEvent],
}

#[derive(Serialize)]
struct SerializedStats {
    searches: u32,
    permit_waits: u32,
    permits_skipped: u32,
    notes_opened: u32,
    notes_skipped_dup: u32,
    notes_persisted: u32,
    comments_collected: u32,
    comments_partial: u32,
    recoveries: u32,
    recovery_failures: u32,
    items_skipped_error: u32,
}

impl From<&HarvestStats> for SerializedStats {
    fn from(s: &HarvestStats) -> Self {
        Self {
            searches: s.searches,
            permit_waits: s.permit_waits,
            permits_skipped: s.permits_skipped,
            notes_opened: s.notes_opened,
            notes_skipped_dup: s.notes_skipped_dup,
            notes_persisted: s.notes_persisted,
            comments_collected: s.comments_collected,
            comments_partial: s.comments_partial,
            recoveries: s.recoveries,
            recovery_failures: s.recovery_failures,
            items_skipped_error: s.items_skipped_error,
        }
    }
}
