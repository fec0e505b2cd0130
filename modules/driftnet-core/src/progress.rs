//! Progress tracker — durable, versioned checkpoint for resume-after-crash.
//!
//! The checkpoint is advisory: out-of-band persistence is the source of truth
//! for data already written. One file per session id; no locking — running
//! two processes against the same session is a caller-enforced invariant.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Current checkpoint schema version. Version 1 predates `seenKeys` and is
/// migrated on load; anything newer than this is refused (treated as "no
/// usable checkpoint") rather than misread.
pub const PROGRESS_VERSION: u32 = 2;

const KEY_SEPARATOR: &str = "||";

/// Composite dedup key for one unit of work.
pub fn make_key(note_id: &str, container_id: Option<&str>) -> String {
    format!("{note_id}{KEY_SEPARATOR}{}", container_id.unwrap_or(""))
}

/// Inverse of `make_key`. An empty container component parses to `None`.
pub fn parse_key(key: &str) -> (String, Option<String>) {
    match key.split_once(KEY_SEPARATOR) {
        Some((note, container)) if !container.is_empty() => {
            (note.to_string(), Some(container.to_string()))
        }
        Some((note, _)) => (note.to_string(), None),
        None => (key.to_string(), None),
    }
}

fn legacy_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    #[serde(default = "legacy_version")]
    pub version: u32,
    pub session_id: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub keyword_index: u32,
    #[serde(default)]
    pub search_round: u32,
    #[serde(default)]
    pub collected_count: u64,
    /// Legacy (v1) single-field dedup set, kept for files written before
    /// composite keys existed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seen_note_ids: Vec<String>,
    #[serde(default)]
    pub seen_keys: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_keyword: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_note_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_container_id: Option<String>,
}

impl ProgressState {
    pub fn new(session_id: &str) -> Self {
        Self {
            version: PROGRESS_VERSION,
            session_id: session_id.to_string(),
            updated_at: Utc::now(),
            keyword_index: 0,
            search_round: 0,
            collected_count: 0,
            seen_note_ids: Vec::new(),
            seen_keys: Some(Vec::new()),
            last_keyword: None,
            last_note_id: None,
            last_container_id: None,
        }
    }

    /// Seed an in-memory dedup set from the checkpoint.
    pub fn dedup_set(&self) -> HashSet<String> {
        self.seen_keys
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect()
    }

    /// Record one completed unit of work. Counting is tied to the dedup
    /// insert so `collected_count` always equals `|seen_keys|`.
    pub fn record(&mut self, note_id: &str, container_id: Option<&str>) {
        let key = make_key(note_id, container_id);
        let keys = self.seen_keys.get_or_insert_with(Vec::new);
        if !keys.contains(&key) {
            keys.push(key);
            self.collected_count += 1;
        }
        self.last_note_id = Some(note_id.to_string());
        self.last_container_id = container_id.map(String::from);
    }
}

pub struct ProgressTracker {
    path: PathBuf,
}

impl ProgressTracker {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Deterministic checkpoint path: `{data_dir}/checkpoints/{session_id}.json`.
    pub fn for_session(data_dir: &Path, session_id: &str) -> Self {
        Self {
            path: data_dir.join("checkpoints").join(format!("{session_id}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Atomic save: write to a temp file in the same directory, then rename
    /// over the checkpoint path. A crash mid-write leaves either the old
    /// checkpoint or the new one, never a torn file.
    pub fn save(&self, state: &ProgressState) -> Result<()> {
        let dir = self
            .path
            .parent()
            .context("checkpoint path has no parent directory")?;
        std::fs::create_dir_all(dir)?;

        let mut on_disk = state.clone();
        on_disk.version = PROGRESS_VERSION;
        on_disk.updated_at = Utc::now();

        let json = serde_json::to_string_pretty(&on_disk)?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::fs::write(tmp.path(), json)?;
        tmp.persist(&self.path)
            .map_err(|e| anyhow::anyhow!("persisting checkpoint: {e}"))?;

        Ok(())
    }

    /// Load and migrate the checkpoint. Returns `None` (start fresh) when the
    /// file is missing or carries a version this reader cannot interpret.
    pub fn load(&self) -> Result<Option<ProgressState>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("reading checkpoint"),
        };

        let mut state: ProgressState =
            serde_json::from_str(&raw).context("parsing checkpoint")?;

        if state.version > PROGRESS_VERSION {
            warn!(
                path = %self.path.display(),
                version = state.version,
                "Checkpoint written by a newer schema, starting fresh"
            );
            return Ok(None);
        }

        // v1 → v2: derive composite keys from the legacy single-field set
        // (empty container component).
        if state.seen_keys.is_none() {
            let derived: Vec<String> = state
                .seen_note_ids
                .iter()
                .map(|id| make_key(id, None))
                .collect();
            info!(
                path = %self.path.display(),
                migrated = derived.len(),
                "Migrated legacy checkpoint to composite dedup keys"
            );
            state.seen_keys = Some(derived);
            state.version = PROGRESS_VERSION;
        }

        Ok(Some(state))
    }

    /// Remove the checkpoint after confirmed full task success.
    /// A missing file is not an error.
    pub fn cleanup(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Checkpoint removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("removing checkpoint"),
        }
    }
}
