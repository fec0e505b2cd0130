//! Default note sink — one JSON line per harvested note. Rich Markdown and
//! image persistence live outside this core; this keeps raw records durable.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::audit::data_dir;
use crate::traits::{HarvestedNote, NoteSink};

pub struct JsonlSink {
    path: PathBuf,
    // Serializes appends from concurrent blocks within one process.
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn for_session(session_id: &str) -> Self {
        Self {
            path: data_dir().join("notes").join(format!("{session_id}.jsonl")),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl NoteSink for JsonlSink {
    async fn persist(&self, note: &HarvestedNote) -> Result<()> {
        let line = serde_json::to_string(note)?;

        let _guard = self.lock.lock().expect("sink lock poisoned");
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("opening note sink file")?;
        writeln!(file, "{line}")?;

        info!(
            note_id = note.note_id.as_str(),
            comments = note.comments.len(),
            partial = note.comments_partial,
            "Note persisted"
        );
        Ok(())
    }
}
