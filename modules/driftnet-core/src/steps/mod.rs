//! Harvest step blocks — the thin, fragile operations the orchestration
//! layer exists to make reliable. Each block verifies state before acting,
//! classifies every failure, and leaves progress resumable.

pub(crate) mod comments;
pub(crate) mod detail;
pub(crate) mod persist;
pub(crate) mod search;

#[cfg(test)]
mod comments_tests;
#[cfg(test)]
mod search_tests;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;

use driftnet_common::Config;
use permit_client::{PermitSource, RepeatGuard};

use crate::audit::AuditLog;
use crate::locator::Locator;
use crate::progress::{ProgressState, ProgressTracker};
use crate::recovery::OverlayRecovery;
use crate::stats::HarvestStats;
use crate::traits::{ControlPlane, NoteSink};
use crate::workflow::WorkflowExecutor;

// ---------------------------------------------------------------------------
// Container identifiers and probes
// ---------------------------------------------------------------------------

pub const SEARCH_INPUT: &str = "search-input";
pub const SEARCH_SUBMIT: &str = "search-submit";
pub const SEARCH_RESULT_LIST: &str = "search-result-list";
pub const NOTE_DETAIL: &str = "note-detail";
pub const NOTE_DETAIL_CLOSE: &str = "note-detail-close";
pub const COMMENT_LIST: &str = "comment-list";
pub const COMMENT_END_ANCHOR: &str = "comment-end-anchor";

/// DOM probe for visible blocking overlays; returns a boolean.
pub const OVERLAY_PROBE_SCRIPT: &str =
    r#"(() => !!document.querySelector('.modal-mask:not([hidden]), [role="dialog"]:not([hidden])'))()"#;

// ---------------------------------------------------------------------------
// Shared run state and dependencies
// ---------------------------------------------------------------------------

/// Per-run mutable state. Guarded by a std Mutex; blocks take the lock only
/// for synchronous reads/writes, never across an await.
pub struct HarvestState {
    pub progress: ProgressState,
    pub seen: HashSet<String>,
    pub stats: HarvestStats,
}

impl HarvestState {
    /// Resume from the session checkpoint when one exists, else start fresh.
    pub fn resume_or_new(tracker: &ProgressTracker, session_id: &str) -> Result<Self> {
        let progress = match tracker.load()? {
            Some(state) => {
                tracing::info!(
                    session_id,
                    keyword_index = state.keyword_index,
                    collected = state.collected_count,
                    "Resuming from checkpoint"
                );
                state
            }
            None => ProgressState::new(session_id),
        };
        let seen = progress.dedup_set();
        Ok(Self {
            progress,
            seen,
            stats: HarvestStats::default(),
        })
    }
}

/// Tunables the blocks need, detached from the full env config so tests can
/// construct them directly.
#[derive(Debug, Clone)]
pub struct HarvestSettings {
    pub search_window_ms: u64,
    pub search_max_count: u32,
    pub permit_max_wait_ms: u64,
    pub skip_permit_on_target: bool,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub max_comment_rounds: u32,
}

impl HarvestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            search_window_ms: config.search_window_ms,
            search_max_count: config.search_max_count,
            permit_max_wait_ms: config.permit_max_wait_ms,
            skip_permit_on_target: config.skip_permit_on_target,
            retry_max_attempts: config.retry_max_attempts,
            retry_base_delay_ms: config.retry_base_delay_ms,
            max_comment_rounds: 30,
        }
    }
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            search_window_ms: 60_000,
            search_max_count: 5,
            permit_max_wait_ms: 120_000,
            skip_permit_on_target: true,
            retry_max_attempts: 3,
            retry_base_delay_ms: 3000,
            max_comment_rounds: 30,
        }
    }
}

/// Immutable dependencies shared by every block in a run.
pub struct HarvestDeps {
    pub session_id: String,
    pub plane: Arc<dyn ControlPlane>,
    pub gate: Arc<dyn PermitSource>,
    pub locator: Arc<Locator>,
    pub recovery: Arc<OverlayRecovery>,
    pub tracker: Arc<ProgressTracker>,
    pub repeat_guard: Arc<RepeatGuard>,
    pub audit: Arc<AuditLog>,
    pub sink: Arc<dyn NoteSink>,
    pub state: Arc<Mutex<HarvestState>>,
    pub settings: HarvestSettings,
}

impl HarvestDeps {
    /// Persist the current progress state atomically and log the checkpoint.
    pub fn save_checkpoint(&self) -> Result<()> {
        let (progress, seen_len, collected) = {
            let state = self.state.lock().expect("harvest state poisoned");
            (
                state.progress.clone(),
                state.seen.len(),
                state.progress.collected_count,
            )
        };
        self.tracker.save(&progress)?;
        self.audit.log(crate::audit::EventKind::CheckpointSaved {
            collected,
            seen: seen_len,
        });
        Ok(())
    }
}

/// Register every block under its canonical name.
pub fn register_blocks(executor: &mut WorkflowExecutor, deps: &Arc<HarvestDeps>) {
    executor.register("search", Arc::new(search::SearchBlock::new(deps.clone())));
    executor.register(
        "list_notes",
        Arc::new(detail::ListNotesBlock::new(deps.clone())),
    );
    executor.register(
        "open_detail",
        Arc::new(detail::OpenDetailBlock::new(deps.clone())),
    );
    executor.register(
        "collect_comments",
        Arc::new(comments::CollectCommentsBlock::new(deps.clone())),
    );
    executor.register(
        "persist",
        Arc::new(persist::PersistBlock::new(deps.clone())),
    );
    executor.register(
        "close_detail",
        Arc::new(detail::CloseDetailBlock::new(deps.clone())),
    );
}
