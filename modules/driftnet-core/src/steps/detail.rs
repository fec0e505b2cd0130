//! Listing, opening, and closing the note detail view.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use controlplane_client::ContainerOp;
use driftnet_common::{DomainContext, DriftnetError, NoteRef};

use crate::locator::LocateOptions;
use crate::progress::make_key;
use crate::recovery::{OverlaySpec, RecoveryOutcome};
use crate::retry::with_retry;
use crate::workflow::Block;

use super::{
    HarvestDeps, NOTE_DETAIL, NOTE_DETAIL_CLOSE, OVERLAY_PROBE_SCRIPT, SEARCH_RESULT_LIST,
};

// ---------------------------------------------------------------------------
// list_notes
// ---------------------------------------------------------------------------

/// Extract the note references visible in the result list.
pub struct ListNotesBlock {
    deps: Arc<HarvestDeps>,
}

impl ListNotesBlock {
    pub fn new(deps: Arc<HarvestDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Block for ListNotesBlock {
    async fn call(&self, _input: Value) -> Result<Value> {
        let deps = &self.deps;

        let result = deps
            .locator
            .locate(&deps.session_id, &[SEARCH_RESULT_LIST], &LocateOptions::default())
            .await?;
        deps.locator.guard(&result, DomainContext::Search)?;

        let plane = deps.plane.clone();
        let session_id = deps.session_id.clone();
        let raw = with_retry(
            || {
                let plane = plane.clone();
                let session_id = session_id.clone();
                async move {
                    plane
                        .container_operation(&session_id, SEARCH_RESULT_LIST, ContainerOp::Extract)
                        .await
                }
            },
            deps.settings.retry_max_attempts,
            Duration::from_millis(deps.settings.retry_base_delay_ms),
            Some(DomainContext::Search),
        )
        .await?;

        let notes: Vec<NoteRef> =
            serde_json::from_value(raw).context("parsing result list extraction")?;
        info!(count = notes.len(), "Result list extracted");

        Ok(json!({ "notes": notes }))
    }
}

// ---------------------------------------------------------------------------
// open_detail
// ---------------------------------------------------------------------------

pub struct OpenDetailBlock {
    deps: Arc<HarvestDeps>,
}

impl OpenDetailBlock {
    pub fn new(deps: Arc<HarvestDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Block for OpenDetailBlock {
    async fn call(&self, input: Value) -> Result<Value> {
        let deps = &self.deps;
        let note_id = input
            .get("noteId")
            .and_then(Value::as_str)
            .context("open_detail: 'noteId' input required")?
            .to_string();
        let container_id = input
            .get("containerId")
            .and_then(Value::as_str)
            .map(String::from);

        // Dedup before touching the page: an already-collected note costs
        // nothing but the lookup.
        let key = make_key(&note_id, container_id.as_deref());
        {
            let mut state = deps.state.lock().expect("harvest state poisoned");
            if state.seen.contains(&key) {
                state.stats.notes_skipped_dup += 1;
                info!(note_id = note_id.as_str(), "Note already collected, skipping");
                return Ok(json!({
                    "noteId": note_id,
                    "containerId": container_id,
                    "skipped": true,
                }));
            }
        }

        let target = container_id.clone().unwrap_or_else(|| note_id.clone());
        let plane = deps.plane.clone();
        let session_id = deps.session_id.clone();
        with_retry(
            || {
                let plane = plane.clone();
                let session_id = session_id.clone();
                let target = target.clone();
                async move {
                    plane
                        .container_operation(&session_id, &target, ContainerOp::Click)
                        .await?;
                    Ok(())
                }
            },
            deps.settings.retry_max_attempts,
            Duration::from_millis(deps.settings.retry_base_delay_ms),
            Some(DomainContext::Detail),
        )
        .await?;

        deps.locator.invalidate(&deps.session_id);
        let result = deps
            .locator
            .locate(&deps.session_id, &[NOTE_DETAIL], &LocateOptions::default())
            .await?;
        deps.locator.guard(&result, DomainContext::Detail)?;

        deps.state.lock().expect("harvest state poisoned").stats.notes_opened += 1;

        Ok(json!({
            "noteId": note_id,
            "containerId": container_id,
            "skipped": false,
            "detailUrl": result.current_url,
        }))
    }
}

// ---------------------------------------------------------------------------
// close_detail
// ---------------------------------------------------------------------------

/// Dismiss the detail overlay through the recovery state machine and verify
/// the session is back on the result list.
pub struct CloseDetailBlock {
    deps: Arc<HarvestDeps>,
}

impl CloseDetailBlock {
    pub fn new(deps: Arc<HarvestDeps>) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Block for CloseDetailBlock {
    async fn call(&self, input: Value) -> Result<Value> {
        let deps = &self.deps;
        if input.get("skipped").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(json!({ "closed": false, "skipped": true }));
        }

        let spec = OverlaySpec {
            overlay_probe_script: OVERLAY_PROBE_SCRIPT.to_string(),
            close_container: Some(NOTE_DETAIL_CLOSE.to_string()),
            anchor_container: SEARCH_RESULT_LIST.to_string(),
        };

        let outcome = deps.recovery.close_overlay(&deps.session_id, &spec).await?;
        deps.locator.invalidate(&deps.session_id);

        match outcome {
            RecoveryOutcome::Closed { method } => {
                deps.state.lock().expect("harvest state poisoned").stats.recoveries += 1;
                Ok(json!({ "closed": true, "method": method.as_str() }))
            }
            RecoveryOutcome::Failed {
                attempts,
                last_url,
                anchor_present,
                overlay_absent,
                screenshot,
            } => {
                deps.state
                    .lock()
                    .expect("harvest state poisoned")
                    .stats
                    .recovery_failures += 1;
                Err(DriftnetError::Recovery(format!(
                    "overlay not dismissed after {attempts} attempts at {last_url} \
                     (anchor_present={anchor_present}, overlay_absent={overlay_absent}, \
                     screenshot={screenshot:?}); manual intervention required"
                ))
                .into())
            }
        }
    }
}
