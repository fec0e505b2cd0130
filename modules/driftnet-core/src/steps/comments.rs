//! Comment collection — scroll-and-extract loop with graceful degradation.
//!
//! End-of-comments is detected by the exit-anchor signal only. The old
//! header-count comparison heuristic can disagree with the anchor on pages
//! that lazily revise their counts, so it is deliberately not consulted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use controlplane_client::ContainerOp;
use driftnet_common::DomainContext;

use crate::classify::classify;
use crate::locator::LocateOptions;
use crate::retry::with_retry;
use crate::traits::Comment;
use crate::workflow::Block;

use super::{HarvestDeps, COMMENT_END_ANCHOR, COMMENT_LIST};

pub struct CollectCommentsBlock {
    deps: Arc<HarvestDeps>,
}

impl CollectCommentsBlock {
    pub fn new(deps: Arc<HarvestDeps>) -> Self {
        Self { deps }
    }

    async fn extract_comments(&self) -> Result<Vec<Comment>> {
        let deps = &self.deps;
        let plane = deps.plane.clone();
        let session_id = deps.session_id.clone();
        let raw = with_retry(
            || {
                let plane = plane.clone();
                let session_id = session_id.clone();
                async move {
                    plane
                        .container_operation(&session_id, COMMENT_LIST, ContainerOp::Extract)
                        .await
                }
            },
            deps.settings.retry_max_attempts,
            Duration::from_millis(deps.settings.retry_base_delay_ms),
            Some(DomainContext::Comment),
        )
        .await?;
        serde_json::from_value(raw).context("parsing comment extraction")
    }

    async fn end_anchor_visible(&self) -> Result<bool> {
        let deps = &self.deps;
        let options = LocateOptions {
            bypass_cache: true,
            ..LocateOptions::default()
        };
        let result = deps
            .locator
            .locate(&deps.session_id, &[COMMENT_END_ANCHOR], &options)
            .await?;
        deps.locator.guard(&result, DomainContext::Comment).or_else(|e| {
            // Missing anchor just means "not at the end yet"; hard stops
            // still propagate.
            if result.need_manual_intervention {
                Err(e)
            } else {
                Ok(())
            }
        })?;
        Ok(result.located)
    }
}

#[async_trait]
impl Block for CollectCommentsBlock {
    async fn call(&self, input: Value) -> Result<Value> {
        let deps = &self.deps;
        let note_id = input
            .get("noteId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if input.get("skipped").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(json!({
                "noteId": note_id,
                "comments": [],
                "commentsPartial": false,
                "skipped": true,
            }));
        }

        let mut comments: Vec<Comment> = Vec::new();
        let mut partial = false;
        let mut reached_end = false;

        for round in 0..deps.settings.max_comment_rounds {
            // Each extraction returns everything loaded so far; keep the
            // latest, longest view.
            match self.extract_comments().await {
                Ok(batch) => {
                    if batch.len() > comments.len() {
                        comments = batch;
                    }
                }
                Err(e) => {
                    let c = classify(&e, Some(DomainContext::Comment));
                    if c.fatal {
                        return Err(e);
                    }
                    warn!(
                        note_id = note_id.as_str(),
                        round,
                        error = %e,
                        suggestion = c.suggestion.as_str(),
                        "Comment extraction failed, degrading to partial"
                    );
                    partial = true;
                    break;
                }
            }

            match self.end_anchor_visible().await {
                Ok(true) => {
                    debug!(note_id = note_id.as_str(), round, "Comment end anchor visible");
                    reached_end = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    // Hard stops abort; anything else keeps the comments
                    // already collected and flags the set partial.
                    let c = classify(&e, Some(DomainContext::Comment));
                    if c.fatal {
                        return Err(e);
                    }
                    warn!(note_id = note_id.as_str(), round, error = %e, "End anchor check failed, degrading to partial");
                    partial = true;
                    break;
                }
            }

            if let Err(e) = deps
                .plane
                .container_operation(&deps.session_id, COMMENT_LIST, ContainerOp::Scroll)
                .await
            {
                let c = classify(&e, Some(DomainContext::Comment));
                if c.fatal {
                    return Err(e);
                }
                warn!(note_id = note_id.as_str(), round, error = %e, "Comment scroll failed, degrading to partial");
                partial = true;
                break;
            }
        }

        // Round budget exhausted without seeing the anchor: the set cannot
        // be claimed complete.
        if !reached_end && !partial {
            partial = true;
        }

        {
            let mut state = deps.state.lock().expect("harvest state poisoned");
            state.stats.comments_collected += comments.len() as u32;
            if partial {
                state.stats.comments_partial += 1;
            }
        }

        Ok(json!({
            "noteId": note_id,
            "comments": comments,
            "commentsPartial": partial,
            "skipped": false,
        }))
    }
}
