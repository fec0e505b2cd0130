//! Persist block — hand the collected note to the sink, record the dedup
//! key, and checkpoint. The sink owns formatting; this block owns durability.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use controlplane_client::ContainerOp;
use driftnet_common::DomainContext;

use crate::classify::classify;
use crate::progress::make_key;
use crate::retry::with_retry;
use crate::traits::{Comment, HarvestedNote};
use crate::workflow::Block;

use super::{HarvestDeps, NOTE_DETAIL};

pub struct PersistBlock {
    deps: Arc<HarvestDeps>,
}

impl PersistBlock {
    pub fn new(deps: Arc<HarvestDeps>) -> Self {
        Self { deps }
    }

    /// Extract the detail fields (title/author/content/url). A degraded
    /// extraction yields an empty shell rather than losing the comments we
    /// already collected.
    async fn extract_detail(&self) -> Result<Value> {
        let deps = &self.deps;
        let plane = deps.plane.clone();
        let session_id = deps.session_id.clone();
        with_retry(
            || {
                let plane = plane.clone();
                let session_id = session_id.clone();
                async move {
                    plane
                        .container_operation(&session_id, NOTE_DETAIL, ContainerOp::Extract)
                        .await
                }
            },
            deps.settings.retry_max_attempts,
            Duration::from_millis(deps.settings.retry_base_delay_ms),
            Some(DomainContext::Detail),
        )
        .await
    }
}

#[async_trait]
impl Block for PersistBlock {
    async fn call(&self, input: Value) -> Result<Value> {
        let deps = &self.deps;
        if input.get("skipped").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(json!({ "persisted": false, "skipped": true }));
        }

        let note_id = input
            .get("noteId")
            .and_then(Value::as_str)
            .context("persist: 'noteId' input required")?
            .to_string();
        let container_id = input
            .get("containerId")
            .and_then(Value::as_str)
            .map(String::from);
        let comments: Vec<Comment> = input
            .get("comments")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .context("persist: malformed 'comments' input")?
            .unwrap_or_default();
        let mut comments_partial = input
            .get("commentsPartial")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let detail = match self.extract_detail().await {
            Ok(v) => v,
            Err(e) => {
                let c = classify(&e, Some(DomainContext::Detail));
                if c.fatal {
                    return Err(e);
                }
                warn!(note_id = note_id.as_str(), error = %e, "Detail extraction degraded");
                comments_partial = true;
                Value::Null
            }
        };

        let note = HarvestedNote {
            note_id: note_id.clone(),
            container_id: container_id.clone(),
            title: detail.get("title").and_then(Value::as_str).map(String::from),
            author: detail.get("author").and_then(Value::as_str).map(String::from),
            content: detail.get("content").and_then(Value::as_str).map(String::from),
            comments,
            comments_partial,
            source_url: detail.get("url").and_then(Value::as_str).map(String::from),
        };

        deps.sink
            .persist(&note)
            .await
            .context("persisting harvested note")?;

        let key = make_key(&note_id, container_id.as_deref());
        {
            let mut state = deps.state.lock().expect("harvest state poisoned");
            state.seen.insert(key.clone());
            state.progress.record(&note_id, container_id.as_deref());
            state.stats.notes_persisted += 1;
        }
        deps.save_checkpoint()?;

        Ok(json!({
            "persisted": true,
            "key": key,
            "commentsPartial": comments_partial,
        }))
    }
}
