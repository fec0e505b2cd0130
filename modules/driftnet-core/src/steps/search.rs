//! Search block — the only rate-sensitive action. Never issued without a
//! permit from the admission gate (or an explicit on-target short-circuit).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use controlplane_client::ContainerOp;
use driftnet_common::DomainContext;
use permit_client::{wait_for_permit, PermitRequest};

use crate::audit::EventKind;
use crate::locator::LocateOptions;
use crate::retry::with_retry;
use crate::workflow::Block;

use super::{HarvestDeps, SEARCH_INPUT, SEARCH_RESULT_LIST, SEARCH_SUBMIT};

/// Gate key under which search actions are counted.
pub const SEARCH_PERMIT_KEY: &str = "search";

pub struct SearchBlock {
    deps: Arc<HarvestDeps>,
}

impl SearchBlock {
    pub fn new(deps: Arc<HarvestDeps>) -> Self {
        Self { deps }
    }

    /// Short-circuit: if the session is already showing results for exactly
    /// this keyword, re-running the search is a no-op that would only inflate
    /// the gate's counters.
    async fn already_on_target(&self, keyword: &str) -> Result<bool> {
        let result = self
            .deps
            .locator
            .locate(
                &self.deps.session_id,
                &[SEARCH_RESULT_LIST],
                &LocateOptions::default(),
            )
            .await?;
        // Hard stops still bind even on the fast path.
        if result.need_manual_intervention {
            self.deps.locator.guard(&result, DomainContext::Search)?;
        }
        if !result.located {
            return Ok(false);
        }

        Ok(url_shows_keyword(&result.current_url, keyword))
    }
}

/// True when some query parameter of `url` equals `keyword` exactly.
/// Substring checks are not good enough: "cats" is contained in a results
/// page for "catsanddogs", and skipping the search there harvests the wrong
/// keyword's results.
fn url_shows_keyword(url: &str, keyword: &str) -> bool {
    url::Url::parse(url)
        .map(|u| u.query_pairs().any(|(_, v)| v == keyword))
        .unwrap_or(false)
}

#[async_trait]
impl Block for SearchBlock {
    async fn call(&self, input: Value) -> Result<Value> {
        let keyword = input
            .get("keyword")
            .and_then(Value::as_str)
            .context("search: 'keyword' input required")?
            .to_string();
        let deps = &self.deps;

        if deps.settings.skip_permit_on_target && self.already_on_target(&keyword).await? {
            info!(keyword = keyword.as_str(), "Already on target result page, skipping permit");
            deps.audit.log(EventKind::PermitWait {
                key: SEARCH_PERMIT_KEY.to_string(),
                keyword: Some(keyword.clone()),
                waited_ms: 0,
                skipped: true,
            });
            deps.state.lock().expect("harvest state poisoned").stats.permits_skipped += 1;
            let result = deps
                .locator
                .locate(&deps.session_id, &[SEARCH_RESULT_LIST], &LocateOptions::default())
                .await?;
            return Ok(json!({
                "keyword": keyword,
                "resultUrl": result.current_url,
                "permitSkipped": true,
            }));
        }

        deps.repeat_guard
            .check(SEARCH_PERMIT_KEY, Some(&keyword))
            .map_err(anyhow::Error::new)?;

        let req = PermitRequest::new(
            SEARCH_PERMIT_KEY,
            deps.settings.search_window_ms,
            deps.settings.search_max_count,
        )
        .with_keyword(&keyword);
        let grant = wait_for_permit(
            deps.gate.as_ref(),
            &req,
            Duration::from_millis(deps.settings.permit_max_wait_ms),
        )
        .await
        .map_err(anyhow::Error::new)?;

        deps.audit.log(EventKind::PermitWait {
            key: SEARCH_PERMIT_KEY.to_string(),
            keyword: Some(keyword.clone()),
            waited_ms: grant.waited_ms,
            skipped: false,
        });
        deps.state.lock().expect("harvest state poisoned").stats.permit_waits += 1;

        // Submit the search through the container runtime.
        let plane = deps.plane.clone();
        let session_id = deps.session_id.clone();
        let kw = keyword.clone();
        with_retry(
            || {
                let plane = plane.clone();
                let session_id = session_id.clone();
                let kw = kw.clone();
                async move {
                    let script = format!(
                        "document.querySelector('[data-container=\"{SEARCH_INPUT}\"] input').value = {};",
                        serde_json::to_string(&kw)?
                    );
                    plane.execute_script(&session_id, &script).await?;
                    plane
                        .container_operation(&session_id, SEARCH_SUBMIT, ContainerOp::Click)
                        .await?;
                    Ok(())
                }
            },
            deps.settings.retry_max_attempts,
            Duration::from_millis(deps.settings.retry_base_delay_ms),
            Some(DomainContext::Search),
        )
        .await?;

        // The page just changed; cached snapshots are stale.
        deps.locator.invalidate(&deps.session_id);

        let result = deps
            .locator
            .locate(&deps.session_id, &[SEARCH_RESULT_LIST], &LocateOptions::default())
            .await?;
        deps.locator.guard(&result, DomainContext::Search)?;

        deps.repeat_guard.record_grant(SEARCH_PERMIT_KEY, Some(&keyword));

        {
            let mut state = deps.state.lock().expect("harvest state poisoned");
            state.stats.searches += 1;
            state.progress.search_round += 1;
            state.progress.last_keyword = Some(keyword.clone());
        }
        if let Err(e) = deps.save_checkpoint() {
            warn!(error = %e, "Checkpoint save after search failed");
        }

        Ok(json!({
            "keyword": keyword,
            "resultUrl": result.current_url,
            "permitSkipped": false,
            "waitedMs": grant.waited_ms,
        }))
    }
}
