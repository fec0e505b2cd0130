use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use controlplane_client::ControlPlaneClient;
use driftnet_common::Config;
use permit_client::{PermitClient, RepeatGuard};

use driftnet_core::audit::{data_dir, AuditLog};
use driftnet_core::locator::Locator;
use driftnet_core::progress::ProgressTracker;
use driftnet_core::recovery::OverlayRecovery;
use driftnet_core::sink::JsonlSink;
use driftnet_core::steps::{register_blocks, HarvestDeps, HarvestSettings, HarvestState};
use driftnet_core::traits::ControlPlane;
use driftnet_core::workflow::{RunOutcome, StepSpec, WorkflowExecutor};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("driftnet=info".parse()?))
        .init();

    info!("Driftnet harvester starting...");

    // Load config
    let config = Config::from_env();
    config.log_redacted();

    let run_id = uuid::Uuid::new_v4().to_string();
    let audit = Arc::new(AuditLog::new(config.session_id.clone(), run_id));

    // Wire up the collaborators
    let plane: Arc<dyn ControlPlane> = Arc::new(ControlPlaneClient::new(
        &config.control_plane_url,
        config.control_plane_token.as_deref(),
    ));
    let gate = Arc::new(PermitClient::new(&config.gate_url));
    let locator = Arc::new(Locator::new(
        plane.clone(),
        audit.clone(),
        &config.target_domain,
        Duration::from_millis(config.locate_cache_ttl_ms),
    ));
    let recovery = Arc::new(OverlayRecovery::new(
        plane.clone(),
        audit.clone(),
        Duration::from_millis(config.settle_ms),
        config.max_recovery_rounds,
    ));
    let tracker = Arc::new(ProgressTracker::for_session(
        &data_dir(),
        &config.session_id,
    ));
    let state = HarvestState::resume_or_new(&tracker, &config.session_id)?;
    let sink = Arc::new(JsonlSink::for_session(&config.session_id));

    let deps = Arc::new(HarvestDeps {
        session_id: config.session_id.clone(),
        plane,
        gate,
        locator,
        recovery,
        tracker: tracker.clone(),
        repeat_guard: Arc::new(RepeatGuard::new()),
        audit: audit.clone(),
        sink,
        state: Arc::new(Mutex::new(state)),
        settings: HarvestSettings::from_config(&config),
    });

    let mut executor = WorkflowExecutor::new(&config.session_id, audit.clone());
    register_blocks(&mut executor, &deps);

    let result = harvest(&executor, &deps, &config).await;

    // Persist the run timeline no matter how the run ended.
    let stats = deps.state.lock().expect("harvest state poisoned").stats.clone();
    if let Err(e) = audit.save(&stats) {
        warn!(error = %e, "Audit log save failed");
    }
    info!("Run summary: {stats}");

    match result {
        Ok(clean) => {
            if clean {
                // Nothing left to resume; the checkpoint has served its purpose.
                tracker.cleanup()?;
            }
            Ok(())
        }
        Err(e) => {
            error!(error = format!("{e:#}").as_str(), "Harvest aborted");
            Err(e)
        }
    }
}

/// Run the full harvest. Returns `Ok(true)` when every keyword completed
/// without a single failed step, `Ok(false)` when some items were skipped
/// on errors, and `Err` on a hard stop.
async fn harvest(
    executor: &WorkflowExecutor,
    deps: &Arc<HarvestDeps>,
    config: &Config,
) -> Result<bool> {
    let mut clean = true;

    for keyword in &config.keywords {
        info!(keyword = keyword.as_str(), "Harvesting keyword");

        let outcome = executor
            .run(&[
                StepSpec::new("search", "search", json!({ "keyword": keyword })),
                StepSpec::new("list_notes", "list_notes", json!({})),
            ])
            .await;
        abort_on_hard_stop(&outcome)?;
        if !outcome.success {
            warn!(keyword = keyword.as_str(), "Search failed, moving to next keyword");
            clean = false;
            continue;
        }

        let notes = outcome
            .results
            .iter()
            .find(|r| r.step == "list_notes")
            .and_then(|r| r.output.get("notes").and_then(|v| v.as_array()).cloned())
            .unwrap_or_default();
        info!(keyword = keyword.as_str(), count = notes.len(), "Notes to collect");

        for note in &notes {
            let outcome = executor
                .run(&[
                    StepSpec::new(
                        "open_detail",
                        "open_detail",
                        json!({
                            "noteId": note.get("noteId").cloned().unwrap_or_default(),
                            "containerId": note.get("containerId").cloned().unwrap_or_default(),
                        }),
                    ),
                    StepSpec::new(
                        "collect_comments",
                        "collect_comments",
                        json!({
                            "noteId": "$open_detail.noteId",
                            "skipped": "$open_detail.skipped",
                        }),
                    ),
                    StepSpec::new(
                        "persist",
                        "persist",
                        json!({
                            "noteId": "$open_detail.noteId",
                            "containerId": "$open_detail.containerId",
                            "comments": "$collect_comments.comments",
                            "commentsPartial": "$collect_comments.commentsPartial",
                            "skipped": "$collect_comments.skipped",
                        }),
                    ),
                    StepSpec::new(
                        "close_detail",
                        "close_detail",
                        json!({ "skipped": "$open_detail.skipped" }),
                    ),
                ])
                .await;
            abort_on_hard_stop(&outcome)?;
            if !outcome.success {
                clean = false;
                deps.state
                    .lock()
                    .expect("harvest state poisoned")
                    .stats
                    .items_skipped_error += 1;
            }
        }

        {
            let mut state = deps.state.lock().expect("harvest state poisoned");
            state.progress.keyword_index += 1;
        }
        if let Err(e) = deps.save_checkpoint() {
            warn!(error = %e, "Checkpoint save after keyword failed");
        }
    }

    Ok(clean)
}

/// A failed step whose error demands manual intervention (risk control,
/// login wall, unrecoverable overlay) ends the whole run; everything else
/// just skips the item.
fn abort_on_hard_stop(outcome: &RunOutcome) -> Result<()> {
    for err in &outcome.errors {
        if err.error.contains("manual intervention required") {
            anyhow::bail!("{} failed: {}", err.step, err.error);
        }
    }
    Ok(())
}
