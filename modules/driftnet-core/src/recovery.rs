//! Recovery state machine — deterministically dismiss a blocking overlay and
//! return to a known-good state.
//!
//! Only two dismissal primitives are allowed: a single click on the overlay's
//! close affordance through the container runtime, and a simulated Escape
//! keypress. No generic navigation, no raw DOM event dispatch — those mask
//! detection and can corrupt page state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use controlplane_client::{ContainerOp, MatchQuery};

use crate::audit::{AuditLog, EventKind};
use crate::locator::anchor_present;
use crate::traits::ControlPlane;

/// What the overlay looks like and where "known-good" is.
#[derive(Debug, Clone)]
pub struct OverlaySpec {
    /// Script evaluated via `browser:execute`; must return a boolean:
    /// true when a visible overlay remains.
    pub overlay_probe_script: String,
    /// Container id of the overlay's close control, if one is defined.
    pub close_container: Option<String>,
    /// Anchor container that must be present (with a real bounding rect)
    /// once the overlay is gone, e.g. the search result list.
    pub anchor_container: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DismissMethod {
    ContainerClose,
    EscKey,
    EscKeyDouble,
}

impl DismissMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DismissMethod::ContainerClose => "container-close",
            DismissMethod::EscKey => "esc-key",
            DismissMethod::EscKeyDouble => "esc-key-double",
        }
    }
}

/// Terminal state of one recovery run. `Failed` carries enough diagnostics
/// (per-check booleans, last URL, screenshot reference) for a human to triage
/// without reproducing the session.
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    Closed {
        method: DismissMethod,
    },
    Failed {
        attempts: u32,
        last_url: String,
        anchor_present: bool,
        overlay_absent: bool,
        screenshot: Option<String>,
    },
}

impl RecoveryOutcome {
    pub fn is_closed(&self) -> bool {
        matches!(self, RecoveryOutcome::Closed { .. })
    }
}

struct Verification {
    anchor_present: bool,
    overlay_absent: bool,
    current_url: String,
}

impl Verification {
    fn passed(&self) -> bool {
        // Both signals are required: the anchor can appear behind a
        // still-visible overlay, and the overlay probe can false-negative
        // on markup drift.
        self.anchor_present && self.overlay_absent
    }
}

pub struct OverlayRecovery {
    plane: Arc<dyn ControlPlane>,
    audit: Arc<AuditLog>,
    settle: Duration,
    max_rounds: u32,
}

impl OverlayRecovery {
    pub fn new(
        plane: Arc<dyn ControlPlane>,
        audit: Arc<AuditLog>,
        settle: Duration,
        max_rounds: u32,
    ) -> Self {
        Self {
            plane,
            audit,
            settle,
            max_rounds,
        }
    }

    /// Run the dismissal ladder: container close (first round only) →
    /// Escape → Escape again, each followed by dual verification. Bounded
    /// at `max_rounds` full ladders.
    pub async fn close_overlay(
        &self,
        session_id: &str,
        spec: &OverlaySpec,
    ) -> Result<RecoveryOutcome> {
        let mut last = Verification {
            anchor_present: false,
            overlay_absent: false,
            current_url: String::new(),
        };
        let mut attempts = 0u32;

        for round in 0..self.max_rounds {
            // A negative probe does not short-circuit: overlay selectors
            // drift, and the anchor check below is the real gate.
            match self.probe_overlay(session_id, spec).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(session_id, round, "Overlay probe negative, proceeding anyway")
                }
                Err(e) => warn!(session_id, round, error = %e, "Overlay probe failed, proceeding"),
            }

            if round == 0 {
                if let Some(close_id) = spec.close_container.as_deref() {
                    attempts += 1;
                    // Single click; on failure fall through to Escape rather
                    // than retrying the click.
                    match self
                        .plane
                        .container_operation(session_id, close_id, ContainerOp::Click)
                        .await
                    {
                        Ok(_) => {
                            tokio::time::sleep(self.settle).await;
                            last = self.verify(session_id, spec).await;
                            self.log_attempt(round, DismissMethod::ContainerClose, &last);
                            if last.passed() {
                                return Ok(self.closed(session_id, DismissMethod::ContainerClose));
                            }
                        }
                        Err(e) => {
                            warn!(session_id, close_id, error = %e, "Container close failed, falling through to Escape");
                        }
                    }
                }
            }

            attempts += 1;
            self.plane.press_key(session_id, "Escape").await?;
            tokio::time::sleep(self.settle).await;
            last = self.verify(session_id, spec).await;
            self.log_attempt(round, DismissMethod::EscKey, &last);
            if last.passed() {
                return Ok(self.closed(session_id, DismissMethod::EscKey));
            }

            attempts += 1;
            self.plane.press_key(session_id, "Escape").await?;
            tokio::time::sleep(self.settle).await;
            last = self.verify(session_id, spec).await;
            self.log_attempt(round, DismissMethod::EscKeyDouble, &last);
            if last.passed() {
                return Ok(self.closed(session_id, DismissMethod::EscKeyDouble));
            }
        }

        // Exhausted. Capture a diagnostic screenshot reference, best effort.
        let screenshot = match self.plane.screenshot(session_id).await {
            Ok(r) => r.reference().map(String::from),
            Err(e) => {
                warn!(session_id, error = %e, "Diagnostic screenshot failed");
                None
            }
        };

        self.audit.log(EventKind::RecoveryFailed {
            attempts,
            last_url: last.current_url.clone(),
            screenshot: screenshot.clone(),
        });
        warn!(
            session_id,
            attempts,
            last_url = last.current_url.as_str(),
            anchor_present = last.anchor_present,
            overlay_absent = last.overlay_absent,
            "Overlay recovery exhausted"
        );

        Ok(RecoveryOutcome::Failed {
            attempts,
            last_url: last.current_url,
            anchor_present: last.anchor_present,
            overlay_absent: last.overlay_absent,
            screenshot,
        })
    }

    fn closed(&self, session_id: &str, method: DismissMethod) -> RecoveryOutcome {
        info!(session_id, method = method.as_str(), "Overlay closed and verified");
        RecoveryOutcome::Closed { method }
    }

    async fn probe_overlay(&self, session_id: &str, spec: &OverlaySpec) -> Result<bool> {
        let value = self
            .plane
            .execute_script(session_id, &spec.overlay_probe_script)
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Dual verification: anchor container present with a non-degenerate
    /// rect AND the overlay probe confirms nothing visible remains.
    async fn verify(&self, session_id: &str, spec: &OverlaySpec) -> Verification {
        let (anchor, url) = match self
            .plane
            .match_containers(session_id, &MatchQuery::default())
            .await
        {
            Ok(snapshot) => (
                anchor_present(&snapshot.containers, &spec.anchor_container),
                snapshot.current_url,
            ),
            Err(e) => {
                warn!(session_id, error = %e, "Verification snapshot failed");
                (false, String::new())
            }
        };

        // A probe error counts as "cannot confirm absence", not absence.
        let overlay_absent = match self.probe_overlay(session_id, spec).await {
            Ok(visible) => !visible,
            Err(_) => false,
        };

        Verification {
            anchor_present: anchor,
            overlay_absent,
            current_url: url,
        }
    }

    fn log_attempt(&self, round: u32, method: DismissMethod, v: &Verification) {
        self.audit.log(EventKind::RecoveryAttempt {
            round,
            method: method.as_str().to_string(),
            anchor_present: v.anchor_present,
            overlay_absent: v.overlay_absent,
            success: v.passed(),
        });
    }
}
