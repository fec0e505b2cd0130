pub mod error;
pub mod types;

pub use error::{PermitError, Result};
pub use types::{DenyInfo, PermitDecision, PermitGrant, PermitRequest};

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Deny codes that must never be retried: spinning on these wastes quota and
/// the server has already said the request class itself is the problem.
const NON_RETRYABLE_DENY_CODES: &[&str] = &[
    "dev_consecutive_keyword_limit",
    "too_many_identical_requests",
];

/// Sleep applied when the gate denies without a usable wait hint.
const AMBIGUOUS_DENIAL_SLEEP: Duration = Duration::from_secs(1);
/// Sleep applied after a transport-level failure before re-requesting.
const TRANSPORT_ERROR_SLEEP: Duration = Duration::from_secs(5);

pub fn is_non_retryable_deny(code: &str) -> bool {
    NON_RETRYABLE_DENY_CODES.contains(&code)
}

// ---------------------------------------------------------------------------
// PermitSource — trait seam over the gate protocol
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PermitSource: Send + Sync {
    /// Issue one `POST /permit` request and return the gate's decision.
    async fn request_permit(&self, req: &PermitRequest) -> Result<PermitDecision>;
}

// ---------------------------------------------------------------------------
// PermitClient — HTTP implementation
// ---------------------------------------------------------------------------

pub struct PermitClient {
    client: reqwest::Client,
    base_url: String,
}

impl PermitClient {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PermitSource for PermitClient {
    async fn request_permit(&self, req: &PermitRequest) -> Result<PermitDecision> {
        let endpoint = format!("{}/permit", self.base_url);

        let resp = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .json(req)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(PermitError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let decision: PermitDecision = resp.json().await?;
        debug!(
            key = req.key.as_str(),
            allowed = decision.allowed,
            wait_ms = decision.wait_ms,
            "Permit decision received"
        );
        Ok(decision)
    }
}

// ---------------------------------------------------------------------------
// wait_for_permit — the admission loop
// ---------------------------------------------------------------------------

/// Loop until the gate grants a permit, obeying server-issued waits exactly.
///
/// Policy, in order per response:
/// - `allowed` → return the grant with the total time waited.
/// - deny with a non-retryable code → fail fast, surfacing `suggested_actions`.
/// - a positive mandated wait → sleep exactly that long (the server owns the
///   quota; sleeping less would over-request, sleeping more wastes the window).
/// - denial with no wait hint → sleep 1s to avoid a busy loop.
/// - transport error → sleep 5s and re-request.
///
/// The loop is bounded by `max_wait`; exceeding it yields `PermitError::Timeout`,
/// which callers must treat differently from a denial.
pub async fn wait_for_permit(
    source: &dyn PermitSource,
    req: &PermitRequest,
    max_wait: Duration,
) -> Result<PermitGrant> {
    let started = tokio::time::Instant::now();

    loop {
        let waited_ms = started.elapsed().as_millis() as u64;
        if started.elapsed() > max_wait {
            return Err(PermitError::Timeout { waited_ms });
        }

        let decision = match source.request_permit(req).await {
            Ok(d) => d,
            Err(PermitError::Network(e)) => {
                warn!(key = req.key.as_str(), error = %e, "Gate unreachable, backing off");
                tokio::time::sleep(TRANSPORT_ERROR_SLEEP).await;
                continue;
            }
            Err(e) => return Err(e),
        };

        if decision.allowed {
            info!(
                key = req.key.as_str(),
                keyword = req.keyword.as_deref().unwrap_or(""),
                waited_ms,
                "Permit granted"
            );
            return Ok(PermitGrant {
                waited_ms,
                decision,
            });
        }

        if let Some(deny) = decision.deny.as_ref() {
            if is_non_retryable_deny(&deny.code) {
                return Err(PermitError::Denied {
                    code: deny.code.clone(),
                    message: deny.message.clone(),
                    suggested_actions: deny.suggested_actions.clone(),
                });
            }
        }

        let wait_ms = decision.mandated_wait_ms();
        if wait_ms > 0 {
            debug!(
                key = req.key.as_str(),
                wait_ms,
                reason = decision.reason.as_deref().unwrap_or(""),
                "Gate mandated wait"
            );
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        } else {
            // Ambiguous denial: no wait hint at all.
            tokio::time::sleep(AMBIGUOUS_DENIAL_SLEEP).await;
        }
    }
}

// ---------------------------------------------------------------------------
// RepeatGuard — local "no identical repeated action" guard
// ---------------------------------------------------------------------------

/// Local guard against issuing the exact same rate-sensitive action twice in
/// a row. The gate counts every request against the window; re-submitting an
/// identical search it just granted inflates that count for nothing.
#[derive(Default)]
pub struct RepeatGuard {
    last_granted: Mutex<Option<(String, Option<String>)>>,
}

impl RepeatGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject a request identical to the one most recently granted.
    pub fn check(&self, key: &str, keyword: Option<&str>) -> Result<()> {
        let last = self.last_granted.lock().expect("repeat guard poisoned");
        if let Some((k, kw)) = last.as_ref() {
            if k == key && kw.as_deref() == keyword {
                return Err(PermitError::Denied {
                    code: "local_repeat_guard".to_string(),
                    message: format!("identical permit request repeated for key '{key}'"),
                    suggested_actions: vec![
                        "advance to the next keyword or verify the prior action completed"
                            .to_string(),
                    ],
                });
            }
        }
        Ok(())
    }

    /// Record a granted action so the next identical one is rejected.
    pub fn record_grant(&self, key: &str, keyword: Option<&str>) {
        let mut last = self.last_granted.lock().expect("repeat guard poisoned");
        *last = Some((key.to_string(), keyword.map(String::from)));
    }

    /// Forget the last grant (e.g., after the page state moved on).
    pub fn reset(&self) {
        let mut last = self.last_granted.lock().expect("repeat guard poisoned");
        *last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Scripted gate: pops one decision (or transport error) per request and
    /// records the instant of each request.
    struct ScriptedGate {
        script: StdMutex<Vec<Result<PermitDecision>>>,
        request_times: StdMutex<Vec<tokio::time::Instant>>,
    }

    impl ScriptedGate {
        fn new(script: Vec<Result<PermitDecision>>) -> Self {
            Self {
                script: StdMutex::new(script),
                request_times: StdMutex::new(Vec::new()),
            }
        }

        fn request_count(&self) -> usize {
            self.request_times.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PermitSource for ScriptedGate {
        async fn request_permit(&self, _req: &PermitRequest) -> Result<PermitDecision> {
            self.request_times
                .lock()
                .unwrap()
                .push(tokio::time::Instant::now());
            self.script
                .lock()
                .unwrap()
                .remove(0)
        }
    }

    fn allowed() -> PermitDecision {
        PermitDecision {
            allowed: true,
            ..Default::default()
        }
    }

    fn throttled(wait_ms: u64) -> PermitDecision {
        PermitDecision {
            allowed: false,
            wait_ms,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn obeys_server_mandated_wait_exactly() {
        let gate = ScriptedGate::new(vec![Ok(throttled(5000)), Ok(allowed())]);
        let req = PermitRequest::new("search", 60_000, 5);

        let grant = wait_for_permit(&gate, &req, Duration::from_secs(60))
            .await
            .unwrap();

        let times = gate.request_times.lock().unwrap();
        assert_eq!(times.len(), 2);
        let gap = times[1] - times[0];
        assert!(
            gap >= Duration::from_millis(5000),
            "re-requested after {gap:?}, before the mandated 5000ms"
        );
        assert!(grant.waited_ms >= 5000);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_deny_fails_on_first_response() {
        let deny = PermitDecision {
            allowed: false,
            deny: Some(DenyInfo {
                code: "dev_consecutive_keyword_limit".to_string(),
                message: "same keyword repeated".to_string(),
                suggested_actions: vec!["change the keyword".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        let gate = ScriptedGate::new(vec![Ok(deny), Ok(allowed())]);
        let req = PermitRequest::new("search", 60_000, 5).with_keyword("cats");

        let err = wait_for_permit(&gate, &req, Duration::from_secs(60))
            .await
            .unwrap_err();

        assert_eq!(gate.request_count(), 1, "must not re-request after hard deny");
        match err {
            PermitError::Denied {
                code,
                suggested_actions,
                ..
            } => {
                assert_eq!(code, "dev_consecutive_keyword_limit");
                assert_eq!(suggested_actions, vec!["change the keyword".to_string()]);
            }
            other => panic!("expected Denied, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ambiguous_denial_sleeps_one_second() {
        let gate = ScriptedGate::new(vec![Ok(throttled(0)), Ok(allowed())]);
        let req = PermitRequest::new("search", 60_000, 5);

        wait_for_permit(&gate, &req, Duration::from_secs(60))
            .await
            .unwrap();

        let times = gate.request_times.lock().unwrap();
        let gap = times[1] - times[0];
        assert!(gap >= Duration::from_secs(1));
        assert!(gap < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_backs_off_then_retries() {
        let gate = ScriptedGate::new(vec![
            Err(PermitError::Network("connection refused".to_string())),
            Ok(allowed()),
        ]);
        let req = PermitRequest::new("search", 60_000, 5);

        let grant = wait_for_permit(&gate, &req, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(gate.request_count(), 2);
        assert!(grant.waited_ms >= 5000);
    }

    #[tokio::test(start_paused = true)]
    async fn exceeding_max_wait_is_timeout_not_denial() {
        let gate = ScriptedGate::new(vec![
            Ok(throttled(4000)),
            Ok(throttled(4000)),
            Ok(throttled(4000)),
        ]);
        let req = PermitRequest::new("search", 60_000, 5);

        let err = wait_for_permit(&gate, &req, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, PermitError::Timeout { .. }));
    }

    #[test]
    fn repeat_guard_rejects_identical_request_after_grant() {
        let guard = RepeatGuard::new();
        guard.check("search", Some("cats")).unwrap();
        guard.record_grant("search", Some("cats"));

        let err = guard.check("search", Some("cats")).unwrap_err();
        assert!(matches!(err, PermitError::Denied { code, .. } if code == "local_repeat_guard"));

        // A different keyword is fine.
        guard.check("search", Some("dogs")).unwrap();
        guard.reset();
        guard.check("search", Some("cats")).unwrap();
    }
}
