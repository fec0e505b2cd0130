//! Error classifier — the single place failure semantics are decided.
//!
//! Classification happens at the point of failure and travels with the error;
//! downstream layers either consume the error or re-raise it unchanged.

use std::time::Duration;

use driftnet_common::DomainContext;

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network/timeout — retry with backoff.
    Temporary,
    /// Resource absent or selector stale — skip the unit, continue the batch.
    Permanent,
    /// Auth/session/risk-control — abort the whole task.
    Systemic,
    /// Partial functionality loss — continue with reduced data, flagged.
    Degraded,
}

/// What the caller must do with the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry,
    SkipItem,
    GracefulDegrade,
    AbortTask,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub kind: ErrorKind,
    pub action: RecoveryAction,
    pub retryable: bool,
    pub fatal: bool,
    pub backoff_base: Option<Duration>,
    pub suggestion: String,
}

impl Classification {
    fn systemic(suggestion: String) -> Self {
        Self {
            kind: ErrorKind::Systemic,
            action: RecoveryAction::AbortTask,
            retryable: false,
            fatal: true,
            backoff_base: None,
            suggestion,
        }
    }

    fn temporary(suggestion: String) -> Self {
        Self {
            kind: ErrorKind::Temporary,
            action: RecoveryAction::Retry,
            retryable: true,
            fatal: false,
            backoff_base: Some(Duration::from_millis(3000)),
            suggestion,
        }
    }

    fn permanent(suggestion: String) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            action: RecoveryAction::SkipItem,
            retryable: false,
            fatal: false,
            backoff_base: None,
            suggestion,
        }
    }

    fn degraded(suggestion: String) -> Self {
        Self {
            kind: ErrorKind::Degraded,
            action: RecoveryAction::GracefulDegrade,
            retryable: false,
            fatal: false,
            backoff_base: None,
            suggestion,
        }
    }
}

/// Systemic markers invalidate every subsequent action in the run; retrying
/// wastes quota and may escalate risk-control suspicion.
const SYSTEMIC_MARKERS: &[&str] = &[
    "session",
    "unauthorized",
    "blocked",
    "risk control",
    "login guard",
    "login status uncertain",
    "manual intervention",
];

const TEMPORARY_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "network error",
    "temporarily unavailable",
];

const PERMANENT_MARKERS: &[&str] = &[
    "not found",
    "404",
    "no longer exists",
    "selector invalid",
    "invalid selector",
    "container definition missing",
    "unknown container",
];

const DEGRADED_MARKERS: &[&str] = &[
    "partial",
    "degraded",
    "anchor verification",
    "comments incomplete",
    "image fetch failed",
];

/// Classify a failure. Pure and total — never panics, always answers.
///
/// Precedence is absolute, first match wins: Systemic > Temporary >
/// Permanent > Degraded > fallback. Unclassified errors default to
/// `SkipItem`: never silently retry an unknown failure indefinitely, never
/// abort the whole task on an unknown single-item error.
pub fn classify(error: &anyhow::Error, context: Option<DomainContext>) -> Classification {
    let message = format!("{error:#}").to_lowercase();
    let ctx = context.unwrap_or(DomainContext::Unknown);

    if matches_any(&message, SYSTEMIC_MARKERS) {
        let suggestion = match ctx {
            DomainContext::Login => {
                "re-authenticate the session manually, then restart the run".to_string()
            }
            _ => "stop the run and verify session health before resuming".to_string(),
        };
        return Classification::systemic(suggestion);
    }

    if matches_any(&message, TEMPORARY_MARKERS) {
        return Classification::temporary(
            "transient network failure, will retry with backoff".to_string(),
        );
    }

    if matches_any(&message, PERMANENT_MARKERS) {
        return Classification::permanent(
            "resource or selector is gone, skipping this item".to_string(),
        );
    }

    if matches_any(&message, DEGRADED_MARKERS) {
        let suggestion = match ctx {
            DomainContext::Comment => {
                "mark commentsPartial=true and keep the note".to_string()
            }
            _ => "continue with reduced data and flag the record".to_string(),
        };
        return Classification::degraded(suggestion);
    }

    Classification::permanent(format!(
        "unclassified failure in {} context, skipping this item",
        ctx.as_str()
    ))
}

fn matches_any(message: &str, markers: &[&str]) -> bool {
    markers.iter().any(|m| message.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn timeout_is_temporary_retry() {
        let c = classify(&anyhow!("request timeout after 30s"), None);
        assert_eq!(c.kind, ErrorKind::Temporary);
        assert_eq!(c.action, RecoveryAction::Retry);
        assert!(c.retryable);
        assert!(!c.fatal);
        assert_eq!(c.backoff_base, Some(Duration::from_millis(3000)));
    }

    #[test]
    fn session_errors_are_systemic_fatal() {
        for msg in ["session invalidated by server", "401 Unauthorized"] {
            let c = classify(&anyhow!("{msg}"), None);
            assert_eq!(c.kind, ErrorKind::Systemic, "{msg}");
            assert_eq!(c.action, RecoveryAction::AbortTask);
            assert!(c.fatal);
        }
    }

    #[test]
    fn systemic_precedence_is_absolute() {
        // Contains both a temporary and a systemic marker.
        let c = classify(&anyhow!("timeout while refreshing: session expired"), None);
        assert_eq!(c.kind, ErrorKind::Systemic);
        assert_eq!(c.action, RecoveryAction::AbortTask);
    }

    #[test]
    fn not_found_skips_item() {
        let c = classify(&anyhow!("note 42 not found"), Some(DomainContext::Detail));
        assert_eq!(c.kind, ErrorKind::Permanent);
        assert_eq!(c.action, RecoveryAction::SkipItem);
        assert!(!c.retryable);
    }

    #[test]
    fn comment_context_refines_degraded_suggestion() {
        let c = classify(
            &anyhow!("comments incomplete: partial extraction"),
            Some(DomainContext::Comment),
        );
        assert_eq!(c.action, RecoveryAction::GracefulDegrade);
        assert!(c.suggestion.contains("commentsPartial"));
    }

    #[test]
    fn unknown_errors_fall_back_to_skip() {
        let c = classify(&anyhow!("something nobody has seen before"), None);
        assert_eq!(c.kind, ErrorKind::Permanent);
        assert_eq!(c.action, RecoveryAction::SkipItem);
        assert!(!c.retryable);
        assert!(!c.fatal);
    }

    #[test]
    fn invariants_hold_across_samples() {
        let samples = [
            "timeout",
            "session gone",
            "not found",
            "partial comments",
            "???",
        ];
        for msg in samples {
            let c = classify(&anyhow!("{msg}"), None);
            if c.fatal {
                assert_eq!(c.action, RecoveryAction::AbortTask, "{msg}");
            }
            if c.action == RecoveryAction::Retry {
                assert!(c.retryable, "{msg}");
            }
        }
    }

    #[test]
    fn classification_reads_the_context_chain() {
        let inner = anyhow!("connection refused");
        let wrapped = inner.context("fetching container snapshot");
        let c = classify(&wrapped, None);
        assert_eq!(c.kind, ErrorKind::Temporary);
    }
}
