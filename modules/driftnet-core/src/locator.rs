//! State locator ("locate & guard") — verify "am I at the state I expect"
//! before acting, and refuse to proceed past hard-stop conditions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, warn};

use controlplane_client::{ContainerNode, ContainerSnapshot, MatchQuery};
use driftnet_common::{DomainContext, DriftnetError, HardStop};

use crate::audit::{AuditLog, EventKind};
use crate::traits::ControlPlane;

/// URL fragments that mark a human-verification / captcha page.
const RISK_CONTROL_URL_MARKERS: &[&str] = &["captcha", "verify", "security-check", "risk"];

/// Container id of the login wall.
pub const LOGIN_GUARD_CONTAINER: &str = "login-guard";

/// Options for one locate call.
#[derive(Debug, Clone)]
pub struct LocateOptions {
    pub max_depth: u32,
    pub max_children: u32,
    pub root_selector: Option<String>,
    /// Known page URL, if the caller has one. Cache entries are keyed by the
    /// page URL they were snapshotted on; without a hint the session's last
    /// observed URL is used, so snapshots from different pages never alias.
    pub url_hint: Option<String>,
    /// Force a fresh remote query even when a cached snapshot is live.
    pub bypass_cache: bool,
}

impl Default for LocateOptions {
    fn default() -> Self {
        Self {
            max_depth: 6,
            max_children: 50,
            root_selector: None,
            url_hint: None,
            bypass_cache: false,
        }
    }
}

/// Client-side cache provenance for one locate call.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub enabled: bool,
    pub hit: bool,
    pub age_ms: u64,
    pub ttl_ms: u64,
}

/// Outcome of one locate call. `need_manual_intervention` holds exactly when
/// a hard stop was detected.
#[derive(Debug, Clone)]
pub struct LocateResult {
    pub located: bool,
    pub current_url: String,
    pub matched: Vec<String>,
    pub missing: Vec<String>,
    pub hard_stop: Option<HardStop>,
    pub need_manual_intervention: bool,
    pub cache: CacheStats,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    session_id: String,
    url: String,
    max_depth: u32,
    max_children: u32,
    root_selector: Option<String>,
}

struct CachedSnapshot {
    snapshot: ContainerSnapshot,
    fetched_at: Instant,
}

pub struct Locator {
    plane: Arc<dyn ControlPlane>,
    audit: Arc<AuditLog>,
    target_domain: String,
    ttl: Duration,
    cache: Mutex<HashMap<CacheKey, CachedSnapshot>>,
    /// Last URL each session was observed on; the default cache-key URL when
    /// the caller has no hint. Cleared by `invalidate`.
    last_url: Mutex<HashMap<String, String>>,
}

impl Locator {
    pub fn new(
        plane: Arc<dyn ControlPlane>,
        audit: Arc<AuditLog>,
        target_domain: &str,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            plane,
            audit,
            target_domain: target_domain.to_string(),
            ttl: cache_ttl,
            cache: Mutex::new(HashMap::new()),
            last_url: Mutex::new(HashMap::new()),
        }
    }

    /// Query a container snapshot and verify the expected containers are
    /// present. With no expectations this is a bare "can we see any container
    /// at all" probe and `located` is vacuously true.
    pub async fn locate(
        &self,
        session_id: &str,
        expected: &[&str],
        options: &LocateOptions,
    ) -> Result<LocateResult> {
        let started = Instant::now();
        self.audit.log(EventKind::LocateStart {
            expected: expected.iter().map(|s| s.to_string()).collect(),
            max_depth: options.max_depth,
        });

        let (snapshot, cache) = match self.snapshot(session_id, options).await {
            Ok(v) => v,
            Err(e) => {
                self.audit.log(EventKind::LocateError {
                    error: format!("{e:#}"),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                return Err(e);
            }
        };

        let hard_stop = self.scan_hard_stops(&snapshot);

        let mut matched = Vec::new();
        let mut missing = Vec::new();
        for exp in expected {
            match find_container(&snapshot.containers, exp) {
                Some(node) => matched.push(node.id.clone()),
                None => missing.push(exp.to_string()),
            }
        }
        let located = missing.is_empty();

        let result = LocateResult {
            located,
            current_url: snapshot.current_url.clone(),
            matched,
            missing,
            hard_stop,
            need_manual_intervention: hard_stop.is_some(),
            cache,
        };

        self.audit.log(EventKind::LocateResult {
            located: result.located,
            current_url: result.current_url.clone(),
            matched: result.matched.clone(),
            hard_stop: result.hard_stop.map(|h| h.as_str().to_string()),
            cache_hit: result.cache.hit,
            cache_age_ms: result.cache.age_ms,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        debug!(
            session_id,
            located = result.located,
            hard_stop = ?result.hard_stop,
            cache_hit = result.cache.hit,
            "Locate complete"
        );

        Ok(result)
    }

    /// Raise when the result demands manual intervention or the expected
    /// containers are absent. Error messages are phrased so the classifier
    /// maps hard stops to Systemic and missing containers to Permanent.
    pub fn guard(&self, result: &LocateResult, context: DomainContext) -> Result<()> {
        if let Some(stop) = result.hard_stop {
            let message = match stop {
                HardStop::RiskControl => format!(
                    "risk control verification page at {} ({} context)",
                    result.current_url,
                    context.as_str()
                ),
                HardStop::LoginGuard => format!(
                    "login guard blocked the page at {} ({} context)",
                    result.current_url,
                    context.as_str()
                ),
                HardStop::Offsite => format!(
                    "navigated offsite to {}, login status uncertain ({} context)",
                    result.current_url,
                    context.as_str()
                ),
            };
            return Err(DriftnetError::HardStop(message).into());
        }
        if !result.located {
            anyhow::bail!(
                "expected containers not found at {}: [{}]",
                result.current_url,
                result.missing.join(", ")
            );
        }
        Ok(())
    }

    /// Drop every cached snapshot (and the observed URL) for a session,
    /// forcing fresh remote queries.
    pub fn invalidate(&self, session_id: &str) {
        let mut cache = self.cache.lock().expect("locator cache poisoned");
        cache.retain(|k, _| k.session_id != session_id);
        drop(cache);
        self.last_url
            .lock()
            .expect("locator url map poisoned")
            .remove(session_id);
    }

    fn cache_key(&self, session_id: &str, url: &str, options: &LocateOptions) -> CacheKey {
        CacheKey {
            session_id: session_id.to_string(),
            url: url.to_string(),
            max_depth: options.max_depth,
            max_children: options.max_children,
            root_selector: options.root_selector.clone(),
        }
    }

    async fn snapshot(
        &self,
        session_id: &str,
        options: &LocateOptions,
    ) -> Result<(ContainerSnapshot, CacheStats)> {
        let enabled = !self.ttl.is_zero();

        if enabled && !options.bypass_cache {
            let lookup_url = options.url_hint.clone().or_else(|| {
                self.last_url
                    .lock()
                    .expect("locator url map poisoned")
                    .get(session_id)
                    .cloned()
            });
            if let Some(url) = lookup_url {
                let key = self.cache_key(session_id, &url, options);
                let cache = self.cache.lock().expect("locator cache poisoned");
                if let Some(entry) = cache.get(&key) {
                    let age = entry.fetched_at.elapsed();
                    if age < self.ttl {
                        return Ok((
                            entry.snapshot.clone(),
                            CacheStats {
                                enabled,
                                hit: true,
                                age_ms: age.as_millis() as u64,
                                ttl_ms: self.ttl.as_millis() as u64,
                            },
                        ));
                    }
                }
            }
        }

        let query = MatchQuery {
            max_depth: options.max_depth,
            max_children: options.max_children,
            root_selector: options.root_selector.clone(),
        };
        let snapshot = self
            .plane
            .match_containers(session_id, &query)
            .await
            .context("fetching container snapshot")?;

        if enabled {
            // Entries are keyed by the URL the snapshot was actually taken
            // on, so a stale lookup URL can only miss, never serve a
            // cross-page snapshot.
            let key = self.cache_key(session_id, &snapshot.current_url, options);
            let mut cache = self.cache.lock().expect("locator cache poisoned");
            cache.insert(
                key,
                CachedSnapshot {
                    snapshot: snapshot.clone(),
                    fetched_at: Instant::now(),
                },
            );
            drop(cache);
            self.last_url
                .lock()
                .expect("locator url map poisoned")
                .insert(session_id.to_string(), snapshot.current_url.clone());
        }

        Ok((
            snapshot,
            CacheStats {
                enabled,
                hit: false,
                age_ms: 0,
                ttl_ms: self.ttl.as_millis() as u64,
            },
        ))
    }

    /// Scan for hard-stop conditions in priority order:
    /// risk-control URL > login-guard container > offsite URL.
    fn scan_hard_stops(&self, snapshot: &ContainerSnapshot) -> Option<HardStop> {
        let url_lower = snapshot.current_url.to_lowercase();
        if RISK_CONTROL_URL_MARKERS.iter().any(|m| url_lower.contains(m)) {
            return Some(HardStop::RiskControl);
        }

        if find_container(&snapshot.containers, LOGIN_GUARD_CONTAINER).is_some() {
            return Some(HardStop::LoginGuard);
        }

        if let Ok(parsed) = url::Url::parse(&snapshot.current_url) {
            if let Some(host) = parsed.host_str() {
                if host != self.target_domain
                    && !host.ends_with(&format!(".{}", self.target_domain))
                {
                    return Some(HardStop::Offsite);
                }
            }
        }

        None
    }
}

// ---------------------------------------------------------------------------
// Container tree search
// ---------------------------------------------------------------------------

/// Recursive tree search, first match wins (depth-first, declaration order).
pub fn find_where<'a>(
    nodes: &'a [ContainerNode],
    pred: &impl Fn(&ContainerNode) -> bool,
) -> Option<&'a ContainerNode> {
    for node in nodes {
        if pred(node) {
            return Some(node);
        }
        if let Some(found) = find_where(&node.children, pred) {
            return Some(found);
        }
    }
    None
}

/// Find a container whose `id` or `def_id` matches `pattern`.
///
/// The pattern is tried as a regular expression first (full match against the
/// id); a pattern that fails to compile is treated as a literal id.
pub fn find_container<'a>(
    nodes: &'a [ContainerNode],
    pattern: &str,
) -> Option<&'a ContainerNode> {
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) => find_where(nodes, &|n: &ContainerNode| {
            re.is_match(&n.id) || n.def_id.as_deref().is_some_and(|d| re.is_match(d))
        }),
        Err(_) => {
            warn!(pattern, "Container pattern is not a valid regex, matching literally");
            find_where(nodes, &|n: &ContainerNode| {
                n.id == pattern || n.def_id.as_deref() == Some(pattern)
            })
        }
    }
}

/// True when the container is present with a non-degenerate bounding rect —
/// the "anchor" evidence standard used by recovery verification.
pub fn anchor_present(nodes: &[ContainerNode], pattern: &str) -> bool {
    find_container(nodes, pattern)
        .and_then(|n| n.rect)
        .is_some_and(|r| !r.is_degenerate())
}
