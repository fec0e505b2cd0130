use std::env;

use tracing::info;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Browser control plane
    pub control_plane_url: String,
    pub control_plane_token: Option<String>,

    // Admission-control gate
    pub gate_url: String,

    // Session
    pub session_id: String,
    pub target_domain: String,
    pub keywords: Vec<String>,

    // Locator
    pub locate_cache_ttl_ms: u64,

    // Recovery
    pub settle_ms: u64,
    pub max_recovery_rounds: u32,

    // Admission control
    pub search_window_ms: u64,
    pub search_max_count: u32,
    pub permit_max_wait_ms: u64,
    pub skip_permit_on_target: bool,

    // Retry
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            control_plane_url: required_env("CONTROL_PLANE_URL"),
            control_plane_token: env::var("CONTROL_PLANE_TOKEN").ok(),
            gate_url: required_env("GATE_URL"),
            session_id: required_env("SESSION_ID"),
            target_domain: required_env("TARGET_DOMAIN"),
            keywords: env::var("KEYWORDS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            locate_cache_ttl_ms: numeric_env("LOCATE_CACHE_TTL_MS", 5000),
            settle_ms: numeric_env("RECOVERY_SETTLE_MS", 1200),
            max_recovery_rounds: numeric_env("MAX_RECOVERY_ROUNDS", 3),
            search_window_ms: numeric_env("SEARCH_WINDOW_MS", 60_000),
            search_max_count: numeric_env("SEARCH_MAX_COUNT", 5),
            permit_max_wait_ms: numeric_env("PERMIT_MAX_WAIT_MS", 120_000),
            skip_permit_on_target: env::var("DRIFTNET_SKIP_PERMIT_ON_TARGET")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            retry_max_attempts: numeric_env("RETRY_MAX_ATTEMPTS", 3),
            retry_base_delay_ms: numeric_env("RETRY_BASE_DELAY_MS", 3000),
        }
    }

    /// Log the effective configuration with secrets redacted.
    pub fn log_redacted(&self) {
        info!(
            control_plane_url = self.control_plane_url.as_str(),
            control_plane_token = if self.control_plane_token.is_some() {
                "<set>"
            } else {
                "<none>"
            },
            gate_url = self.gate_url.as_str(),
            session_id = self.session_id.as_str(),
            target_domain = self.target_domain.as_str(),
            keywords = self.keywords.len(),
            locate_cache_ttl_ms = self.locate_cache_ttl_ms,
            settle_ms = self.settle_ms,
            max_recovery_rounds = self.max_recovery_rounds,
            skip_permit_on_target = self.skip_permit_on_target,
            "Config loaded"
        );
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn numeric_env<T: std::str::FromStr>(key: &str, default: T) -> T
where
    T::Err: std::fmt::Debug,
{
    match env::var(key) {
        Ok(v) => v
            .parse()
            .unwrap_or_else(|e| panic!("{key} must be a number: {e:?}")),
        Err(_) => default,
    }
}
