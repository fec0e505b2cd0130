use serde::{Deserialize, Serialize};

/// Request body for `POST /permit`.
#[derive(Debug, Clone, Serialize)]
pub struct PermitRequest {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(rename = "windowMs")]
    pub window_ms: u64,
    #[serde(rename = "maxCount")]
    pub max_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev: Option<bool>,
    #[serde(rename = "devTag", skip_serializing_if = "Option::is_none")]
    pub dev_tag: Option<String>,
}

impl PermitRequest {
    pub fn new(key: &str, window_ms: u64, max_count: u32) -> Self {
        Self {
            key: key.to_string(),
            keyword: None,
            window_ms,
            max_count,
            dev: None,
            dev_tag: None,
        }
    }

    pub fn with_keyword(mut self, keyword: &str) -> Self {
        self.keyword = Some(keyword.to_string());
        self
    }
}

/// Structured denial detail from the gate.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DenyInfo {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "retryAfterMs", default)]
    pub retry_after_ms: Option<u64>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    #[serde(rename = "suggestedActions", default)]
    pub suggested_actions: Vec<String>,
}

/// Gate decision for one permit request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PermitDecision {
    #[serde(default)]
    pub allowed: bool,
    #[serde(rename = "waitMs", default)]
    pub wait_ms: u64,
    #[serde(rename = "retryAfterMs", default)]
    pub retry_after_ms: Option<u64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub keyword: Option<String>,
    #[serde(default)]
    pub consecutive: Option<u32>,
    #[serde(default)]
    pub deny: Option<DenyInfo>,
}

impl PermitDecision {
    /// The sleep the server mandates before the next request, if any.
    /// The server is the quota authority, so this is taken verbatim.
    pub fn mandated_wait_ms(&self) -> u64 {
        self.deny
            .as_ref()
            .and_then(|d| d.retry_after_ms)
            .or(self.retry_after_ms)
            .unwrap_or(self.wait_ms)
    }
}

/// Outcome of a successful `wait_for_permit` loop.
#[derive(Debug, Clone)]
pub struct PermitGrant {
    pub waited_ms: u64,
    pub decision: PermitDecision,
}
