pub mod error;
pub mod types;

pub use error::{ControlPlaneError, Result};
pub use types::{
    CacheMeta, ContainerNode, ContainerOp, ContainerSnapshot, MatchQuery, Rect, ScreenshotRef,
};

use std::time::Duration;

use serde_json::{json, Value};

/// HTTP client for the remote-browser control plane.
///
/// Every action goes through one `POST {base}/command` endpoint carrying
/// `{action, payload}`; responses arrive wrapped in one of several envelope
/// shapes which `unwrap_envelope` normalizes at a single call site.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        }
    }

    /// Send one `{action, payload}` command and return the unwrapped result.
    pub async fn dispatch(&self, action: &str, payload: Value) -> Result<Value> {
        let mut endpoint = format!("{}/command", self.base_url);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={token}"));
        }

        let body = json!({ "action": action, "payload": payload });

        let resp = self
            .client
            .post(&endpoint)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ControlPlaneError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let raw: Value = resp.json().await?;
        unwrap_envelope(raw)
    }

    /// Execute a script in the page context via `browser:execute`.
    pub async fn execute_script(&self, session_id: &str, script: &str) -> Result<Value> {
        tracing::debug!(session_id, bytes = script.len(), "browser:execute");
        self.dispatch(
            "browser:execute",
            json!({ "sessionId": session_id, "script": script }),
        )
        .await
    }

    /// Capture a screenshot via `browser:screenshot`. Returns a reference
    /// (path or URL) suitable for diagnostics, not the image bytes.
    pub async fn screenshot(&self, session_id: &str) -> Result<ScreenshotRef> {
        let value = self
            .dispatch("browser:screenshot", json!({ "sessionId": session_id }))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Dispatch a simulated keypress via `keyboard:press`.
    pub async fn press_key(&self, session_id: &str, key: &str) -> Result<()> {
        tracing::debug!(session_id, key, "keyboard:press");
        self.dispatch(
            "keyboard:press",
            json!({ "sessionId": session_id, "key": key }),
        )
        .await?;
        Ok(())
    }

    /// Run a single operation against a named container via `container:operation`.
    pub async fn container_operation(
        &self,
        session_id: &str,
        container_id: &str,
        op: ContainerOp,
    ) -> Result<Value> {
        tracing::debug!(session_id, container_id, op = op.as_str(), "container:operation");
        self.dispatch(
            "container:operation",
            json!({
                "sessionId": session_id,
                "containerId": container_id,
                "operation": op.as_str(),
            }),
        )
        .await
    }

    /// Fetch a container-match snapshot via `containers:match`.
    pub async fn match_containers(
        &self,
        session_id: &str,
        query: &MatchQuery,
    ) -> Result<ContainerSnapshot> {
        let value = self
            .dispatch(
                "containers:match",
                json!({
                    "sessionId": session_id,
                    "maxDepth": query.max_depth,
                    "maxChildren": query.max_children,
                    "rootSelector": query.root_selector,
                }),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Unwrap the control plane's nested response envelope.
///
/// Historically the server has answered with `{result}`, `{data: {result}}`,
/// or `{data}` depending on the action; this is the one place that knowledge
/// lives. An explicit `{error}` field takes priority over any payload.
pub fn unwrap_envelope(raw: Value) -> Result<Value> {
    if let Some(err) = raw.get("error") {
        let message = err
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| err.to_string());
        return Err(ControlPlaneError::Envelope(message));
    }

    if let Some(result) = raw.get("result") {
        return Ok(result.clone());
    }
    if let Some(data) = raw.get("data") {
        if let Some(result) = data.get("result") {
            return Ok(result.clone());
        }
        return Ok(data.clone());
    }

    // Bare payloads (no envelope) pass through untouched.
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_prefers_top_level_result() {
        let v = unwrap_envelope(json!({"result": {"ok": true}, "data": {"ignored": 1}})).unwrap();
        assert_eq!(v, json!({"ok": true}));
    }

    #[test]
    fn envelope_falls_back_to_data_result_then_data() {
        let v = unwrap_envelope(json!({"data": {"result": [1, 2]}})).unwrap();
        assert_eq!(v, json!([1, 2]));

        let v = unwrap_envelope(json!({"data": {"containers": []}})).unwrap();
        assert_eq!(v, json!({"containers": []}));
    }

    #[test]
    fn envelope_passes_bare_payload_through() {
        let v = unwrap_envelope(json!({"currentUrl": "https://x.test"})).unwrap();
        assert_eq!(v["currentUrl"], "https://x.test");
    }

    #[test]
    fn envelope_error_field_wins() {
        let err = unwrap_envelope(json!({"error": "session closed", "result": 1})).unwrap_err();
        assert!(matches!(err, ControlPlaneError::Envelope(m) if m == "session closed"));
    }

    #[test]
    fn snapshot_deserializes_with_cache_meta() {
        let v = json!({
            "currentUrl": "https://example.com/search?q=a",
            "containers": [
                {"id": "search-result-list", "rect": {"x": 0.0, "y": 80.0, "width": 1200.0, "height": 900.0}, "children": [
                    {"id": "note-card-1", "defId": "note-card"}
                ]}
            ],
            "cache": {"enabled": true, "hit": true, "ageMs": 1200, "ttlMs": 5000}
        });
        let snap: ContainerSnapshot = serde_json::from_value(v).unwrap();
        assert!(snap.cache.hit);
        assert_eq!(snap.containers[0].children[0].def_id.as_deref(), Some("note-card"));
        assert!(!snap.containers[0].rect.unwrap().is_degenerate());
    }
}
