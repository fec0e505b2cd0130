// Trait abstractions over the external collaborators.
//
// ControlPlane wraps the remote-browser command protocol; NoteSink is the
// persistence seam (Markdown/image formatting lives outside this core).
// These enable deterministic testing with MockControlPlane and MemorySink:
// no network, no browser. `cargo test` in seconds.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use controlplane_client::{ContainerOp, ContainerSnapshot, MatchQuery, ScreenshotRef};

// ---------------------------------------------------------------------------
// ControlPlane — replaces direct ControlPlaneClient use
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Execute a script in the page context (`browser:execute`).
    async fn execute_script(&self, session_id: &str, script: &str) -> Result<Value>;

    /// Capture a diagnostic screenshot reference (`browser:screenshot`).
    async fn screenshot(&self, session_id: &str) -> Result<ScreenshotRef>;

    /// Dispatch a simulated keypress (`keyboard:press`).
    async fn press_key(&self, session_id: &str, key: &str) -> Result<()>;

    /// Run one operation against a named container (`container:operation`).
    async fn container_operation(
        &self,
        session_id: &str,
        container_id: &str,
        op: ContainerOp,
    ) -> Result<Value>;

    /// Fetch a container-match snapshot (`containers:match`).
    async fn match_containers(
        &self,
        session_id: &str,
        query: &MatchQuery,
    ) -> Result<ContainerSnapshot>;
}

#[async_trait]
impl ControlPlane for controlplane_client::ControlPlaneClient {
    async fn execute_script(&self, session_id: &str, script: &str) -> Result<Value> {
        Ok(self.execute_script(session_id, script).await?)
    }

    async fn screenshot(&self, session_id: &str) -> Result<ScreenshotRef> {
        Ok(self.screenshot(session_id).await?)
    }

    async fn press_key(&self, session_id: &str, key: &str) -> Result<()> {
        Ok(self.press_key(session_id, key).await?)
    }

    async fn container_operation(
        &self,
        session_id: &str,
        container_id: &str,
        op: ContainerOp,
    ) -> Result<Value> {
        Ok(self.container_operation(session_id, container_id, op).await?)
    }

    async fn match_containers(
        &self,
        session_id: &str,
        query: &MatchQuery,
    ) -> Result<ContainerSnapshot> {
        Ok(self.match_containers(session_id, query).await?)
    }
}

// ---------------------------------------------------------------------------
// NoteSink — persistence seam
// ---------------------------------------------------------------------------

/// One comment attached to a harvested note.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Comment {
    #[serde(default)]
    pub author: Option<String>,
    pub content: String,
}

/// A fully collected unit of work, handed to the sink for persistence.
/// `comments_partial` flags degraded collection so downstream consumers can
/// record the gap instead of presenting the data as complete.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestedNote {
    pub note_id: String,
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub comments_partial: bool,
    #[serde(default)]
    pub source_url: Option<String>,
}

#[async_trait]
pub trait NoteSink: Send + Sync {
    async fn persist(&self, note: &HarvestedNote) -> Result<()>;
}
