use serde::{Deserialize, Serialize};

// --- Container tree ---

/// One node of a container-match snapshot. Containers are logical,
/// identifier-addressed page regions resolved server-side from selectors.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContainerNode {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "defId", default)]
    pub def_id: Option<String>,
    #[serde(default)]
    pub rect: Option<Rect>,
    #[serde(default)]
    pub children: Vec<ContainerNode>,
}

/// Bounding rectangle reported by the container runtime.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    /// A degenerate rect (zero area) is not positive evidence of presence.
    pub fn is_degenerate(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }
}

/// Cache provenance reported alongside a `containers:match` snapshot.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheMeta {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub hit: bool,
    #[serde(rename = "ageMs", default)]
    pub age_ms: u64,
    #[serde(rename = "ttlMs", default)]
    pub ttl_ms: u64,
}

/// Result of a `containers:match` call: the current page URL, the matched
/// container tree, and cache provenance for observability.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerSnapshot {
    #[serde(rename = "currentUrl", default)]
    pub current_url: String,
    #[serde(default)]
    pub containers: Vec<ContainerNode>,
    #[serde(default)]
    pub cache: CacheMeta,
}

/// Query parameters for `containers:match`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
pub struct MatchQuery {
    #[serde(rename = "maxDepth")]
    pub max_depth: u32,
    #[serde(rename = "maxChildren")]
    pub max_children: u32,
    #[serde(rename = "rootSelector", skip_serializing_if = "Option::is_none")]
    pub root_selector: Option<String>,
}

impl Default for MatchQuery {
    fn default() -> Self {
        Self {
            max_depth: 6,
            max_children: 50,
            root_selector: None,
        }
    }
}

// --- Container operations ---

/// Operation kinds accepted by `container:operation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerOp {
    Click,
    Highlight,
    Scroll,
    Extract,
}

impl ContainerOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerOp::Click => "click",
            ContainerOp::Highlight => "highlight",
            ContainerOp::Scroll => "scroll",
            ContainerOp::Extract => "extract",
        }
    }
}

/// Reference to a screenshot captured by the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct ScreenshotRef {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl ScreenshotRef {
    pub fn reference(&self) -> Option<&str> {
        self.path.as_deref().or(self.url.as_deref())
    }
}
