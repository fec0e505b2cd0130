// Test mocks for the orchestration layer.
//
// Three mocks matching the trait boundaries:
// - MockControlPlane (ControlPlane) — scripted snapshots/script results,
//   records key presses and container operations
// - MockGate (PermitSource) — queued decisions, counts requests
// - MemorySink (NoteSink) — stateful in-memory persistence
//
// Plus helpers for constructing containers, snapshots, and HarvestDeps.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;

use controlplane_client::{
    CacheMeta, ContainerNode, ContainerOp, ContainerSnapshot, MatchQuery, Rect, ScreenshotRef,
};
use permit_client::{PermitDecision, PermitRequest, PermitSource, RepeatGuard};

use crate::audit::AuditLog;
use crate::locator::Locator;
use crate::progress::ProgressTracker;
use crate::recovery::OverlayRecovery;
use crate::steps::{HarvestDeps, HarvestSettings, HarvestState};
use crate::traits::{ControlPlane, HarvestedNote, NoteSink};

/// Target domain used by test deps; snapshots on other hosts are offsite.
pub const TEST_DOMAIN: &str = "notes.example";
pub const TEST_SESSION: &str = "sess-test";

// ---------------------------------------------------------------------------
// Snapshot helpers
// ---------------------------------------------------------------------------

pub fn container(id: &str) -> ContainerNode {
    ContainerNode {
        id: id.to_string(),
        def_id: None,
        rect: None,
        children: Vec::new(),
    }
}

pub fn anchored(id: &str) -> ContainerNode {
    ContainerNode {
        rect: Some(Rect {
            x: 0.0,
            y: 0.0,
            width: 800.0,
            height: 600.0,
        }),
        ..container(id)
    }
}

pub fn with_children(mut node: ContainerNode, children: Vec<ContainerNode>) -> ContainerNode {
    node.children = children;
    node
}

pub fn snapshot(url: &str, containers: Vec<ContainerNode>) -> ContainerSnapshot {
    ContainerSnapshot {
        current_url: url.to_string(),
        containers,
        cache: CacheMeta::default(),
    }
}

// ---------------------------------------------------------------------------
// MockControlPlane
// ---------------------------------------------------------------------------

/// Scripted control plane. Snapshot and script-result queues pop per call;
/// the final entry repeats so steady states don't need padding. Unregistered
/// extract targets return an empty array; `fail_container` injects errors.
#[derive(Default)]
pub struct MockControlPlane {
    snapshots: Mutex<VecDeque<ContainerSnapshot>>,
    script_results: Mutex<VecDeque<Value>>,
    extracts: Mutex<HashMap<String, Value>>,
    fail_containers: Mutex<HashMap<String, String>>,
    pub presses: Mutex<Vec<String>>,
    pub operations: Mutex<Vec<(String, String)>>,
    pub match_calls: AtomicU32,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_snapshot(self, snap: ContainerSnapshot) -> Self {
        self.snapshots.lock().unwrap().push_back(snap);
        self
    }

    pub fn on_script(self, value: Value) -> Self {
        self.script_results.lock().unwrap().push_back(value);
        self
    }

    pub fn on_extract(self, container_id: &str, value: Value) -> Self {
        self.extracts
            .lock()
            .unwrap()
            .insert(container_id.to_string(), value);
        self
    }

    pub fn fail_container(self, container_id: &str, message: &str) -> Self {
        self.fail_containers
            .lock()
            .unwrap()
            .insert(container_id.to_string(), message.to_string());
        self
    }

    pub fn press_count(&self) -> usize {
        self.presses.lock().unwrap().len()
    }

    pub fn ops_for(&self, container_id: &str) -> Vec<String> {
        self.operations
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == container_id)
            .map(|(_, op)| op.clone())
            .collect()
    }

    fn next_from<T: Clone>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
        let mut q = queue.lock().unwrap();
        match q.len() {
            0 => None,
            1 => q.front().cloned(),
            _ => q.pop_front(),
        }
    }
}

#[async_trait]
impl ControlPlane for MockControlPlane {
    async fn execute_script(&self, _session_id: &str, _script: &str) -> Result<Value> {
        Ok(Self::next_from(&self.script_results).unwrap_or(Value::Null))
    }

    async fn screenshot(&self, _session_id: &str) -> Result<ScreenshotRef> {
        Ok(ScreenshotRef {
            path: Some("/tmp/driftnet-shot.png".to_string()),
            url: None,
        })
    }

    async fn press_key(&self, _session_id: &str, key: &str) -> Result<()> {
        self.presses.lock().unwrap().push(key.to_string());
        Ok(())
    }

    async fn container_operation(
        &self,
        _session_id: &str,
        container_id: &str,
        op: ContainerOp,
    ) -> Result<Value> {
        if let Some(msg) = self.fail_containers.lock().unwrap().get(container_id) {
            bail!("{msg}");
        }
        self.operations
            .lock()
            .unwrap()
            .push((container_id.to_string(), op.as_str().to_string()));
        if op == ContainerOp::Extract {
            return Ok(self
                .extracts
                .lock()
                .unwrap()
                .get(container_id)
                .cloned()
                .unwrap_or_else(|| Value::Array(Vec::new())));
        }
        Ok(serde_json::json!({ "ok": true }))
    }

    async fn match_containers(
        &self,
        _session_id: &str,
        _query: &MatchQuery,
    ) -> Result<ContainerSnapshot> {
        self.match_calls.fetch_add(1, Ordering::SeqCst);
        match Self::next_from(&self.snapshots) {
            Some(snap) => Ok(snap),
            None => bail!("no snapshot scripted"),
        }
    }
}

// ---------------------------------------------------------------------------
// MockGate
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockGate {
    decisions: Mutex<VecDeque<PermitDecision>>,
    pub requests: AtomicU32,
}

impl MockGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_decision(self, decision: PermitDecision) -> Self {
        self.decisions.lock().unwrap().push_back(decision);
        self
    }

    pub fn allowing() -> Self {
        Self::new().on_decision(PermitDecision {
            allowed: true,
            ..Default::default()
        })
    }

    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermitSource for MockGate {
    async fn request_permit(
        &self,
        _req: &PermitRequest,
    ) -> permit_client::Result<PermitDecision> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let mut q = self.decisions.lock().unwrap();
        let decision = match q.len() {
            0 => PermitDecision {
                allowed: true,
                ..Default::default()
            },
            1 => q.front().cloned().unwrap(),
            _ => q.pop_front().unwrap(),
        };
        Ok(decision)
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySink {
    pub notes: Mutex<Vec<HarvestedNote>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.notes.lock().unwrap().len()
    }
}

#[async_trait]
impl NoteSink for MemorySink {
    async fn persist(&self, note: &HarvestedNote) -> Result<()> {
        self.notes.lock().unwrap().push(note.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Deps assembly
// ---------------------------------------------------------------------------

pub fn test_audit() -> Arc<AuditLog> {
    Arc::new(AuditLog::new(
        TEST_SESSION.to_string(),
        "run-test".to_string(),
    ))
}

/// Build HarvestDeps over mocks, checkpointing under `data_dir`.
pub fn make_deps(
    plane: Arc<MockControlPlane>,
    gate: Arc<MockGate>,
    sink: Arc<MemorySink>,
    data_dir: &Path,
    settings: HarvestSettings,
) -> Arc<HarvestDeps> {
    let audit = test_audit();
    let locator = Arc::new(Locator::new(
        plane.clone(),
        audit.clone(),
        TEST_DOMAIN,
        Duration::from_millis(5000),
    ));
    let recovery = Arc::new(OverlayRecovery::new(
        plane.clone(),
        audit.clone(),
        Duration::from_millis(1),
        3,
    ));
    let tracker = Arc::new(ProgressTracker::for_session(data_dir, TEST_SESSION));
    let state = HarvestState::resume_or_new(&tracker, TEST_SESSION)
        .expect("fresh state from empty dir");

    Arc::new(HarvestDeps {
        session_id: TEST_SESSION.to_string(),
        plane,
        gate,
        locator,
        recovery,
        tracker,
        repeat_guard: Arc::new(RepeatGuard::new()),
        audit,
        sink,
        state: Arc::new(Mutex::new(state)),
        settings,
    })
}
