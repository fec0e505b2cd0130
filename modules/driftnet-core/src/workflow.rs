//! Workflow executor — strictly sequential steps over a shared context.
//!
//! Each step names a registered block and declares a JSON input; `"$step"`
//! (or `"$step.field.path"`) strings in the input are resolved against prior
//! step outputs immediately before invocation. A failing step is recorded and
//! the loop continues: one bad step does not abort the batch, though later
//! steps may fail on missing context fields — an accepted, expected cascade.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::audit::{AuditLog, EventKind};

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Mutable key/value map threaded across ordered steps. Each step's output
/// is merged in under the step's name.
#[derive(Debug, Default)]
pub struct WorkflowContext {
    values: Map<String, Value>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Resolve `$name` indirections in a step input. Strings beginning with
    /// `$` are replaced by the referenced context entry; dotted paths descend
    /// into object fields. An unresolvable reference is an error — the step
    /// referencing it fails, the batch continues.
    pub fn resolve(&self, input: &Value) -> Result<Value> {
        match input {
            Value::String(s) if s.starts_with('$') => {
                let path = &s[1..];
                let mut parts = path.split('.');
                let root = parts.next().unwrap_or_default();
                let mut current = self
                    .values
                    .get(root)
                    .ok_or_else(|| anyhow::anyhow!("context reference ${root} not found"))?;
                for part in parts {
                    current = current.get(part).ok_or_else(|| {
                        anyhow::anyhow!("context reference ${path}: field '{part}' not found")
                    })?;
                }
                Ok(current.clone())
            }
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve(v)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => items.iter().map(|v| self.resolve(v)).collect(),
            other => Ok(other.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Blocks and steps
// ---------------------------------------------------------------------------

/// A unit of executable behavior registered under a name. Blocks own their
/// dependencies; the executor knows nothing of retry/locate/permit semantics.
#[async_trait]
pub trait Block: Send + Sync {
    async fn call(&self, input: Value) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: String,
    pub block: String,
    pub input: Value,
}

impl StepSpec {
    pub fn new(name: &str, block: &str, input: Value) -> Self {
        Self {
            name: name.to_string(),
            block: block.to_string(),
            input,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub step: String,
    pub output: Value,
}

#[derive(Debug, Clone)]
pub struct StepError {
    pub step: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct RunOutcome {
    pub results: Vec<StepResult>,
    pub errors: Vec<StepError>,
    pub success: bool,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct WorkflowExecutor {
    session_id: String,
    audit: Arc<AuditLog>,
    registry: HashMap<String, Arc<dyn Block>>,
}

impl WorkflowExecutor {
    pub fn new(session_id: &str, audit: Arc<AuditLog>) -> Self {
        Self {
            session_id: session_id.to_string(),
            audit,
            registry: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, block: Arc<dyn Block>) {
        self.registry.insert(name.to_string(), block);
    }

    /// Execute steps in declared order. Errors are aggregated, never halting
    /// the batch; `success` is true only when every step succeeded.
    pub async fn run(&self, steps: &[StepSpec]) -> RunOutcome {
        let mut context = WorkflowContext::new();
        let mut outcome = RunOutcome::default();

        for step in steps {
            let started = Instant::now();
            self.audit.log(EventKind::StepStarted {
                step: step.name.clone(),
            });
            info!(
                session_id = self.session_id.as_str(),
                step = step.name.as_str(),
                block = step.block.as_str(),
                "Step starting"
            );

            let result = match self.registry.get(&step.block) {
                None => Err(anyhow::anyhow!("block '{}' is not registered", step.block)),
                Some(block) => match context.resolve(&step.input) {
                    Err(e) => Err(e),
                    Ok(input) => block.call(input).await,
                },
            };

            match result {
                Ok(output) => {
                    self.audit.log(EventKind::StepCompleted {
                        step: step.name.clone(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    info!(
                        session_id = self.session_id.as_str(),
                        step = step.name.as_str(),
                        "Step complete"
                    );
                    context.insert(&step.name, output.clone());
                    outcome.results.push(StepResult {
                        step: step.name.clone(),
                        output,
                    });
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    self.audit.log(EventKind::StepFailed {
                        step: step.name.clone(),
                        error: message.clone(),
                    });
                    error!(
                        session_id = self.session_id.as_str(),
                        step = step.name.as_str(),
                        error = message.as_str(),
                        "Step failed, continuing batch"
                    );
                    outcome.errors.push(StepError {
                        step: step.name.clone(),
                        error: message,
                    });
                }
            }
        }

        outcome.success = outcome.errors.is_empty();
        outcome
    }
}
