//! Scripted collaborators shared by the unit tests.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::providers::{
    ChangeRef, DeploymentProvider, ExecutionContext, ExecutionResult, Executor, HealthStatus,
    RubricRequest, RubricScorer, RubricScores, VerificationProvider, VerificationResult,
    WorkerError,
};
use crate::work_item::WorkItem;

/// What one scripted attempt does.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Cost(u64),
    Diff(String),
    Transient,
    Permanent,
    /// Never returns; trips the item timeout
    Hang,
    /// Waits for run cancellation
    WaitForCancel,
}

/// Executor that plays back a per-item script. Unscripted attempts succeed.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<String>>,
    default_cost: Option<u64>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_cost(mut self, cost: u64) -> Self {
        self.default_cost = Some(cost);
        self
    }

    pub fn script(self, item_id: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(item_id.to_string(), steps.into());
        self
    }

    /// Item ids in the order `execute` was entered.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, item_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == item_id)
            .count()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(
        &self,
        item: &WorkItem,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionResult, WorkerError> {
        self.calls.lock().unwrap().push(item.id.clone());
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&item.id)
            .and_then(|s| s.pop_front())
            .unwrap_or(Step::Succeed);

        let ok = |cost: Option<u64>| {
            let mut result = ExecutionResult::new(json!({"item": item.id, "attempt": ctx.attempt}));
            result.cost = cost;
            result
        };
        match step {
            Step::Succeed => Ok(ok(self.default_cost)),
            Step::Cost(cost) => Ok(ok(Some(cost))),
            Step::Diff(diff) => Ok(ok(self.default_cost).with_diff(diff)),
            Step::Transient => Err(WorkerError::Transient("connection reset".into())),
            Step::Permanent => Err(WorkerError::Permanent("invalid input".into())),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(ok(None))
            }
            Step::WaitForCancel => {
                ctx.cancelled().await;
                Err(WorkerError::Cancelled)
            }
        }
    }
}

/// Deployment provider that records every call.
pub struct FakeDeployment {
    pub health: Mutex<HashMap<String, HealthStatus>>,
    pub opened: Mutex<Vec<String>>,
    pub closed: Mutex<Vec<String>>,
    pub merged: Mutex<Vec<String>>,
    pub fail_close: bool,
}

impl FakeDeployment {
    pub fn new() -> Self {
        Self {
            health: Mutex::new(HashMap::new()),
            opened: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            merged: Mutex::new(Vec::new()),
            fail_close: false,
        }
    }

    pub fn set_health(&self, endpoint: &str, status: HealthStatus) {
        self.health
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), status);
    }
}

#[async_trait]
impl DeploymentProvider for FakeDeployment {
    async fn open_change(&self, diff: &str) -> anyhow::Result<ChangeRef> {
        let mut opened = self.opened.lock().unwrap();
        opened.push(diff.to_string());
        Ok(ChangeRef(format!("change-{}", opened.len())))
    }

    async fn get_preview_endpoint(&self, change: &ChangeRef) -> anyhow::Result<String> {
        Ok(format!("https://preview.test/{}", change))
    }

    async fn merge(&self, change: &ChangeRef) -> anyhow::Result<bool> {
        self.merged.lock().unwrap().push(change.0.clone());
        Ok(true)
    }

    async fn query_health(&self, endpoint: &str) -> anyhow::Result<HealthStatus> {
        Ok(self
            .health
            .lock()
            .unwrap()
            .get(endpoint)
            .copied()
            .unwrap_or(HealthStatus::Healthy))
    }

    async fn close_change(&self, change: &ChangeRef) -> anyhow::Result<()> {
        if self.fail_close {
            anyhow::bail!("cannot close {}", change);
        }
        self.closed.lock().unwrap().push(change.0.clone());
        Ok(())
    }
}

pub struct FakeVerifier {
    pub passed: bool,
    pub seen: Mutex<Vec<(String, Value)>>,
}

impl FakeVerifier {
    pub fn new(passed: bool) -> Self {
        Self {
            passed,
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl VerificationProvider for FakeVerifier {
    async fn verify(&self, endpoint: &str, scenario: &Value) -> anyhow::Result<VerificationResult> {
        self.seen
            .lock()
            .unwrap()
            .push((endpoint.to_string(), scenario.clone()));
        Ok(VerificationResult {
            passed: self.passed,
            details: "scripted".into(),
        })
    }
}

/// Scorer that hands out a queue of score sets, repeating the last one.
pub struct QueuedScorer {
    rounds: Mutex<VecDeque<RubricScores>>,
    last: Mutex<Option<RubricScores>>,
}

impl QueuedScorer {
    pub fn new(rounds: Vec<RubricScores>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            last: Mutex::new(None),
        }
    }
}

/// Score set for dimensions named `d0..dn`.
pub fn scores(values: &[f64], flagged: &[&str], notes: &str) -> RubricScores {
    RubricScores {
        scores: values
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("d{}", i), *v))
            .collect::<BTreeMap<_, _>>(),
        flagged_items: flagged.iter().map(|s| s.to_string()).collect(),
        notes: notes.to_string(),
    }
}

#[async_trait]
impl RubricScorer for QueuedScorer {
    async fn score(&self, _request: &RubricRequest<'_>) -> anyhow::Result<RubricScores> {
        let next = self.rounds.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(next) = next {
            *last = Some(next);
        }
        last.clone()
            .ok_or_else(|| anyhow::anyhow!("no scores scripted"))
    }
}
