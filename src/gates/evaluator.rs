use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Check, CheckSpec, DimensionScore, GateDefinition, GateResult, RubricDimension};
use crate::errors::EngineError;
use crate::phase::{Phase, StopCondition};
use crate::providers::{
    ChangeRef, DeploymentProvider, RubricRequest, RubricScorer, VerificationProvider,
};
use crate::shell::{ShellSettings, command_check};
use crate::work_item::{WorkItem, WorkItemStatus, effective_items};

/// Evaluates phase gates against the store's view of the phase's items.
///
/// Checks go back to the providers every time. An executor's report of its
/// own success only counts through the work item status it produced.
#[derive(Clone, Default)]
pub struct GateEvaluator {
    deployment: Option<Arc<dyn DeploymentProvider>>,
    verifier: Option<Arc<dyn VerificationProvider>>,
    scorer: Option<Arc<dyn RubricScorer>>,
    shell: ShellSettings,
}

/// Outcome of one deterministic check.
struct CheckOutcome {
    passed: bool,
    note: Option<String>,
    flagged: Vec<String>,
}

impl CheckOutcome {
    fn pass() -> Self {
        Self {
            passed: true,
            note: None,
            flagged: Vec::new(),
        }
    }

    fn fail(note: impl Into<String>) -> Self {
        Self {
            passed: false,
            note: Some(note.into()),
            flagged: Vec::new(),
        }
    }

    fn flagging(mut self, flagged: Vec<String>) -> Self {
        self.flagged = flagged;
        self
    }
}

impl GateEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deployment(mut self, deployment: Option<Arc<dyn DeploymentProvider>>) -> Self {
        self.deployment = deployment;
        self
    }

    pub fn with_verifier(mut self, verifier: Option<Arc<dyn VerificationProvider>>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_scorer(mut self, scorer: Option<Arc<dyn RubricScorer>>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_shell(mut self, shell: ShellSettings) -> Self {
        self.shell = shell;
        self
    }

    /// Evaluate `gate` for one attempt of `phase` over its items.
    ///
    /// Superseded items are ignored; a revision stands in for the item it revises.
    pub async fn evaluate(
        &self,
        phase: &Phase,
        gate_id: &str,
        gate: &GateDefinition,
        items: &[WorkItem],
        attempt: u32,
    ) -> Result<GateResult, EngineError> {
        let items = effective_items(items);
        if items.is_empty() {
            debug!(phase = %phase.id, gate = gate_id, "gate sees no work items");
            return Ok(GateResult::empty(
                gate_id,
                &phase.id,
                attempt,
                phase.empty_is_success,
            ));
        }

        let mut result = match gate {
            GateDefinition::Deterministic { checks } => {
                self.evaluate_checks(phase, gate_id, checks, &items, attempt)
                    .await
            }
            GateDefinition::Rubric {
                dimensions,
                threshold,
                scorer,
            } => {
                self.evaluate_rubric(
                    phase,
                    gate_id,
                    dimensions,
                    *threshold,
                    scorer.as_deref(),
                    &items,
                    attempt,
                )
                .await
            }
        };
        result.veto(exhausted_items(phase, &items));

        info!(
            phase = %phase.id,
            gate = gate_id,
            attempt,
            total = result.total,
            threshold = result.threshold,
            passed = result.passed,
            "gate evaluated"
        );
        Ok(result)
    }

    async fn evaluate_checks(
        &self,
        phase: &Phase,
        gate_id: &str,
        checks: &[CheckSpec],
        items: &[WorkItem],
        attempt: u32,
    ) -> GateResult {
        let mut outcomes = Vec::with_capacity(checks.len());
        let mut notes = Vec::new();
        let mut flagged: Vec<String> = Vec::new();

        for spec in checks {
            let outcome = self.run_check(&spec.check, items).await;
            if !outcome.passed {
                warn!(phase = %phase.id, check = %spec.name, "gate check failed");
            }
            if let Some(note) = outcome.note {
                notes.push(format!("{}: {}", spec.name, note));
            }
            for id in outcome.flagged {
                if !flagged.contains(&id) {
                    flagged.push(id);
                }
            }
            outcomes.push((spec.name.clone(), outcome.passed));
        }

        GateResult::deterministic(
            gate_id,
            &phase.id,
            attempt,
            outcomes,
            notes.join("; "),
            flagged,
        )
    }

    async fn run_check(&self, check: &Check, items: &[WorkItem]) -> CheckOutcome {
        match check {
            Check::AllItemsSucceeded => {
                let unfinished: Vec<String> = items
                    .iter()
                    .filter(|i| i.status != WorkItemStatus::Succeeded)
                    .map(|i| i.id.clone())
                    .collect();
                if unfinished.is_empty() {
                    CheckOutcome::pass()
                } else {
                    CheckOutcome::fail(format!("not succeeded: {}", unfinished.join(", ")))
                        .flagging(unfinished)
                }
            }
            Check::Command { command } => match command_check(command, &self.shell).await {
                (true, _) => CheckOutcome::pass(),
                (false, note) => CheckOutcome::fail(note.unwrap_or_default()),
            },
            Check::Health { endpoint } => {
                let Some(provider) = &self.deployment else {
                    return CheckOutcome::fail("no deployment provider configured");
                };
                match provider.query_health(endpoint).await {
                    Ok(status) if status.is_healthy() => CheckOutcome::pass(),
                    Ok(status) => CheckOutcome::fail(format!("{} is {:?}", endpoint, status)),
                    Err(e) => CheckOutcome::fail(format!("{} health query failed: {:#}", endpoint, e)),
                }
            }
            Check::PreviewHealth => self.preview_health(items).await,
            Check::Verify { endpoint, scenario } => {
                let Some(verifier) = &self.verifier else {
                    return CheckOutcome::fail("no verification provider configured");
                };
                match verifier.verify(endpoint, scenario).await {
                    Ok(result) if result.passed => CheckOutcome::pass(),
                    Ok(result) => CheckOutcome::fail(result.details),
                    Err(e) => CheckOutcome::fail(format!("verification did not run: {:#}", e)),
                }
            }
        }
    }

    async fn preview_health(&self, items: &[WorkItem]) -> CheckOutcome {
        let with_changes: Vec<&WorkItem> = items.iter().filter(|i| i.change_ref.is_some()).collect();
        if with_changes.is_empty() {
            return CheckOutcome::pass();
        }
        let Some(provider) = &self.deployment else {
            return CheckOutcome::fail("no deployment provider configured");
        };

        let mut failures = Vec::new();
        let mut flagged = Vec::new();
        for item in with_changes {
            let Some(change) = item.change_ref.clone().map(ChangeRef) else {
                continue;
            };
            let verdict = match provider.get_preview_endpoint(&change).await {
                Ok(endpoint) => match provider.query_health(&endpoint).await {
                    Ok(status) if status.is_healthy() => None,
                    Ok(status) => Some(format!("{} preview {:?}", item.id, status)),
                    Err(e) => Some(format!("{} preview unreachable: {:#}", item.id, e)),
                },
                Err(e) => Some(format!("{} has no preview: {:#}", item.id, e)),
            };
            if let Some(failure) = verdict {
                failures.push(failure);
                flagged.push(item.id.clone());
            }
        }

        if failures.is_empty() {
            CheckOutcome::pass()
        } else {
            CheckOutcome::fail(failures.join(", ")).flagging(flagged)
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn evaluate_rubric(
        &self,
        phase: &Phase,
        gate_id: &str,
        dimensions: &[RubricDimension],
        threshold: f64,
        scorer_command: Option<&str>,
        items: &[WorkItem],
        attempt: u32,
    ) -> GateResult {
        let unscored = |note: String| {
            let zeroed = dimensions
                .iter()
                .map(|d| DimensionScore {
                    dimension: d.name.clone(),
                    score: 0.0,
                    weight: d.weight,
                })
                .collect();
            GateResult::scored(gate_id, &phase.id, attempt, zeroed, threshold, note, Vec::new())
        };

        let Some(scorer) = &self.scorer else {
            return unscored("no rubric scorer configured".to_string());
        };
        let request = RubricRequest {
            phase,
            gate_id,
            dimensions,
            items,
            scorer: scorer_command,
        };
        let raw = match scorer.score(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(phase = %phase.id, gate = gate_id, error = %e, "rubric scorer failed");
                return unscored(format!("scorer failed: {:#}", e));
            }
        };

        let mut notes = vec![raw.notes.clone()];
        let scores: Vec<DimensionScore> = dimensions
            .iter()
            .map(|d| {
                let score = raw.scores.get(&d.name).copied().unwrap_or_else(|| {
                    notes.push(format!("no score for '{}'", d.name));
                    0.0
                });
                DimensionScore {
                    dimension: d.name.clone(),
                    score,
                    weight: d.weight,
                }
            })
            .collect();

        // Only items the phase actually holds can be narrowed to on retry.
        let flagged = raw
            .flagged_items
            .into_iter()
            .filter(|id| items.iter().any(|i| &i.id == id))
            .collect();

        let notes = notes
            .into_iter()
            .filter(|n| !n.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
        GateResult::scored(gate_id, &phase.id, attempt, scores, threshold, notes, flagged)
    }
}

/// Failed and blocked items count against every gate strategy.
///
/// A phase that stopped once its success quota was met is exempt; items it
/// never settled are not failures either.
fn exhausted_items(phase: &Phase, items: &[WorkItem]) -> Vec<String> {
    if matches!(phase.stop_condition, StopCondition::MinSucceeded { .. })
        && phase.stop_condition.is_met(items)
    {
        return Vec::new();
    }
    items
        .iter()
        .filter(|i| matches!(i.status, WorkItemStatus::Failed | WorkItemStatus::Blocked))
        .map(|i| i.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::HealthStatus;
    use crate::testing::{FakeDeployment, FakeVerifier, QueuedScorer, scores};
    use serde_json::json;

    fn item(id: &str, status: WorkItemStatus) -> WorkItem {
        let mut item = WorkItem::new(id, "build", "task", json!({}), 0, 0, 2);
        item.status = status;
        item
    }

    fn rubric() -> GateDefinition {
        GateDefinition::Rubric {
            dimensions: (0..5).map(|i| RubricDimension::new(&format!("d{}", i))).collect(),
            threshold: 18.0,
            scorer: None,
        }
    }

    fn phase() -> Phase {
        Phase::new("build", "Build", 0)
    }

    #[tokio::test]
    async fn test_rubric_passes_above_threshold() {
        let evaluator = GateEvaluator::new().with_scorer(Some(Arc::new(QueuedScorer::new(vec![
            scores(&[4.0, 4.0, 3.0, 4.0, 4.0], &[], "solid"),
        ]))));
        let items = vec![item("a", WorkItemStatus::Succeeded)];
        let result = evaluator
            .evaluate(&phase(), "review", &rubric(), &items, 0)
            .await
            .unwrap();
        assert_eq!(result.total, 19.0);
        assert!(result.passed);
        assert_eq!(result.notes, "solid");
    }

    #[tokio::test]
    async fn test_rubric_failure_keeps_flagged_items() {
        let evaluator = GateEvaluator::new().with_scorer(Some(Arc::new(QueuedScorer::new(vec![
            scores(&[3.0; 5], &["b", "ghost"], "b is unclear"),
        ]))));
        let items = vec![
            item("a", WorkItemStatus::Succeeded),
            item("b", WorkItemStatus::Succeeded),
        ];
        let result = evaluator
            .evaluate(&phase(), "review", &rubric(), &items, 1)
            .await
            .unwrap();
        assert_eq!(result.total, 15.0);
        assert!(!result.passed);
        assert_eq!(result.flagged_items, vec!["b"]);
        assert_eq!(result.attempt, 1);
    }

    #[tokio::test]
    async fn test_rubric_missing_dimension_scores_zero() {
        let evaluator = GateEvaluator::new().with_scorer(Some(Arc::new(QueuedScorer::new(vec![
            scores(&[5.0, 5.0, 5.0, 5.0], &[], ""),
        ]))));
        let items = vec![item("a", WorkItemStatus::Succeeded)];
        let result = evaluator
            .evaluate(&phase(), "review", &rubric(), &items, 0)
            .await
            .unwrap();
        assert_eq!(result.total, 20.0);
        assert_eq!(result.dimension_scores[4].score, 0.0);
        assert!(result.notes.contains("no score for 'd4'"));
    }

    #[tokio::test]
    async fn test_rubric_without_scorer_fails() {
        let items = vec![item("a", WorkItemStatus::Succeeded)];
        let result = GateEvaluator::new()
            .evaluate(&phase(), "review", &rubric(), &items, 0)
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.total, 0.0);
    }

    #[tokio::test]
    async fn test_default_gate_flags_unfinished_items() {
        let items = vec![
            item("a", WorkItemStatus::Succeeded),
            item("b", WorkItemStatus::Blocked),
        ];
        let result = GateEvaluator::new()
            .evaluate(
                &phase(),
                "all_items_succeeded",
                &GateDefinition::default_gate(),
                &items,
                0,
            )
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.total, 0.0);
        assert_eq!(result.flagged_items, vec!["b"]);
    }

    #[tokio::test]
    async fn test_blocked_items_fail_any_gate() {
        let evaluator = GateEvaluator::new().with_scorer(Some(Arc::new(QueuedScorer::new(vec![
            scores(&[4.0, 4.0, 3.0, 4.0, 4.0], &[], "solid"),
        ]))));
        let items = vec![
            item("a", WorkItemStatus::Succeeded),
            item("b", WorkItemStatus::Blocked),
        ];
        let result = evaluator
            .evaluate(&phase(), "review", &rubric(), &items, 0)
            .await
            .unwrap();
        assert_eq!(result.total, 19.0);
        assert!(!result.passed);
        assert_eq!(result.flagged_items, vec!["b"]);

        let empty_checks = GateDefinition::Deterministic { checks: vec![] };
        let result = GateEvaluator::new()
            .evaluate(&phase(), "ci", &empty_checks, &items, 0)
            .await
            .unwrap();
        assert!(!result.passed);
        assert!(result.notes.contains("not succeeded: b"));
    }

    #[tokio::test]
    async fn test_met_quota_tolerates_failures() {
        let mut quota = phase();
        quota.stop_condition = StopCondition::MinSucceeded { count: 1 };
        let items = vec![
            item("a", WorkItemStatus::Succeeded),
            item("b", WorkItemStatus::Failed),
            item("c", WorkItemStatus::Pending),
        ];
        let gate = GateDefinition::Deterministic { checks: vec![] };
        let result = GateEvaluator::new()
            .evaluate(&quota, "ci", &gate, &items, 0)
            .await
            .unwrap();
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_superseded_items_are_ignored() {
        let old = item("a", WorkItemStatus::Succeeded);
        let mut revision = old.revision(1, 1, None);
        revision.status = WorkItemStatus::Succeeded;
        let result = GateEvaluator::new()
            .evaluate(
                &phase(),
                "all_items_succeeded",
                &GateDefinition::default_gate(),
                &[old, revision],
                1,
            )
            .await
            .unwrap();
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_empty_phase_uses_policy() {
        let evaluator = GateEvaluator::new();
        let gate = GateDefinition::default_gate();
        let strict = evaluator
            .evaluate(&phase(), "g", &gate, &[], 0)
            .await
            .unwrap();
        assert!(!strict.passed);

        let mut lenient = phase();
        lenient.empty_is_success = true;
        let result = evaluator.evaluate(&lenient, "g", &gate, &[], 0).await.unwrap();
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_preview_health_queries_provider() {
        let deployment = Arc::new(FakeDeployment::new());
        deployment.set_health("https://preview.test/change-2", HealthStatus::Unhealthy);
        let evaluator = GateEvaluator::new().with_deployment(Some(deployment));

        let mut a = item("a", WorkItemStatus::Succeeded);
        a.change_ref = Some("change-1".into());
        let mut b = item("b", WorkItemStatus::Succeeded);
        b.change_ref = Some("change-2".into());
        let gate = GateDefinition::Deterministic {
            checks: vec![CheckSpec::new("previews", Check::PreviewHealth)],
        };

        let result = evaluator
            .evaluate(&phase(), "ci", &gate, &[a, b], 0)
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(result.flagged_items, vec!["b"]);
    }

    #[tokio::test]
    async fn test_health_without_provider_fails() {
        let gate = GateDefinition::Deterministic {
            checks: vec![CheckSpec::new(
                "prod",
                Check::Health {
                    endpoint: "https://prod.test".into(),
                },
            )],
        };
        let result = GateEvaluator::new()
            .evaluate(&phase(), "ci", &gate, &[item("a", WorkItemStatus::Succeeded)], 0)
            .await
            .unwrap();
        assert!(!result.passed);
        assert!(result.notes.contains("no deployment provider"));
    }

    #[tokio::test]
    async fn test_verify_check_uses_verifier() {
        let verifier = Arc::new(FakeVerifier::new(false));
        let evaluator = GateEvaluator::new().with_verifier(Some(verifier.clone()));
        let gate = GateDefinition::Deterministic {
            checks: vec![CheckSpec::new(
                "login",
                Check::Verify {
                    endpoint: "https://app.test".into(),
                    scenario: json!({"path": "/login"}),
                },
            )],
        };
        let result = evaluator
            .evaluate(&phase(), "ci", &gate, &[item("a", WorkItemStatus::Succeeded)], 0)
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(verifier.seen.lock().unwrap()[0].0, "https://app.test");
    }

    #[tokio::test]
    async fn test_command_check_in_gate() {
        let dir = tempfile::tempdir().unwrap();
        let evaluator = GateEvaluator::new().with_shell(ShellSettings {
            working_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        let gate = GateDefinition::Deterministic {
            checks: vec![
                CheckSpec::new("ok", Check::Command { command: "true".into() }),
                CheckSpec::new("done", Check::AllItemsSucceeded),
            ],
        };
        let result = evaluator
            .evaluate(&phase(), "ci", &gate, &[item("a", WorkItemStatus::Succeeded)], 0)
            .await
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.total, 2.0);
    }
}
