//! Folding per-step outcomes into one verdict.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifacts::Artifact;
use crate::schema::ActionStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepStatus::Succeeded => "passed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    /// Zero-based position in the plan.
    pub index: usize,
    pub step: ActionStep,
    pub status: StepStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    pub duration_ms: u64,
    pub retries_used: u32,
    /// Failed, but under a continue-on-failure policy.
    #[serde(default)]
    pub tolerated: bool,
}

impl StepResult {
    pub fn succeeded(
        index: usize,
        step: ActionStep,
        message: impl Into<String>,
        artifact: Option<Artifact>,
        duration_ms: u64,
        retries_used: u32,
    ) -> Self {
        Self {
            index,
            step,
            status: StepStatus::Succeeded,
            message: message.into(),
            artifact,
            duration_ms,
            retries_used,
            tolerated: false,
        }
    }

    pub fn failed(
        index: usize,
        step: ActionStep,
        message: impl Into<String>,
        artifact: Option<Artifact>,
        duration_ms: u64,
        retries_used: u32,
        tolerated: bool,
    ) -> Self {
        Self {
            index,
            step,
            status: StepStatus::Failed,
            message: message.into(),
            artifact,
            duration_ms,
            retries_used,
            tolerated,
        }
    }

    pub fn skipped(index: usize, step: ActionStep, reason: impl Into<String>) -> Self {
        Self {
            index,
            step,
            status: StepStatus::Skipped,
            message: reason.into(),
            artifact: None,
            duration_ms: 0,
            retries_used: 0,
            tolerated: false,
        }
    }

    pub fn success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    pub fn attempts(&self) -> u32 {
        match self.status {
            StepStatus::Skipped => 0,
            _ => self.retries_used + 1,
        }
    }

    pub fn is_blocking_failure(&self) -> bool {
        self.status == StepStatus::Failed && !self.tolerated
    }
}

/// Why the executor stopped early. `step` is the zero-based index at which
/// the abort happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    AssertionFailed { step: usize },
    StepFailed { step: usize },
    DriverDisconnected { step: usize, detail: String },
    DeadlineExceeded { step: usize },
}

impl AbortReason {
    pub fn step(&self) -> usize {
        match self {
            AbortReason::AssertionFailed { step }
            | AbortReason::StepFailed { step }
            | AbortReason::DriverDisconnected { step, .. }
            | AbortReason::DeadlineExceeded { step } => *step,
        }
    }

    pub fn is_session_fatal(&self) -> bool {
        matches!(self, AbortReason::DriverDisconnected { .. })
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::AssertionFailed { step } => {
                write!(f, "assertion failed at step {}", step + 1)
            }
            AbortReason::StepFailed { step } => write!(f, "step {} failed", step + 1),
            AbortReason::DriverDisconnected { step, detail } => {
                write!(f, "browser disconnected at step {}: {detail}", step + 1)
            }
            AbortReason::DeadlineExceeded { step } => {
                write!(f, "plan deadline exceeded at step {}", step + 1)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PlanOutcome {
    Finished,
    Aborted { reason: AbortReason },
}

impl PlanOutcome {
    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            PlanOutcome::Finished => None,
            PlanOutcome::Aborted { reason } => Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub case_id: String,
    pub description: String,
    pub success: bool,
    pub message: String,
    pub steps: Vec<StepResult>,
    pub outcome: PlanOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TestResult {
    fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|step| step.status == status).count()
    }

    pub fn passed_steps(&self) -> usize {
        self.count(StepStatus::Succeeded)
    }

    pub fn failed_steps(&self) -> usize {
        self.count(StepStatus::Failed)
    }

    pub fn skipped_steps(&self) -> usize {
        self.count(StepStatus::Skipped)
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.steps.iter().filter_map(|step| step.artifact.as_ref())
    }
}

fn describe_failure(step: &StepResult) -> String {
    format!("step {} ({}): {}", step.index + 1, step.step.summary(), step.message)
}

/// Pure fold of a step sequence into a [`TestResult`].
///
/// `success` is false exactly when some step failed under an aborting policy
/// or the plan was aborted.
pub fn aggregate(
    case_id: &str,
    description: &str,
    steps: Vec<StepResult>,
    outcome: PlanOutcome,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> TestResult {
    let blocking: Vec<&StepResult> = steps.iter().filter(|s| s.is_blocking_failure()).collect();
    let tolerated: Vec<&StepResult> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Failed && s.tolerated)
        .collect();
    let skipped = steps
        .iter()
        .filter(|s| s.status == StepStatus::Skipped)
        .count();
    let success = blocking.is_empty() && outcome == PlanOutcome::Finished;

    let message = if success {
        if tolerated.is_empty() {
            format!("All {} step(s) passed", steps.len())
        } else {
            let details: Vec<String> = tolerated.iter().map(|s| describe_failure(s)).collect();
            format!(
                "All required steps passed; {} tolerated failure(s): {}",
                tolerated.len(),
                details.join("; ")
            )
        }
    } else {
        let mut parts: Vec<String> = steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(describe_failure)
            .collect();
        if let Some(reason) = outcome.abort_reason() {
            parts.push(format!("plan aborted: {reason}"));
        }
        if skipped > 0 {
            parts.push(format!("{skipped} step(s) skipped"));
        }
        format!("FAILED: {}", parts.join("; "))
    };

    TestResult {
        case_id: case_id.to_string(),
        description: description.to_string(),
        success,
        message,
        steps,
        outcome,
        started_at,
        finished_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RawStep, validate};

    fn click(target: &str) -> ActionStep {
        validate(&RawStep::new("click").target(target)).unwrap()
    }

    fn run(steps: Vec<StepResult>, outcome: PlanOutcome) -> TestResult {
        let now = Utc::now();
        aggregate("case-001", "demo", steps, outcome, now, now)
    }

    #[test]
    fn all_success_yields_generic_message() {
        let result = run(
            vec![
                StepResult::succeeded(0, click("#a"), "ok", None, 5, 0),
                StepResult::succeeded(1, click("#b"), "ok", None, 5, 1),
            ],
            PlanOutcome::Finished,
        );
        assert!(result.success);
        assert_eq!(result.message, "All 2 step(s) passed");
        assert_eq!(result.passed_steps(), 2);
    }

    #[test]
    fn tolerated_failure_keeps_success() {
        let result = run(
            vec![
                StepResult::failed(0, click("#promo"), "element not found", None, 5, 2, true),
                StepResult::succeeded(1, click("#b"), "ok", None, 5, 0),
            ],
            PlanOutcome::Finished,
        );
        assert!(result.success);
        assert!(result.message.contains("1 tolerated failure(s)"));
        assert!(result.message.contains("step 1 (click #promo)"));
    }

    #[test]
    fn failures_are_summarised_in_order_with_abort_reason() {
        let result = run(
            vec![
                StepResult::failed(0, click("#x"), "first problem", None, 5, 0, true),
                StepResult::failed(1, click("#y"), "second problem", None, 5, 2, false),
                StepResult::skipped(2, click("#z"), "plan aborted"),
            ],
            PlanOutcome::Aborted {
                reason: AbortReason::StepFailed { step: 1 },
            },
        );
        assert!(!result.success);
        let first = result.message.find("first problem").unwrap();
        let second = result.message.find("second problem").unwrap();
        assert!(first < second);
        assert!(result.message.contains("plan aborted: step 2 failed"));
        assert!(result.message.ends_with("1 step(s) skipped"));
        assert_eq!(result.skipped_steps(), 1);
    }

    #[test]
    fn aborted_plan_is_a_failure_even_without_failed_steps() {
        let result = run(
            vec![
                StepResult::succeeded(0, click("#a"), "ok", None, 5, 0),
                StepResult::skipped(1, click("#b"), "deadline"),
            ],
            PlanOutcome::Aborted {
                reason: AbortReason::DeadlineExceeded { step: 1 },
            },
        );
        assert!(!result.success);
        assert!(result.message.contains("plan deadline exceeded at step 2"));
    }

    #[test]
    fn attempts_count_initial_try() {
        let step = StepResult::failed(0, click("#a"), "nope", None, 5, 2, false);
        assert_eq!(step.attempts(), 3);
        assert_eq!(StepResult::skipped(1, click("#b"), "x").attempts(), 0);
    }
}
