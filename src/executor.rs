//! StepRunner: drives one [`TestPlan`] through a [`BrowserDriver`], one step
//! at a time.
//!
//! ```text
//! Idle -> Running(i) -> StepSucceeded(i) -> Running(i+1) ... -> Finished
//!                    -> StepFailed(i)    -> Running(i+1)  (continue policy)
//!                                        -> Aborted       (abort policy, assert, fatal, deadline)
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::aggregate::{AbortReason, PlanOutcome, StepResult};
use crate::artifacts::{Artifact, ArtifactStore};
use crate::config::ExecutorConfig;
use crate::context::PageContext;
use crate::driver::{BrowserDriver, WaitCondition};
use crate::error::{DriverError, StepError};
use crate::events::{AgentEvent, EventSink};
use crate::plan::{OnFailure, TestPlan};
use crate::schema::{Action, ActionKind, ActionStep, Expectation, ExtractFormat, Selector, WaitSpec};

const ACTUAL_PREVIEW_CHARS: usize = 120;
/// Upper bound on how much of an attempt budget a visibility wait leaves
/// unused, so its own timeout fires before the attempt's.
const EXPECTATION_MARGIN: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Running { index: usize },
    StepSucceeded { index: usize },
    StepFailed { index: usize },
    Finished,
    Aborted(AbortReason),
}

/// Everything one plan run produced. `context` is the input context updated
/// with extracted variables and the final URL.
#[derive(Debug, Clone)]
pub struct PlanExecution {
    pub steps: Vec<StepResult>,
    pub outcome: PlanOutcome,
    pub context: PageContext,
    pub transitions: Vec<ExecutorState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StepOutput {
    message: String,
    artifact: Option<Artifact>,
    extracted: Option<(String, String)>,
    navigated_to: Option<String>,
}

impl StepOutput {
    fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Resolves a `navigate` target: absolute URLs pass through, paths join the
/// base URL, bare hosts get `https://`.
pub fn resolve_url(base: Option<&str>, raw: &str) -> String {
    let raw = raw.trim();
    if raw.contains("://") || raw.starts_with("about:") || raw.starts_with("data:") {
        return raw.to_string();
    }
    let host_like = raw
        .split('/')
        .next()
        .is_some_and(|first| first.contains('.') || first.contains(':') || first == "localhost");
    if !host_like {
        if let Some(joined) = base
            .and_then(|base| Url::parse(base).ok())
            .and_then(|base| base.join(raw).ok())
        {
            return joined.to_string();
        }
    }
    format!("https://{}", raw.trim_start_matches('/'))
}

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > ACTUAL_PREVIEW_CHARS {
        let cut: String = flat.chars().take(ACTUAL_PREVIEW_CHARS).collect();
        format!("'{cut}…'")
    } else {
        format!("'{flat}'")
    }
}

fn interpolate_condition(condition: &WaitCondition, context: &PageContext) -> WaitCondition {
    match condition {
        WaitCondition::UrlContains(part) => WaitCondition::UrlContains(context.interpolate(part)),
        WaitCondition::TextPresent(part) => WaitCondition::TextPresent(context.interpolate(part)),
        other => other.clone(),
    }
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

pub struct StepRunner<'a> {
    driver: &'a dyn BrowserDriver,
    artifacts: &'a ArtifactStore,
    config: &'a ExecutorConfig,
    base_url: Option<&'a str>,
    case_id: &'a str,
    events: EventSink,
    state: ExecutorState,
    transitions: Vec<ExecutorState>,
}

impl<'a> StepRunner<'a> {
    pub fn new(
        driver: &'a dyn BrowserDriver,
        artifacts: &'a ArtifactStore,
        config: &'a ExecutorConfig,
        case_id: &'a str,
    ) -> Self {
        Self {
            driver,
            artifacts,
            config,
            base_url: None,
            case_id,
            events: EventSink::disabled(),
            state: ExecutorState::Idle,
            transitions: vec![ExecutorState::Idle],
        }
    }

    pub fn with_base_url(mut self, base_url: Option<&'a str>) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self) -> &ExecutorState {
        &self.state
    }

    fn transition(&mut self, next: ExecutorState) {
        debug!(case = self.case_id, from = ?self.state, to = ?next, "executor transition");
        self.state = next.clone();
        self.transitions.push(next);
    }

    /// Runs every step in order. Never fails: transient problems end up in
    /// the step results and fatal ones in the outcome.
    pub async fn run(
        mut self,
        plan: &TestPlan,
        mut context: PageContext,
        deadline: Option<Instant>,
    ) -> PlanExecution {
        let started_at = Utc::now();
        let steps = plan.steps();
        let mut results: Vec<StepResult> = Vec::with_capacity(steps.len());
        let mut abort: Option<AbortReason> = None;
        info!(case = self.case_id, steps = steps.len(), "executing plan");

        for (index, step) in steps.iter().enumerate() {
            if deadline_passed(deadline) {
                abort = Some(AbortReason::DeadlineExceeded { step: index });
                break;
            }

            self.transition(ExecutorState::Running { index });
            self.events.emit(AgentEvent::StepStarted {
                index,
                summary: step.summary(),
            });
            let started = Instant::now();
            let attempted = {
                let this = &self;
                let ctx = &context;
                self.config
                    .retry
                    .run_observed(
                        deadline,
                        move |attempt| this.attempt(step, index, ctx, deadline, attempt),
                        |attempt, error: &StepError, delay: Duration| {
                            warn!(
                                case = this.case_id,
                                step = index + 1,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                %error,
                                "step attempt failed; retrying"
                            );
                            this.events.emit(AgentEvent::StepRetry {
                                index,
                                attempt,
                                reason: error.to_string(),
                            });
                        },
                    )
                    .await
            };
            let duration_ms = started.elapsed().as_millis() as u64;
            let retries_used = attempted.retries_used();
            let attempts = attempted.attempts;

            let error = match attempted.result {
                Ok(output) => {
                    if let Some((name, value)) = output.extracted {
                        context.set_variable(name, value);
                    }
                    if let Some(url) = output.navigated_to {
                        context.current_url = Some(url);
                    }
                    info!(case = self.case_id, step = index + 1, duration_ms, "step passed");
                    results.push(StepResult::succeeded(
                        index,
                        step.clone(),
                        output.message,
                        output.artifact,
                        duration_ms,
                        retries_used,
                    ));
                    self.transition(ExecutorState::StepSucceeded { index });
                    self.events.emit(AgentEvent::StepPassed { index, duration_ms });
                    continue;
                }
                Err(error) => error,
            };

            self.transition(ExecutorState::StepFailed { index });
            let message = format!("{error} (after {attempts} attempt(s))");
            warn!(case = self.case_id, step = index + 1, %message, "step failed");
            self.events.emit(AgentEvent::StepFailed {
                index,
                message: message.clone(),
            });

            let reason = if error.is_fatal() {
                Some(AbortReason::DriverDisconnected {
                    step: index,
                    detail: error.to_string(),
                })
            } else if deadline_passed(deadline) {
                Some(AbortReason::DeadlineExceeded { step: index })
            } else if plan.policy().on_failure(step.kind()) == OnFailure::Abort {
                Some(if step.kind() == ActionKind::Assert {
                    AbortReason::AssertionFailed { step: index }
                } else {
                    AbortReason::StepFailed { step: index }
                })
            } else {
                None
            };

            let artifact = if reason.is_some() || self.config.screenshot_on_failure {
                self.failure_screenshot(index).await
            } else {
                None
            };
            results.push(StepResult::failed(
                index,
                step.clone(),
                message,
                artifact,
                duration_ms,
                retries_used,
                reason.is_none(),
            ));

            if reason.is_some() {
                abort = reason;
                break;
            }
        }

        let outcome = match abort {
            Some(reason) => {
                let executed = results.len();
                for (index, step) in steps.iter().enumerate().skip(executed) {
                    results.push(StepResult::skipped(
                        index,
                        step.clone(),
                        format!("skipped: {reason}"),
                    ));
                    self.events.emit(AgentEvent::StepSkipped { index });
                }
                warn!(case = self.case_id, %reason, "plan aborted");
                self.events.emit(AgentEvent::Aborted {
                    reason: reason.to_string(),
                });
                self.transition(ExecutorState::Aborted(reason.clone()));
                PlanOutcome::Aborted { reason }
            }
            None => {
                self.transition(ExecutorState::Finished);
                PlanOutcome::Finished
            }
        };

        if !matches!(
            outcome.abort_reason(),
            Some(AbortReason::DriverDisconnected { .. })
        ) {
            if let Ok(url) = self.driver.current_url().await {
                context.current_url = Some(url);
            }
        }

        PlanExecution {
            steps: results,
            outcome,
            context,
            transitions: self.transitions,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Per-attempt budget: the step's own timeout, cut to what remains of
    /// the plan deadline.
    fn attempt_budget(&self, step: &ActionStep, deadline: Option<Instant>) -> Duration {
        let mut budget =
            Duration::from_millis(step.timeout_ms().unwrap_or(self.config.step_timeout_ms));
        if let Action::Wait {
            until: WaitSpec::Duration(pause),
        } = step.action()
        {
            budget = budget.max(*pause + Duration::from_millis(50));
        }
        match deadline {
            Some(deadline) => budget.min(deadline.saturating_duration_since(Instant::now())),
            None => budget,
        }
    }

    async fn attempt(
        &self,
        step: &ActionStep,
        index: usize,
        context: &PageContext,
        deadline: Option<Instant>,
        attempt: u32,
    ) -> Result<StepOutput, StepError> {
        let budget = self.attempt_budget(step, deadline);
        debug!(
            case = self.case_id,
            step = index + 1,
            attempt,
            budget_ms = budget.as_millis() as u64,
            "attempting step"
        );
        match tokio::time::timeout(budget, self.dispatch(step, index, context, budget, deadline))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout {
                operation: step.summary(),
                timeout_ms: budget.as_millis() as u64,
            }
            .into()),
        }
    }

    async fn dispatch(
        &self,
        step: &ActionStep,
        index: usize,
        context: &PageContext,
        budget: Duration,
        deadline: Option<Instant>,
    ) -> Result<StepOutput, StepError> {
        let driver = self.driver;
        match step.action() {
            Action::Navigate { url } => {
                let url = resolve_url(self.base_url, &context.interpolate(url));
                driver.goto(&url).await?;
                Ok(StepOutput {
                    message: format!("navigated to {url}"),
                    navigated_to: Some(url),
                    ..StepOutput::default()
                })
            }
            Action::Click { target } => {
                let element = driver.find_element(target).await?;
                driver.click(&element).await?;
                Ok(StepOutput::message(format!("clicked {target}")))
            }
            Action::Fill { target, text } => {
                let text = context.interpolate(text);
                let element = driver.find_element(target).await?;
                driver.fill(&element, &text).await?;
                Ok(StepOutput::message(format!("filled {target}")))
            }
            Action::Select { target, option } => {
                let option = context.interpolate(option);
                let element = driver.find_element(target).await?;
                driver.select(&element, &option).await?;
                Ok(StepOutput::message(format!("selected '{option}' in {target}")))
            }
            Action::Check { target } | Action::Uncheck { target } => {
                let checked = step.kind() == ActionKind::Check;
                let element = driver.find_element(target).await?;
                driver.set_checked(&element, checked).await?;
                Ok(StepOutput::message(format!("{} {target}", step.kind())))
            }
            Action::Hover { target } => {
                let element = driver.find_element(target).await?;
                driver.hover(&element).await?;
                Ok(StepOutput::message(format!("hovered {target}")))
            }
            Action::Wait {
                until: WaitSpec::Duration(pause),
            } => {
                let pause = match deadline {
                    Some(deadline) => (*pause).min(deadline.saturating_duration_since(Instant::now())),
                    None => *pause,
                };
                tokio::time::sleep(pause).await;
                Ok(StepOutput::message(format!("waited {} ms", pause.as_millis())))
            }
            Action::Wait {
                until: WaitSpec::Condition(condition),
            } => {
                let condition = interpolate_condition(condition, context);
                driver.wait_for(&condition, budget).await?;
                Ok(StepOutput::message(format!("condition met: {condition}")))
            }
            Action::Assert { target, expect } => {
                self.check_expectation(target, expect, context, budget).await
            }
            Action::Screenshot { label } => {
                let png = driver.screenshot().await?;
                let artifact = self
                    .artifacts
                    .write_screenshot(self.case_id, index + 1, false, &png)
                    .await
                    .map_err(|error| StepError::Artifact(error.to_string()))?;
                let message = match label {
                    Some(label) => format!("screenshot '{label}' saved"),
                    None => "screenshot saved".to_string(),
                };
                Ok(StepOutput {
                    message,
                    artifact: Some(artifact),
                    ..StepOutput::default()
                })
            }
            Action::Extract {
                target,
                variable,
                format,
            } => {
                let content = match format {
                    ExtractFormat::Text => driver.extract_text(Some(target)).await?,
                    ExtractFormat::Html => driver.extract_html(Some(target)).await?,
                };
                let name = variable
                    .clone()
                    .unwrap_or_else(|| format!("extract_{}", index + 1));
                let artifact = self
                    .artifacts
                    .write_extract(self.case_id, index + 1, *format, &content)
                    .await
                    .map_err(|error| StepError::Artifact(error.to_string()))?;
                Ok(StepOutput {
                    message: format!("extracted {} chars into {{{{{name}}}}}", content.chars().count()),
                    artifact: Some(artifact),
                    extracted: Some((name, content)),
                    navigated_to: None,
                })
            }
        }
    }

    async fn check_expectation(
        &self,
        target: &Selector,
        expect: &Expectation,
        context: &PageContext,
        budget: Duration,
    ) -> Result<StepOutput, StepError> {
        let driver = self.driver;
        let failed = |expected: String, actual: String| StepError::AssertionFailed {
            target: target.locator(),
            expected,
            actual,
        };
        match expect {
            Expectation::Visible | Expectation::Hidden => {
                let (condition, actual) = if *expect == Expectation::Visible {
                    (WaitCondition::Visible(target.clone()), "not visible")
                } else {
                    (WaitCondition::Hidden(target.clone()), "still visible")
                };
                let wait = budget.saturating_sub(EXPECTATION_MARGIN.min(budget / 5));
                match driver.wait_for(&condition, wait).await {
                    Ok(()) => {}
                    Err(DriverError::Timeout { .. } | DriverError::ElementNotFound { .. }) => {
                        return Err(failed(expect.to_string(), actual.to_string()));
                    }
                    Err(other) => return Err(other.into()),
                }
            }
            Expectation::Enabled | Expectation::Disabled => {
                let element = driver.find_element(target).await?;
                let enabled = driver.is_enabled(&element).await?;
                let wanted = *expect == Expectation::Enabled;
                if enabled != wanted {
                    let actual = if enabled { "enabled" } else { "disabled" };
                    return Err(failed(expect.to_string(), actual.to_string()));
                }
            }
            Expectation::TextContains(text) | Expectation::TextEquals(text) => {
                let expected = context.interpolate(text);
                driver.find_element(target).await?;
                let actual = driver.extract_text(Some(target)).await?;
                let matched = match expect {
                    Expectation::TextEquals(_) => actual.trim() == expected.trim(),
                    _ => actual.contains(expected.as_str()),
                };
                if !matched {
                    let wanted = match expect {
                        Expectation::TextEquals(_) => format!("text equal to '{expected}'"),
                        _ => format!("text containing '{expected}'"),
                    };
                    return Err(failed(wanted, preview(&actual)));
                }
            }
            Expectation::ValueEquals(value) => {
                let expected = context.interpolate(value);
                let element = driver.find_element(target).await?;
                let actual = driver.input_value(&element).await?;
                if actual != expected {
                    return Err(failed(format!("value '{expected}'"), preview(&actual)));
                }
            }
        }
        Ok(StepOutput::message(format!("assert {target} {expect} held")))
    }

    /// Best-effort diagnostic capture; a failure here never changes the step
    /// outcome.
    async fn failure_screenshot(&self, index: usize) -> Option<Artifact> {
        let budget = Duration::from_millis(self.config.failure_screenshot_timeout_ms);
        let png = match tokio::time::timeout(budget, self.driver.screenshot()).await {
            Ok(Ok(png)) => png,
            Ok(Err(error)) => {
                warn!(case = self.case_id, step = index + 1, %error, "failure screenshot unavailable");
                return None;
            }
            Err(_) => {
                warn!(case = self.case_id, step = index + 1, "failure screenshot timed out");
                return None;
            }
        };
        match self
            .artifacts
            .write_screenshot(self.case_id, index + 1, true, &png)
            .await
        {
            Ok(artifact) => Some(artifact),
            Err(error) => {
                warn!(case = self.case_id, step = index + 1, %error, "failed to store failure screenshot");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::StepStatus;
    use crate::plan::FailurePolicy;
    use crate::retry::{BackoffStrategy, RetryPolicy};
    use crate::schema::{RawStep, validate};
    use crate::testing::StubDriver;

    fn step(raw: RawStep) -> ActionStep {
        validate(&raw).unwrap()
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            step_timeout_ms: 200,
            retry: RetryPolicy {
                max_retries: 2,
                strategy: BackoffStrategy::Fixed,
                base_delay_ms: 1,
                max_delay_ms: 1,
                jitter: false,
            },
            ..ExecutorConfig::default()
        }
    }

    async fn store() -> (tempfile::TempDir, ArtifactStore) {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::create(root.path()).await.unwrap();
        (root, store)
    }

    #[test]
    fn urls_resolve_against_base_or_get_a_scheme() {
        let base = Some("https://shop.test/app/");
        assert_eq!(resolve_url(base, "https://other.test/x"), "https://other.test/x");
        assert_eq!(resolve_url(base, "/menu"), "https://shop.test/menu");
        assert_eq!(resolve_url(base, "rewards"), "https://shop.test/app/rewards");
        assert_eq!(resolve_url(None, "example.com/menu"), "https://example.com/menu");
        assert_eq!(resolve_url(base, "localhost:8080/x"), "https://localhost:8080/x");
        assert_eq!(resolve_url(None, "about:blank"), "about:blank");
    }

    #[tokio::test]
    async fn successful_plan_walks_the_state_machine() {
        let driver = StubDriver::new();
        let (_root, artifacts) = store().await;
        let config = fast_config();
        let plan = TestPlan::new(
            "open and click",
            vec![
                step(RawStep::new("navigate").value("https://shop.test")),
                step(RawStep::new("click").target("text=Join My Rewards")),
            ],
        )
        .unwrap();

        let run = StepRunner::new(&driver, &artifacts, &config, "case-001")
            .run(&plan, PageContext::new(), None)
            .await;

        assert_eq!(run.outcome, PlanOutcome::Finished);
        assert!(run.steps.iter().all(StepResult::success));
        assert_eq!(
            run.transitions,
            vec![
                ExecutorState::Idle,
                ExecutorState::Running { index: 0 },
                ExecutorState::StepSucceeded { index: 0 },
                ExecutorState::Running { index: 1 },
                ExecutorState::StepSucceeded { index: 1 },
                ExecutorState::Finished,
            ]
        );
        assert_eq!(run.context.current_url.as_deref(), Some("https://shop.test"));
    }

    #[tokio::test]
    async fn retries_re_resolve_and_recover() {
        let driver = StubDriver::new().flaky("#late", 2);
        let (_root, artifacts) = store().await;
        let config = fast_config();
        let plan = TestPlan::new("late button", vec![step(RawStep::new("click").target("#late"))]).unwrap();

        let run = StepRunner::new(&driver, &artifacts, &config, "case-001")
            .run(&plan, PageContext::new(), None)
            .await;

        assert_eq!(run.outcome, PlanOutcome::Finished);
        assert_eq!(run.steps[0].retries_used, 2);
        assert_eq!(driver.find_attempts("#late"), 3);
    }

    #[tokio::test]
    async fn continue_policy_records_and_moves_on() {
        let driver = StubDriver::new().missing("#promo");
        let (_root, artifacts) = store().await;
        let config = fast_config();
        let plan = TestPlan::new(
            "dismiss promo then click",
            vec![
                step(RawStep::new("click").target("#promo")),
                step(RawStep::new("click").target("#menu")),
            ],
        )
        .unwrap()
        .with_policy(FailurePolicy::continue_on_failure());

        let run = StepRunner::new(&driver, &artifacts, &config, "case-001")
            .run(&plan, PageContext::new(), None)
            .await;

        assert_eq!(run.outcome, PlanOutcome::Finished);
        assert_eq!(run.steps[0].status, StepStatus::Failed);
        assert!(run.steps[0].tolerated);
        let shot = run.steps[0].artifact.as_ref().expect("failure screenshot");
        assert!(shot.path.ends_with("step-01-screenshot-failure.png"));
        assert!(run.steps[1].success());
    }

    #[tokio::test]
    async fn failed_assertion_aborts_even_under_continue_policy() {
        let driver = StubDriver::new().text("h1", "Welcome back");
        let (_root, artifacts) = store().await;
        let config = fast_config();
        let plan = TestPlan::new(
            "check heading",
            vec![
                step(RawStep::new("assert").target("h1").value("text:Goodbye")),
                step(RawStep::new("click").target("#next")),
            ],
        )
        .unwrap()
        .with_policy(FailurePolicy::continue_on_failure());

        let run = StepRunner::new(&driver, &artifacts, &config, "case-001")
            .run(&plan, PageContext::new(), None)
            .await;

        assert_eq!(
            run.outcome,
            PlanOutcome::Aborted {
                reason: AbortReason::AssertionFailed { step: 0 }
            }
        );
        assert!(run.steps[0].message.contains("text containing 'Goodbye'"));
        assert_eq!(run.steps[1].status, StepStatus::Skipped);
        assert_eq!(driver.find_attempts("#next"), 0);
    }

    #[tokio::test]
    async fn extract_feeds_later_steps() {
        let driver = StubDriver::new().text(".order-id", "A-1009");
        let (_root, artifacts) = store().await;
        let config = fast_config();
        let plan = TestPlan::new(
            "copy order id",
            vec![
                step(RawStep::new("extract").target(".order-id").value("order")),
                step(RawStep::new("fill").target("#search").value("{{order}}")),
                step(RawStep::new("extract").target(".order-id")),
            ],
        )
        .unwrap();

        let run = StepRunner::new(&driver, &artifacts, &config, "case-001")
            .run(&plan, PageContext::new(), None)
            .await;

        assert_eq!(run.outcome, PlanOutcome::Finished);
        assert_eq!(run.context.variable("order"), Some("A-1009"));
        assert_eq!(run.context.variable("extract_3"), Some("A-1009"));
        assert!(driver.calls().contains(&"fill #search A-1009".to_string()));
        let artifact = run.steps[0].artifact.as_ref().unwrap();
        assert_eq!(artifact.snippet.as_deref(), Some("A-1009"));
    }

    #[tokio::test]
    async fn expired_deadline_aborts_and_skips_everything_left() {
        let driver = StubDriver::new();
        let (_root, artifacts) = store().await;
        let config = fast_config();
        let plan = TestPlan::new(
            "too late",
            vec![
                step(RawStep::new("navigate").value("https://shop.test")),
                step(RawStep::new("click").target("#a")),
            ],
        )
        .unwrap();

        let run = StepRunner::new(&driver, &artifacts, &config, "case-001")
            .run(&plan, PageContext::new(), Some(Instant::now()))
            .await;

        assert_eq!(
            run.outcome,
            PlanOutcome::Aborted {
                reason: AbortReason::DeadlineExceeded { step: 0 }
            }
        );
        assert!(run.steps.iter().all(|s| s.status == StepStatus::Skipped));
        assert!(driver.calls().iter().all(|call| !call.starts_with("goto")));
    }

    #[tokio::test]
    async fn retries_stop_at_the_plan_deadline() {
        let driver = StubDriver::new().missing("#never");
        let (_root, artifacts) = store().await;
        let config = ExecutorConfig {
            retry: RetryPolicy {
                max_retries: 50,
                strategy: BackoffStrategy::Fixed,
                base_delay_ms: 40,
                max_delay_ms: 40,
                jitter: false,
            },
            ..fast_config()
        };
        let plan = TestPlan::new("never", vec![step(RawStep::new("click").target("#never"))]).unwrap();

        let deadline = Instant::now() + Duration::from_millis(150);
        let run = StepRunner::new(&driver, &artifacts, &config, "case-001")
            .run(&plan, PageContext::new(), Some(deadline))
            .await;

        assert!(driver.find_attempts("#never") < 6);
        assert_eq!(run.steps[0].status, StepStatus::Failed);
        assert!(matches!(run.outcome, PlanOutcome::Aborted { .. }));
    }

    #[tokio::test]
    async fn slow_driver_hits_the_step_timeout() {
        let driver = StubDriver::new().latency(Duration::from_millis(100));
        let (_root, artifacts) = store().await;
        let config = ExecutorConfig {
            retry: RetryPolicy::none(),
            screenshot_on_failure: false,
            failure_screenshot_timeout_ms: 10,
            ..fast_config()
        };
        let plan = TestPlan::new(
            "slow",
            vec![step(RawStep::new("click").target("#slow").timeout_ms(20))],
        )
        .unwrap();

        let run = StepRunner::new(&driver, &artifacts, &config, "case-001")
            .run(&plan, PageContext::new(), None)
            .await;

        assert!(run.steps[0].message.contains("timed out after 20 ms"));
        assert!(matches!(
            run.outcome,
            PlanOutcome::Aborted {
                reason: AbortReason::StepFailed { step: 0 }
            }
        ));
    }

    #[tokio::test]
    async fn visibility_assert_reports_the_mismatch_not_a_timeout() {
        let driver = StubDriver::new().hidden("#banner").patient_waits();
        let (_root, artifacts) = store().await;
        let config = ExecutorConfig {
            retry: RetryPolicy::none(),
            screenshot_on_failure: false,
            ..fast_config()
        };
        let plan = TestPlan::new(
            "banner shows",
            vec![step(RawStep::new("assert").target("#banner").value("visible"))],
        )
        .unwrap();

        let run = StepRunner::new(&driver, &artifacts, &config, "case-001")
            .run(&plan, PageContext::new(), None)
            .await;

        let message = &run.steps[0].message;
        assert!(message.contains("expected visible, found not visible"), "{message}");
        assert!(!message.contains("timed out"), "{message}");
        assert_eq!(
            run.outcome,
            PlanOutcome::Aborted {
                reason: AbortReason::AssertionFailed { step: 0 }
            }
        );
    }
}
