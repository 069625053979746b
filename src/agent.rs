//! TestAgent: one browser session bound to a planner, an executor and an
//! artifact store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::aggregate::{AbortReason, TestResult, aggregate};
use crate::artifacts::{ArtifactKind, ArtifactStore};
use crate::brain::LanguageModel;
use crate::config::AgentConfig;
use crate::context::PageContext;
use crate::driver::BrowserDriver;
use crate::error::{AgentError, DriverError};
use crate::events::{AgentEvent, EventSink};
use crate::executor::StepRunner;
use crate::plan::TestPlan;
use crate::planner::Planner;
use crate::report::RunReport;
use crate::script::{ScriptOptions, render_playwright};

/// One executed description plus the context to hand to the next one.
#[derive(Debug, Clone)]
pub struct CaseRun {
    pub result: TestResult,
    pub context: PageContext,
}

#[derive(Debug)]
pub struct BatchFailure {
    pub description: String,
    pub error: AgentError,
}

#[derive(Debug)]
pub struct BatchRun {
    pub results: Vec<TestResult>,
    pub context: PageContext,
    /// Descriptions that produced no runnable plan, or the session failure
    /// that stopped the batch.
    pub failures: Vec<BatchFailure>,
    pub halted: bool,
}

impl BatchRun {
    pub fn success(&self) -> bool {
        self.failures.is_empty() && self.results.iter().all(|result| result.success)
    }
}

pub struct TestAgent {
    driver: Arc<dyn BrowserDriver>,
    planner: Planner,
    config: AgentConfig,
    artifacts: ArtifactStore,
    events: EventSink,
    results: Vec<TestResult>,
    next_case: usize,
    closed: bool,
}

impl TestAgent {
    /// Binds `driver` to a new session; artifacts go to a fresh directory
    /// under the configured root.
    pub async fn new(
        driver: Arc<dyn BrowserDriver>,
        model: Arc<dyn LanguageModel>,
        config: AgentConfig,
    ) -> Result<Self, AgentError> {
        let artifacts = ArtifactStore::create(&config.artifacts_root()).await?;
        let planner =
            Planner::new(model, config.planner.clone()).with_base_url(config.base_url.clone());
        Ok(Self {
            driver,
            planner,
            config,
            artifacts,
            events: EventSink::disabled(),
            results: Vec::new(),
            next_case: 0,
            closed: false,
        })
    }

    pub fn with_events(mut self, sender: broadcast::Sender<AgentEvent>) -> Self {
        self.events = EventSink::new(sender);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Every case run in this session, oldest first.
    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), AgentError> {
        if self.closed {
            Err(AgentError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn next_case_id(&mut self) -> String {
        self.next_case += 1;
        format!("case-{:03}", self.next_case)
    }

    fn default_deadline(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.config.executor.plan_timeout_ms)
    }

    /// Plans `description` without executing it.
    pub async fn plan(
        &self,
        description: &str,
        context: &PageContext,
    ) -> Result<TestPlan, AgentError> {
        self.ensure_open()?;
        let plan = self.planner.plan(description, context).await?;
        Ok(plan.with_policy(self.config.executor.failure_policy.clone()))
    }

    pub async fn execute_test_plan(
        &mut self,
        description: &str,
        context: &PageContext,
    ) -> Result<CaseRun, AgentError> {
        let deadline = self.default_deadline();
        self.execute_test_plan_until(description, context, deadline)
            .await
    }

    /// Plans and runs one description. Step failures come back inside the
    /// result; only planning failures and a lost browser are errors.
    pub async fn execute_test_plan_until(
        &mut self,
        description: &str,
        context: &PageContext,
        deadline: Instant,
    ) -> Result<CaseRun, AgentError> {
        self.ensure_open()?;
        let case_id = self.next_case_id();
        info!(case = %case_id, %description, "planning");
        self.events.emit(AgentEvent::Planning {
            case_id: case_id.clone(),
            description: description.to_string(),
        });

        let mut planning_context = context.clone();
        match self.driver.page_outline().await {
            Ok(outline) => planning_context.page_outline = outline,
            Err(error) if error.is_fatal() => {
                return Err(self.session_failure(&case_id, error).await);
            }
            Err(error) => warn!(case = %case_id, %error, "page outline unavailable"),
        }

        let plan = match self.plan(description, &planning_context).await {
            Ok(plan) => plan,
            Err(error) => {
                warn!(case = %case_id, %error, "planning failed");
                self.events.emit(AgentEvent::CaseError {
                    case_id,
                    message: error.to_string(),
                });
                return Err(error);
            }
        };
        self.run_case(case_id, &plan, context, deadline).await
    }

    /// Runs an already validated plan, e.g. one loaded from `plan.json`.
    pub async fn execute_plan(
        &mut self,
        plan: &TestPlan,
        context: &PageContext,
    ) -> Result<CaseRun, AgentError> {
        self.ensure_open()?;
        let case_id = self.next_case_id();
        let deadline = self.default_deadline();
        self.run_case(case_id, plan, context, deadline).await
    }

    /// Runs descriptions in order over this session, threading context from
    /// one to the next. A planning failure skips that description; a lost
    /// session stops the batch.
    pub async fn execute_batch<I, S>(&mut self, descriptions: I, context: PageContext) -> BatchRun
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut batch = BatchRun {
            results: Vec::new(),
            context,
            failures: Vec::new(),
            halted: false,
        };
        for description in descriptions {
            let description = description.as_ref();
            match self.execute_test_plan(description, &batch.context).await {
                Ok(run) => {
                    batch.results.push(run.result);
                    batch.context = run.context;
                }
                Err(AgentError::Planning(error)) => batch.failures.push(BatchFailure {
                    description: description.to_string(),
                    error: AgentError::Planning(error),
                }),
                Err(error) => {
                    if let AgentError::SessionLost { result } = &error {
                        batch.results.push(result.as_ref().clone());
                    }
                    error!(%error, "batch halted");
                    batch.failures.push(BatchFailure {
                        description: description.to_string(),
                        error,
                    });
                    batch.halted = true;
                    break;
                }
            }
        }
        batch
    }

    async fn run_case(
        &mut self,
        case_id: String,
        plan: &TestPlan,
        context: &PageContext,
        deadline: Instant,
    ) -> Result<CaseRun, AgentError> {
        self.events.emit(AgentEvent::Planned {
            case_id: case_id.clone(),
            steps: plan.steps().iter().map(|step| step.summary()).collect(),
        });
        if self.config.artifacts.emit_scripts {
            self.write_replay_files(&case_id, plan).await;
        }

        let started_at = Utc::now();
        let execution = StepRunner::new(
            self.driver.as_ref(),
            &self.artifacts,
            &self.config.executor,
            &case_id,
        )
        .with_base_url(self.config.base_url.as_deref())
        .with_events(self.events.clone())
        .run(plan, context.clone(), Some(deadline))
        .await;

        let result = aggregate(
            &case_id,
            plan.description(),
            execution.steps,
            execution.outcome,
            started_at,
            Utc::now(),
        );
        info!(case = %case_id, success = result.success, message = %result.message, "case finished");
        self.events.emit(AgentEvent::CaseFinished {
            case_id: case_id.clone(),
            success: result.success,
            message: result.message.clone(),
        });
        self.results.push(result.clone());

        let mut next = execution.context;
        next.page_outline = None;
        next.history.push(plan.description().to_string());

        match result.outcome.abort_reason().cloned() {
            Some(reason @ AbortReason::DriverDisconnected { .. }) => {
                error!(case = %case_id, %reason, "browser lost; closing session");
                self.close_quietly().await;
                Err(AgentError::SessionLost {
                    result: Box::new(result),
                })
            }
            Some(reason @ AbortReason::DeadlineExceeded { .. }) => {
                warn!(case = %case_id, %reason, "plan deadline expired; closing session");
                self.close_quietly().await;
                Ok(CaseRun {
                    result,
                    context: next,
                })
            }
            _ => Ok(CaseRun {
                result,
                context: next,
            }),
        }
    }

    async fn write_replay_files(&self, case_id: &str, plan: &TestPlan) {
        match plan.to_json_pretty() {
            Ok(json) => {
                if let Err(error) = self
                    .artifacts
                    .write(Some(case_id), "plan.json", ArtifactKind::Plan, json.as_bytes(), None)
                    .await
                {
                    warn!(case = case_id, %error, "could not write plan.json");
                }
            }
            Err(error) => warn!(case = case_id, %error, "could not serialise plan"),
        }
        let options = ScriptOptions {
            base_url: self.config.base_url.clone(),
            default_timeout_ms: self.config.executor.step_timeout_ms,
            headless: self.config.browser.headless,
        };
        let script = render_playwright(plan, &options);
        if let Err(error) = self
            .artifacts
            .write(Some(case_id), "test_case.py", ArtifactKind::Script, script.as_bytes(), None)
            .await
        {
            warn!(case = case_id, %error, "could not write test_case.py");
        }
    }

    async fn session_failure(&mut self, case_id: &str, error: DriverError) -> AgentError {
        error!(case = case_id, %error, "browser lost before planning; closing session");
        self.events.emit(AgentEvent::CaseError {
            case_id: case_id.to_string(),
            message: error.to_string(),
        });
        self.close_quietly().await;
        AgentError::Session(error)
    }

    async fn close_quietly(&mut self) {
        if let Err(error) = self.close().await {
            warn!(%error, "session close reported an error");
        }
    }

    /// Writes `report.md`/`report.json` for the cases run so far.
    pub async fn write_report(&self) -> Result<Option<PathBuf>, AgentError> {
        if self.results.is_empty() {
            return Ok(None);
        }
        let (markdown, _) = RunReport::new(self.results.clone())
            .write(&self.artifacts)
            .await?;
        info!(path = %markdown.path.display(), "report written");
        Ok(Some(markdown.path))
    }

    /// Releases the browser and seals the artifact store. Idempotent: the
    /// driver is closed exactly once however often this runs.
    pub async fn close(&mut self) -> Result<(), AgentError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let report = if self.config.artifacts.write_report {
            self.write_report().await.map(|_| ())
        } else {
            Ok(())
        };
        let manifest = self.artifacts.close().await;
        let driver = match self.driver.close().await {
            Err(DriverError::Disconnected(_)) => Ok(()),
            other => other,
        };
        info!(dir = %self.artifacts.session_dir().display(), "session closed");

        report?;
        manifest?;
        driver?;
        Ok(())
    }
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        warn!("test agent dropped without close; releasing browser session");
        let driver = Arc::clone(&self.driver);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = driver.close().await {
                        warn!(%error, "browser close after drop failed");
                    }
                });
            }
            Err(_) => warn!("no async runtime left to close the browser session"),
        }
    }
}
