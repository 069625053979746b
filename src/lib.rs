//! Natural-language web test agent.
//!
//! A description such as "go to the menu page and join rewards" is turned
//! into a validated [`TestPlan`] by a [`LanguageModel`], executed step by
//! step against a [`BrowserDriver`], and summarised as a [`TestResult`].
//! Each case also leaves a JSON plan and a Playwright replay script behind.

pub mod agent;
pub mod aggregate;
pub mod artifacts;
pub mod brain;
pub mod config;
pub mod context;
mod dom;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod hands;
pub mod plan;
pub mod planner;
pub mod report;
pub mod retry;
pub mod schema;
pub mod script;
pub mod testing;

pub use agent::{BatchFailure, BatchRun, CaseRun, TestAgent};
pub use aggregate::{AbortReason, PlanOutcome, StepResult, StepStatus, TestResult};
pub use artifacts::{Artifact, ArtifactKind, ArtifactStore};
pub use brain::{LanguageModel, OpenAiBrain};
pub use config::AgentConfig;
pub use context::PageContext;
pub use driver::{BrowserDriver, ElementHandle};
pub use error::{AgentError, DriverError, PlanningError, ProviderError, StepError};
pub use events::AgentEvent;
pub use hands::ChromeDriver;
pub use plan::{FailurePolicy, OnFailure, TestPlan};
pub use report::RunReport;
pub use schema::{Action, ActionKind, ActionStep, RawStep, Selector, validate};
