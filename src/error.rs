use std::fmt;

use thiserror::Error;

use crate::aggregate::TestResult;
use crate::retry::Retryable;
use crate::schema::ActionKind;

/// A raw step from the model does not fit the action vocabulary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown action kind '{0}'")]
    UnknownKind(String),
    #[error("{kind} step is missing required field '{field}'")]
    MissingField {
        kind: ActionKind,
        field: &'static str,
    },
    #[error("{kind} step does not accept field '{field}'")]
    UnexpectedField {
        kind: ActionKind,
        field: &'static str,
    },
    #[error("{kind} step has an empty '{field}'")]
    EmptyField {
        kind: ActionKind,
        field: &'static str,
    },
    #[error("timeout_ms must be a positive integer, got {0}")]
    InvalidTimeout(String),
    #[error("invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error("invalid value for {kind} step: {reason}")]
    InvalidValue { kind: ActionKind, reason: String },
    #[error("malformed step: {0}")]
    Malformed(String),
    #[error("plan contains no steps")]
    EmptyPlan,
}

/// One rejected candidate, positioned in the model's output when possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepIssue {
    pub index: Option<usize>,
    pub error: ValidationError,
}

impl fmt::Display for StepIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "step {}: {}", index + 1, self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

fn join_issues(issues: &[StepIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("missing API key (set {0})")]
    MissingApiKey(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        match self {
            ProviderError::MissingApiKey(_) | ProviderError::InvalidResponse(_) => false,
            ProviderError::Http(error) => {
                error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
            }
            ProviderError::HttpStatus { status, .. } => {
                matches!(*status, 408 | 409 | 425 | 429) || *status >= 500
            }
        }
    }
}

/// No executable plan could be produced; the plan never reaches the browser.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("language model unavailable after {attempts} attempt(s): {source}")]
    Provider {
        attempts: u32,
        #[source]
        source: ProviderError,
    },
    #[error("no valid plan after {rounds} round(s): {}", join_issues(.issues))]
    InvalidPlan { rounds: u32, issues: Vec<StepIssue> },
}

/// Failure reported by a [`crate::driver::BrowserDriver`] call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    #[error("timed out after {timeout_ms} ms waiting for {operation}")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("element not found: {selector}")]
    ElementNotFound { selector: String },
    #[error("browser disconnected: {0}")]
    Disconnected(String),
    #[error("driver error: {0}")]
    Failed(String),
}

impl DriverError {
    /// Session-fatal errors abort the plan and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Disconnected(_))
    }
}

impl Retryable for DriverError {
    fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }
}

/// Why a single step attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("assertion failed on {target}: expected {expected}, found {actual}")]
    AssertionFailed {
        target: String,
        expected: String,
        actual: String,
    },
    #[error("artifact write failed: {0}")]
    Artifact(String),
}

impl StepError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StepError::Driver(error) if error.is_fatal())
    }
}

impl Retryable for StepError {
    fn is_retryable(&self) -> bool {
        match self {
            StepError::Driver(error) => error.is_retryable(),
            // The page may still be settling, so a mismatch is re-checked.
            StepError::AssertionFailed { .. } => true,
            StepError::Artifact(_) => false,
        }
    }
}

/// Errors that escape [`crate::agent::TestAgent`] to the caller.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Planning(#[from] PlanningError),
    #[error("browser session is closed")]
    SessionClosed,
    /// The browser went away mid-plan. The aborted result is kept for the
    /// report and the session has already been released.
    #[error("browser session lost: {}", .result.message)]
    SessionLost { result: Box<TestResult> },
    #[error("browser session failed: {0}")]
    Session(#[from] DriverError),
    #[error("artifact i/o failed: {0}")]
    Artifact(#[from] std::io::Error),
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_status_retry_selection() {
        let retryable = |status| ProviderError::HttpStatus {
            status,
            body: String::new(),
        };
        assert!(retryable(429).is_retryable());
        assert!(retryable(503).is_retryable());
        assert!(!retryable(400).is_retryable());
        assert!(!retryable(401).is_retryable());
        assert!(!ProviderError::MissingApiKey("OPENAI_API_KEY".into()).is_retryable());
    }

    #[test]
    fn disconnection_is_fatal_and_not_retried() {
        let error = StepError::from(DriverError::Disconnected("socket closed".into()));
        assert!(error.is_fatal());
        assert!(!error.is_retryable());

        let missing = StepError::from(DriverError::ElementNotFound {
            selector: "text=Join".into(),
        });
        assert!(!missing.is_fatal());
        assert!(missing.is_retryable());
    }

    #[test]
    fn planning_error_lists_every_issue() {
        let error = PlanningError::InvalidPlan {
            rounds: 2,
            issues: vec![
                StepIssue {
                    index: Some(1),
                    error: ValidationError::MissingField {
                        kind: ActionKind::Fill,
                        field: "value",
                    },
                },
                StepIssue {
                    index: None,
                    error: ValidationError::EmptyPlan,
                },
            ],
        };
        let text = error.to_string();
        assert!(text.contains("step 2: fill step is missing required field 'value'"));
        assert!(text.contains("plan contains no steps"));
    }
}
