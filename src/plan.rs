use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::schema::{ActionKind, ActionStep};

/// What the executor does after a step exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    #[default]
    Abort,
    Continue,
}

/// Per-plan failure handling. `assert` always aborts, whatever is configured.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicy {
    pub default: OnFailure,
    pub overrides: BTreeMap<ActionKind, OnFailure>,
}

impl FailurePolicy {
    pub fn continue_on_failure() -> Self {
        Self {
            default: OnFailure::Continue,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, kind: ActionKind, on_failure: OnFailure) -> Self {
        self.overrides.insert(kind, on_failure);
        self
    }

    pub fn on_failure(&self, kind: ActionKind) -> OnFailure {
        if kind == ActionKind::Assert {
            return OnFailure::Abort;
        }
        self.overrides.get(&kind).copied().unwrap_or(self.default)
    }
}

/// Ordered, validated steps derived from one description. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPlan {
    description: String,
    steps: Vec<ActionStep>,
    #[serde(default)]
    policy: FailurePolicy,
}

impl TestPlan {
    pub fn new(
        description: impl Into<String>,
        steps: Vec<ActionStep>,
    ) -> Result<Self, ValidationError> {
        if steps.is_empty() {
            return Err(ValidationError::EmptyPlan);
        }
        Ok(Self {
            description: description.into(),
            steps,
            policy: FailurePolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn steps(&self) -> &[ActionStep] {
        &self.steps
    }

    pub fn policy(&self) -> &FailurePolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn kinds(&self) -> Vec<ActionKind> {
        self.steps.iter().map(ActionStep::kind).collect()
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let plan: TestPlan = serde_json::from_str(raw)?;
        if plan.steps.is_empty() {
            return Err(serde::de::Error::custom(ValidationError::EmptyPlan));
        }
        Ok(plan)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RawStep, validate};

    #[test]
    fn assert_always_aborts() {
        let policy = FailurePolicy::continue_on_failure()
            .with_override(ActionKind::Assert, OnFailure::Continue);
        assert_eq!(policy.on_failure(ActionKind::Assert), OnFailure::Abort);
        assert_eq!(policy.on_failure(ActionKind::Click), OnFailure::Continue);
    }

    #[test]
    fn overrides_take_precedence_over_default() {
        let policy = FailurePolicy::default().with_override(ActionKind::Hover, OnFailure::Continue);
        assert_eq!(policy.on_failure(ActionKind::Hover), OnFailure::Continue);
        assert_eq!(policy.on_failure(ActionKind::Click), OnFailure::Abort);
    }

    #[test]
    fn empty_plans_are_rejected() {
        assert_eq!(TestPlan::new("nothing", Vec::new()), Err(ValidationError::EmptyPlan));
        assert!(TestPlan::from_json(r#"{"description":"x","steps":[]}"#).is_err());
    }

    #[test]
    fn plan_file_round_trips_with_policy() {
        let steps = vec![
            validate(&RawStep::new("navigate").value("https://example.com")).unwrap(),
            validate(&RawStep::new("click").target("text=Menu")).unwrap(),
        ];
        let plan = TestPlan::new("open menu", steps)
            .unwrap()
            .with_policy(FailurePolicy::default().with_override(ActionKind::Click, OnFailure::Continue));
        let json = plan.to_json_pretty().unwrap();
        assert_eq!(TestPlan::from_json(&json).unwrap(), plan);
    }

    #[test]
    fn plan_file_with_invalid_step_is_rejected() {
        let raw = r##"{"description":"x","steps":[{"kind":"select","target":"#size"}]}"##;
        assert!(TestPlan::from_json(raw).is_err());
    }
}
