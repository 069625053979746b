//! Free text in, validated [`TestPlan`] out. The planner never touches the
//! browser.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::brain::{ChatMessage, LanguageModel, Prompt};
use crate::config::PlannerConfig;
use crate::context::PageContext;
use crate::error::{PlanningError, StepIssue, ValidationError};
use crate::plan::TestPlan;
use crate::schema::{ActionStep, RawStep, schema_prompt, structured_output_schema, validate};

const SYSTEM_PROMPT: &str = "You are a web test planner. You turn a tester's description of a user journey into an ordered list of browser steps that a strict executor will replay exactly.";

const RULES: &str = r#"Rules:
1. Return ONLY a JSON object of the form {"steps": [...]}. No markdown, no explanation.
2. One step per user-visible action, in the order the description gives them.
3. Prefer text=<visible text> for elements named by their text, role=<role>[name="..."] for controls, CSS only for ids or data attributes seen in the page outline.
4. Add assert steps only for checks the description asks for.
5. Reference previously extracted variables as {{name}}.
6. Never invent steps the description does not ask for."#;

const NAVIGATION_PHRASES: [&str; 5] = ["go to", "navigate", "visit", "open http", "open www"];

pub struct Planner {
    model: Arc<dyn LanguageModel>,
    config: PlannerConfig,
    base_url: Option<String>,
    schema: Value,
}

impl Planner {
    pub fn new(model: Arc<dyn LanguageModel>, config: PlannerConfig) -> Self {
        Self {
            model,
            config,
            base_url: None,
            schema: structured_output_schema(),
        }
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }

    /// On a fresh session with a base URL, descriptions that do not say
    /// where to go are anchored to the base URL.
    pub fn instruction(&self, description: &str, context: &PageContext) -> String {
        let description = description.trim();
        let Some(base) = &self.base_url else {
            return description.to_string();
        };
        let lower = description.to_ascii_lowercase();
        let navigates = NAVIGATION_PHRASES
            .iter()
            .any(|phrase| lower.starts_with(phrase));
        if context.current_url.is_some() || navigates {
            description.to_string()
        } else {
            format!("Go to {base} and {description}")
        }
    }

    fn initial_prompt(&self, instruction: &str, context: &PageContext) -> Prompt {
        let system = format!("{SYSTEM_PROMPT}\n\n{}\n\n{RULES}", schema_prompt());
        let user = format!(
            "{}\n\nDescription:\n{instruction}\n\nReturn the steps.",
            context.prompt_section()
        );
        Prompt::new(system, user)
    }

    pub async fn plan(
        &self,
        description: &str,
        context: &PageContext,
    ) -> Result<TestPlan, PlanningError> {
        let instruction = self.instruction(description, context);
        let mut prompt = self.initial_prompt(&instruction, context);
        let mut round = 0;
        loop {
            round += 1;
            let raw = self.ask(&prompt).await?;
            let issues = match interpret(&raw) {
                Ok(steps) => {
                    info!(round, steps = steps.len(), "plan accepted");
                    return TestPlan::new(description.trim(), steps).map_err(|error| {
                        PlanningError::InvalidPlan {
                            rounds: round,
                            issues: vec![StepIssue { index: None, error }],
                        }
                    });
                }
                Err(issues) => issues,
            };

            if round > self.config.repair_attempts {
                warn!(rounds = round, issues = issues.len(), "giving up on plan");
                return Err(PlanningError::InvalidPlan {
                    rounds: round,
                    issues,
                });
            }
            warn!(round, issues = issues.len(), "plan rejected; asking for a repair");
            prompt.push(ChatMessage::assistant(raw));
            prompt.push(ChatMessage::user(repair_request(&issues)));
        }
    }

    async fn ask(&self, prompt: &Prompt) -> Result<String, PlanningError> {
        let attempted = self
            .config
            .provider_retry
            .run_observed(
                None,
                move |_| self.model.complete(prompt, &self.schema),
                |attempt, error, delay| {
                    warn!(attempt, delay_ms = delay.as_millis() as u64, %error, "model call failed; retrying");
                },
            )
            .await;
        let attempts = attempted.attempts;
        attempted
            .result
            .map_err(|source| PlanningError::Provider { attempts, source })
    }
}

fn repair_request(issues: &[StepIssue]) -> String {
    let mut message =
        String::from("Your previous answer was rejected by the step validator:\n");
    for issue in issues {
        message.push_str(&format!("- {issue}\n"));
    }
    message.push_str("Return the complete corrected plan as {\"steps\": [...]} only.");
    message
}

/// Drops markdown fences and any chatter around the JSON payload.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body = after.strip_prefix("json").unwrap_or(after);
        let body = match body.find("```") {
            Some(end) => &body[..end],
            None => body,
        };
        return body.trim();
    }
    trimmed
}

fn parse_json(raw: &str) -> Result<Value, ValidationError> {
    let text = strip_fences(raw);
    if let Ok(value) = serde_json::from_str(text) {
        return Ok(value);
    }
    let start = text.find(['[', '{']);
    let end = text.rfind([']', '}']);
    match (start, end) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&text[start..=end])
            .map_err(|error| ValidationError::Malformed(format!("response is not JSON: {error}"))),
        _ => Err(ValidationError::Malformed(
            "response contains no JSON".to_string(),
        )),
    }
}

fn candidate_items(value: Value) -> Result<Vec<Value>, ValidationError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut object) => {
            for key in ["steps", "actions"] {
                match object.remove(key) {
                    Some(Value::Array(items)) => return Ok(items),
                    Some(_) => {
                        return Err(ValidationError::Malformed(format!(
                            "'{key}' is not an array"
                        )));
                    }
                    None => {}
                }
            }
            if ["kind", "action", "action_type"]
                .iter()
                .any(|key| object.contains_key(*key))
            {
                Ok(vec![Value::Object(object)])
            } else {
                Err(ValidationError::Malformed(
                    "expected a step list under 'steps'".to_string(),
                ))
            }
        }
        other => Err(ValidationError::Malformed(format!(
            "expected an object or array, got {other}"
        ))),
    }
}

/// Parses a raw model reply into candidate steps.
pub fn parse_candidates(raw: &str) -> Result<Vec<RawStep>, Vec<StepIssue>> {
    let whole = |error| vec![StepIssue { index: None, error }];
    let items = parse_json(raw)
        .and_then(candidate_items)
        .map_err(whole)?;
    if items.is_empty() {
        return Err(whole(ValidationError::EmptyPlan));
    }

    let mut steps = Vec::with_capacity(items.len());
    let mut issues = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<RawStep>(item) {
            Ok(step) => steps.push(step),
            Err(error) => issues.push(StepIssue {
                index: Some(index),
                error: ValidationError::Malformed(error.to_string()),
            }),
        }
    }
    if issues.is_empty() { Ok(steps) } else { Err(issues) }
}

/// Parse then validate; every rejected candidate is reported, not just the
/// first.
pub fn interpret(raw: &str) -> Result<Vec<ActionStep>, Vec<StepIssue>> {
    let candidates = parse_candidates(raw)?;
    let mut steps = Vec::with_capacity(candidates.len());
    let mut issues = Vec::new();
    for (index, candidate) in candidates.iter().enumerate() {
        match validate(candidate) {
            Ok(step) => steps.push(step),
            Err(error) => issues.push(StepIssue {
                index: Some(index),
                error,
            }),
        }
    }
    if issues.is_empty() { Ok(steps) } else { Err(issues) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerConfig;
    use crate::error::ProviderError;
    use crate::retry::RetryPolicy;
    use crate::schema::ActionKind;
    use crate::testing::ScriptedModel;

    fn config() -> PlannerConfig {
        PlannerConfig {
            repair_attempts: 1,
            provider_retry: RetryPolicy::fixed(2, 1),
        }
    }

    #[test]
    fn accepts_fenced_arrays_wrapped_objects_and_single_steps() {
        let fenced = "Here you go:\n```json\n[{\"action\": \"navigate\", \"value\": \"https://a.test\"}]\n```";
        assert_eq!(interpret(fenced).unwrap().len(), 1);

        let wrapped = r##"{"actions": [{"kind": "click", "selector": "#go"}, {"kind": "screenshot"}]}"##;
        let kinds: Vec<ActionKind> = interpret(wrapped).unwrap().iter().map(ActionStep::kind).collect();
        assert_eq!(kinds, vec![ActionKind::Click, ActionKind::Screenshot]);

        let single = r#"{"kind": "wait", "value": "2"}"#;
        assert_eq!(interpret(single).unwrap().len(), 1);
    }

    #[test]
    fn reports_every_rejected_candidate() {
        let raw = r##"{"steps": [{"kind": "click"}, {"kind": "teleport"}, {"kind": "click", "target": "#ok"}]}"##;
        let issues = interpret(raw).unwrap_err();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].index, Some(0));
        assert_eq!(
            issues[1].error,
            ValidationError::UnknownKind("teleport".to_string())
        );
    }

    #[test]
    fn empty_and_non_json_replies_are_rejected() {
        assert_eq!(
            interpret(r#"{"steps": []}"#).unwrap_err()[0].error,
            ValidationError::EmptyPlan
        );
        assert!(matches!(
            interpret("I cannot help with that").unwrap_err()[0].error,
            ValidationError::Malformed(_)
        ));
    }

    #[test]
    fn base_url_anchors_fresh_sessions_only() {
        let planner = Planner::new(Arc::new(ScriptedModel::default()), config())
            .with_base_url(Some("https://shop.test".to_string()));
        assert_eq!(
            planner.instruction("click Join", &PageContext::new()),
            "Go to https://shop.test and click Join"
        );
        assert_eq!(
            planner.instruction("Navigate to /menu", &PageContext::new()),
            "Navigate to /menu"
        );
        assert_eq!(
            planner.instruction("click Join", &PageContext::with_url("https://shop.test/")),
            "click Join"
        );
    }

    #[tokio::test]
    async fn repairs_once_with_the_validator_feedback() {
        let model = Arc::new(ScriptedModel::replying(&[
            r##"{"steps": [{"kind": "fill", "target": "#email"}]}"##,
            r##"{"steps": [{"kind": "fill", "target": "#email", "value": "a@b.test"}]}"##,
        ]));
        let planner = Planner::new(model.clone(), config());

        let plan = planner.plan("enter the email", &PageContext::new()).await.unwrap();
        assert_eq!(plan.kinds(), vec![ActionKind::Fill]);
        assert_eq!(model.calls(), 2);
        let repair = model.prompts()[1].last_user().unwrap().to_string();
        assert!(repair.contains("step 1: fill step is missing required field 'value'"));
    }

    #[tokio::test]
    async fn gives_up_after_the_repair_budget() {
        let bad = r#"{"steps": [{"kind": "click"}]}"#;
        let model = Arc::new(ScriptedModel::replying(&[bad, bad, bad]));
        let planner = Planner::new(model.clone(), config());

        let error = planner.plan("click it", &PageContext::new()).await.unwrap_err();
        assert!(matches!(error, PlanningError::InvalidPlan { rounds: 2, .. }));
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn provider_errors_are_retried_then_surfaced() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(ProviderError::HttpStatus { status: 503, body: "busy".into() }),
            Err(ProviderError::HttpStatus { status: 503, body: "busy".into() }),
            Err(ProviderError::HttpStatus { status: 503, body: "busy".into() }),
        ]));
        let planner = Planner::new(model.clone(), config());

        let error = planner.plan("anything", &PageContext::new()).await.unwrap_err();
        assert!(matches!(error, PlanningError::Provider { attempts: 3, .. }));
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn prompt_carries_schema_and_context() {
        let model = Arc::new(ScriptedModel::replying(&[
            r#"{"steps": [{"kind": "screenshot"}]}"#,
        ]));
        let planner = Planner::new(model.clone(), config());
        let mut context = PageContext::with_url("https://shop.test/menu");
        context.set_variable("price", "$4.99");

        planner.plan("take a screenshot", &context).await.unwrap();
        let prompt = &model.prompts()[0];
        assert!(prompt.messages[0].content.contains("Allowed kinds:"));
        let user = prompt.last_user().unwrap();
        assert!(user.contains("Current URL: https://shop.test/menu"));
        assert!(user.contains("price = $4.99"));
        assert!(user.contains("take a screenshot"));
    }
}
