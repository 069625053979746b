//! The closed vocabulary of browser actions a plan may contain.
//!
//! The model speaks [`RawStep`]; everything past the planner only ever sees
//! [`ActionStep`], which can only be built by [`validate`]. Serialising an
//! `ActionStep` goes back through `RawStep`, and deserialising one re-runs
//! validation, so a plan loaded from disk is held to the same rules as a
//! plan fresh from the model.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Click,
    Fill,
    Select,
    Check,
    Uncheck,
    Hover,
    Wait,
    Assert,
    Screenshot,
    Extract,
}

/// Whether a kind needs, tolerates, or rejects a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRule {
    Required,
    Optional,
    Forbidden,
}

impl ActionKind {
    pub const ALL: [ActionKind; 11] = [
        ActionKind::Navigate,
        ActionKind::Click,
        ActionKind::Fill,
        ActionKind::Select,
        ActionKind::Check,
        ActionKind::Uncheck,
        ActionKind::Hover,
        ActionKind::Wait,
        ActionKind::Assert,
        ActionKind::Screenshot,
        ActionKind::Extract,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Navigate => "navigate",
            ActionKind::Click => "click",
            ActionKind::Fill => "fill",
            ActionKind::Select => "select",
            ActionKind::Check => "check",
            ActionKind::Uncheck => "uncheck",
            ActionKind::Hover => "hover",
            ActionKind::Wait => "wait",
            ActionKind::Assert => "assert",
            ActionKind::Screenshot => "screenshot",
            ActionKind::Extract => "extract",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
    }

    pub fn target_rule(self) -> FieldRule {
        match self {
            ActionKind::Navigate | ActionKind::Wait | ActionKind::Screenshot => {
                FieldRule::Forbidden
            }
            _ => FieldRule::Required,
        }
    }

    pub fn value_rule(self) -> FieldRule {
        match self {
            ActionKind::Navigate
            | ActionKind::Fill
            | ActionKind::Select
            | ActionKind::Wait
            | ActionKind::Assert => FieldRule::Required,
            ActionKind::Screenshot | ActionKind::Extract => FieldRule::Optional,
            ActionKind::Click | ActionKind::Check | ActionKind::Uncheck | ActionKind::Hover => {
                FieldRule::Forbidden
            }
        }
    }

    fn value_hint(self) -> &'static str {
        match self {
            ActionKind::Navigate => "absolute or site-relative URL",
            ActionKind::Fill => "text to type",
            ActionKind::Select => "option value or visible label",
            ActionKind::Wait => {
                "duration (\"2s\", \"500ms\") or condition (\"visible:<selector>\", \"hidden:<selector>\", \"url:<part>\", \"text:<part>\")"
            }
            ActionKind::Assert => {
                "\"visible\", \"hidden\", \"enabled\", \"disabled\", \"text:<part>\", \"equals:<text>\" or \"value:<text>\""
            }
            ActionKind::Screenshot => "optional label",
            ActionKind::Extract => {
                "optional variable name, prefix with \"html:\" to capture markup"
            }
            ActionKind::Click | ActionKind::Check | ActionKind::Uncheck | ActionKind::Hover => {
                "none"
            }
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic locator: visible text, ARIA role (+ accessible name), or CSS.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    Css(String),
    Text(String),
    Role { role: String, name: Option<String> },
}

const LOCATOR_PREFIXES: [&str; 3] = ["text=", "css=", "role="];

fn strip_quotes(raw: &str) -> &str {
    let trimmed = raw.trim();
    for quote in ['"', '\''] {
        if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
            return &trimmed[1..trimmed.len() - 1];
        }
    }
    trimmed
}

impl Selector {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidSelector {
            selector: raw.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("selector is empty"));
        }

        if let Some(rest) = trimmed.strip_prefix("text=") {
            let text = strip_quotes(rest);
            if text.is_empty() {
                return Err(invalid("text locator has no text"));
            }
            return Ok(Selector::Text(text.to_string()));
        }

        if let Some(rest) = trimmed.strip_prefix("css=") {
            let css = rest.trim();
            if css.is_empty() {
                return Err(invalid("css locator has no expression"));
            }
            return Ok(Selector::Css(css.to_string()));
        }

        if let Some(rest) = trimmed.strip_prefix("role=") {
            let rest = rest.trim();
            let (role, name) = match rest.split_once('[') {
                Some((role, attrs)) => {
                    let attrs = attrs
                        .strip_suffix(']')
                        .ok_or_else(|| invalid("role locator is missing ']'"))?;
                    let name = attrs
                        .trim()
                        .strip_prefix("name=")
                        .ok_or_else(|| invalid("role locator only supports [name=...]"))?;
                    (role.trim(), Some(strip_quotes(name).to_string()))
                }
                None => (rest, None),
            };
            if role.is_empty() || !role.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(invalid("role must be a plain ARIA role name"));
            }
            return Ok(Selector::Role {
                role: role.to_ascii_lowercase(),
                name: name.filter(|name| !name.is_empty()),
            });
        }

        Ok(Selector::Css(trimmed.to_string()))
    }

    /// Canonical textual form; `Selector::parse` of it yields `self`.
    pub fn locator(&self) -> String {
        match self {
            Selector::Css(css) if LOCATOR_PREFIXES.iter().any(|prefix| css.starts_with(prefix)) => {
                format!("css={css}")
            }
            Selector::Css(css) => css.clone(),
            // Quote text that would otherwise lose whitespace or a quote pair.
            Selector::Text(text) if strip_quotes(text) != text => format!("text=\"{text}\""),
            Selector::Text(text) => format!("text={text}"),
            Selector::Role { role, name: None } => format!("role={role}"),
            Selector::Role {
                role,
                name: Some(name),
            } => format!("role={role}[name=\"{name}\"]"),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.locator())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitCondition {
    Visible(Selector),
    Hidden(Selector),
    Attached(Selector),
    Detached(Selector),
    Enabled(Selector),
    Disabled(Selector),
    UrlContains(String),
    TextPresent(String),
}

impl WaitCondition {
    fn parse(raw: &str) -> Option<Result<Self, ValidationError>> {
        let (prefix, rest) = raw.split_once(':')?;
        let rest = rest.trim();
        let selector = || Selector::parse(rest);
        let condition = match prefix.trim().to_ascii_lowercase().as_str() {
            "visible" => selector().map(WaitCondition::Visible),
            "hidden" => selector().map(WaitCondition::Hidden),
            "attached" => selector().map(WaitCondition::Attached),
            "detached" => selector().map(WaitCondition::Detached),
            "enabled" => selector().map(WaitCondition::Enabled),
            "disabled" => selector().map(WaitCondition::Disabled),
            "url" if !rest.is_empty() => Ok(WaitCondition::UrlContains(rest.to_string())),
            "text" if !rest.is_empty() => Ok(WaitCondition::TextPresent(rest.to_string())),
            _ => return None,
        };
        Some(condition)
    }

    pub fn to_value(&self) -> String {
        match self {
            WaitCondition::Visible(selector) => format!("visible:{selector}"),
            WaitCondition::Hidden(selector) => format!("hidden:{selector}"),
            WaitCondition::Attached(selector) => format!("attached:{selector}"),
            WaitCondition::Detached(selector) => format!("detached:{selector}"),
            WaitCondition::Enabled(selector) => format!("enabled:{selector}"),
            WaitCondition::Disabled(selector) => format!("disabled:{selector}"),
            WaitCondition::UrlContains(part) => format!("url:{part}"),
            WaitCondition::TextPresent(part) => format!("text:{part}"),
        }
    }
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_value())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitSpec {
    Duration(Duration),
    Condition(WaitCondition),
}

fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim().to_ascii_lowercase();
    let (number, scale_ms) = if let Some(ms) = raw.strip_suffix("ms") {
        (ms, 1.0)
    } else if let Some(secs) = raw.strip_suffix('s') {
        (secs, 1_000.0)
    } else {
        (raw.as_str(), 1_000.0)
    };
    let value: f64 = number.trim().parse().ok()?;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    Some(Duration::from_millis((value * scale_ms).round() as u64))
}

impl WaitSpec {
    fn parse(raw: &str) -> Result<Self, ValidationError> {
        if let Some(condition) = WaitCondition::parse(raw) {
            return condition.map(WaitSpec::Condition);
        }
        parse_duration(raw)
            .filter(|duration| !duration.is_zero())
            .map(WaitSpec::Duration)
            .ok_or_else(|| ValidationError::InvalidValue {
                kind: ActionKind::Wait,
                reason: format!("'{raw}' is neither a positive duration nor a known condition"),
            })
    }

    fn to_value(&self) -> String {
        match self {
            WaitSpec::Duration(duration) => format!("{}ms", duration.as_millis()),
            WaitSpec::Condition(condition) => condition.to_value(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    Visible,
    Hidden,
    Enabled,
    Disabled,
    TextContains(String),
    TextEquals(String),
    ValueEquals(String),
}

impl Expectation {
    fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "visible" => return Ok(Expectation::Visible),
            "hidden" => return Ok(Expectation::Hidden),
            "enabled" => return Ok(Expectation::Enabled),
            "disabled" => return Ok(Expectation::Disabled),
            _ => {}
        }

        let prefixed = trimmed.split_once(':').and_then(|(prefix, rest)| {
            let rest = rest.trim().to_string();
            match prefix.trim().to_ascii_lowercase().as_str() {
                "text" | "contains" => Some(Expectation::TextContains(rest)),
                "equals" => Some(Expectation::TextEquals(rest)),
                "value" => Some(Expectation::ValueEquals(rest)),
                _ => None,
            }
        });
        let expectation = prefixed.unwrap_or_else(|| Expectation::TextContains(trimmed.to_string()));
        match &expectation {
            Expectation::TextContains(text) | Expectation::TextEquals(text) if text.is_empty() => {
                Err(ValidationError::InvalidValue {
                    kind: ActionKind::Assert,
                    reason: "expected text is empty".to_string(),
                })
            }
            _ => Ok(expectation),
        }
    }

    pub fn to_value(&self) -> String {
        match self {
            Expectation::Visible => "visible".to_string(),
            Expectation::Hidden => "hidden".to_string(),
            Expectation::Enabled => "enabled".to_string(),
            Expectation::Disabled => "disabled".to_string(),
            Expectation::TextContains(text) => format!("text:{text}"),
            Expectation::TextEquals(text) => format!("equals:{text}"),
            Expectation::ValueEquals(text) => format!("value:{text}"),
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_value())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractFormat {
    #[default]
    Text,
    Html,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Navigate {
        url: String,
    },
    Click {
        target: Selector,
    },
    Fill {
        target: Selector,
        text: String,
    },
    Select {
        target: Selector,
        option: String,
    },
    Check {
        target: Selector,
    },
    Uncheck {
        target: Selector,
    },
    Hover {
        target: Selector,
    },
    Wait {
        until: WaitSpec,
    },
    Assert {
        target: Selector,
        expect: Expectation,
    },
    Screenshot {
        label: Option<String>,
    },
    Extract {
        target: Selector,
        variable: Option<String>,
        format: ExtractFormat,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Navigate { .. } => ActionKind::Navigate,
            Action::Click { .. } => ActionKind::Click,
            Action::Fill { .. } => ActionKind::Fill,
            Action::Select { .. } => ActionKind::Select,
            Action::Check { .. } => ActionKind::Check,
            Action::Uncheck { .. } => ActionKind::Uncheck,
            Action::Hover { .. } => ActionKind::Hover,
            Action::Wait { .. } => ActionKind::Wait,
            Action::Assert { .. } => ActionKind::Assert,
            Action::Screenshot { .. } => ActionKind::Screenshot,
            Action::Extract { .. } => ActionKind::Extract,
        }
    }

    pub fn target(&self) -> Option<&Selector> {
        match self {
            Action::Click { target }
            | Action::Fill { target, .. }
            | Action::Select { target, .. }
            | Action::Check { target }
            | Action::Uncheck { target }
            | Action::Hover { target }
            | Action::Assert { target, .. }
            | Action::Extract { target, .. } => Some(target),
            Action::Navigate { .. } | Action::Wait { .. } | Action::Screenshot { .. } => None,
        }
    }

    fn value(&self) -> Option<String> {
        match self {
            Action::Navigate { url } => Some(url.clone()),
            Action::Fill { text, .. } => Some(text.clone()),
            Action::Select { option, .. } => Some(option.clone()),
            Action::Wait { until } => Some(until.to_value()),
            Action::Assert { expect, .. } => Some(expect.to_value()),
            Action::Screenshot { label } => label.clone(),
            Action::Extract {
                variable, format, ..
            } => match (format, variable) {
                (ExtractFormat::Text, variable) => variable.clone(),
                (ExtractFormat::Html, Some(variable)) => Some(format!("html:{variable}")),
                (ExtractFormat::Html, None) => Some("html:".to_string()),
            },
            Action::Click { .. }
            | Action::Check { .. }
            | Action::Uncheck { .. }
            | Action::Hover { .. } => None,
        }
    }
}

/// A validated step. Only [`validate`] constructs one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub struct ActionStep {
    action: Action,
    timeout_ms: Option<u64>,
    description: Option<String>,
}

impl ActionStep {
    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn kind(&self) -> ActionKind {
        self.action.kind()
    }

    pub fn target(&self) -> Option<&Selector> {
        self.action.target()
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        self.timeout_ms
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// One-line form used in logs, events and reports.
    pub fn summary(&self) -> String {
        let mut summary = self.kind().to_string();
        if let Some(target) = self.target() {
            summary.push(' ');
            summary.push_str(&target.locator());
        }
        if let Some(value) = self.action.value() {
            if !value.is_empty() {
                summary.push_str(&format!(" \"{value}\""));
            }
        }
        summary
    }

    pub fn to_raw(&self) -> RawStep {
        RawStep::from(self.clone())
    }
}

/// A step as the model (or a plan file) writes it, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawStep {
    #[serde(default, alias = "action", alias = "action_type")]
    pub kind: Option<String>,
    #[serde(default, alias = "selector", skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(
        default,
        alias = "timeout",
        alias = "timeoutMs",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout_ms: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RawStep {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: impl Into<Value>) -> Self {
        self.timeout_ms = Some(timeout_ms.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl From<ActionStep> for RawStep {
    fn from(step: ActionStep) -> Self {
        RawStep {
            kind: Some(step.kind().as_str().to_string()),
            target: step.target().map(Selector::locator),
            value: step.action.value().map(Value::String),
            timeout_ms: step.timeout_ms.map(Value::from),
            description: step.description,
        }
    }
}

impl TryFrom<RawStep> for ActionStep {
    type Error = ValidationError;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        validate(&raw)
    }
}

fn scalar_text(kind: ActionKind, value: &Value) -> Result<Option<String>, ValidationError> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) => Ok(Some(text.clone())),
        Value::Number(number) => Ok(Some(number.to_string())),
        Value::Bool(flag) => Ok(Some(flag.to_string())),
        Value::Array(_) | Value::Object(_) => Err(ValidationError::InvalidValue {
            kind,
            reason: "value must be a string, number or boolean".to_string(),
        }),
    }
}

fn is_variable_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_extract_value(
    value: Option<&str>,
) -> Result<(Option<String>, ExtractFormat), ValidationError> {
    let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok((None, ExtractFormat::Text));
    };
    let (format, name) = match value.split_once(':') {
        Some((prefix, name)) if prefix.eq_ignore_ascii_case("html") => {
            (ExtractFormat::Html, name.trim())
        }
        Some((prefix, name)) if prefix.eq_ignore_ascii_case("text") => {
            (ExtractFormat::Text, name.trim())
        }
        _ => (ExtractFormat::Text, value),
    };
    if name.is_empty() {
        return Ok((None, format));
    }
    if !is_variable_name(name) {
        return Err(ValidationError::InvalidValue {
            kind: ActionKind::Extract,
            reason: format!("variable name '{name}' may only use letters, digits and '_'"),
        });
    }
    Ok((Some(name.to_string()), format))
}

/// Checks one raw step against the vocabulary. Pure; no field is ever
/// defaulted in to make an invalid step pass.
pub fn validate(raw: &RawStep) -> Result<ActionStep, ValidationError> {
    let kind_text = raw
        .kind
        .as_deref()
        .map(str::trim)
        .filter(|kind| !kind.is_empty())
        .ok_or_else(|| ValidationError::Malformed("step has no 'kind'".to_string()))?;
    let kind =
        ActionKind::parse(kind_text).ok_or_else(|| ValidationError::UnknownKind(kind_text.to_string()))?;

    let target = match (kind.target_rule(), raw.target.as_deref()) {
        (FieldRule::Forbidden, Some(_)) => {
            return Err(ValidationError::UnexpectedField {
                kind,
                field: "target",
            });
        }
        (FieldRule::Required, None) => {
            return Err(ValidationError::MissingField {
                kind,
                field: "target",
            });
        }
        (_, Some(target)) if target.trim().is_empty() => {
            return Err(ValidationError::EmptyField {
                kind,
                field: "target",
            });
        }
        (_, Some(target)) => Some(Selector::parse(target)?),
        (_, None) => None,
    };

    let value = match raw.value.as_ref() {
        Some(value) => scalar_text(kind, value)?,
        None => None,
    };
    match (kind.value_rule(), value.as_deref()) {
        (FieldRule::Forbidden, Some(value)) if !value.trim().is_empty() => {
            return Err(ValidationError::UnexpectedField {
                kind,
                field: "value",
            });
        }
        (FieldRule::Required, None) => {
            return Err(ValidationError::MissingField {
                kind,
                field: "value",
            });
        }
        (FieldRule::Required, Some(value)) if value.trim().is_empty() && kind != ActionKind::Fill => {
            return Err(ValidationError::EmptyField {
                kind,
                field: "value",
            });
        }
        _ => {}
    }

    let timeout_ms = match raw.timeout_ms.as_ref() {
        None | Some(Value::Null) => None,
        Some(timeout) => match timeout.as_u64() {
            Some(ms) if ms > 0 => Some(ms),
            _ => return Err(ValidationError::InvalidTimeout(timeout.to_string())),
        },
    };

    // Rules above guarantee presence; these fall back only to satisfy types.
    let need_target = || {
        target.clone().ok_or(ValidationError::MissingField {
            kind,
            field: "target",
        })
    };
    let need_value = || {
        value.clone().ok_or(ValidationError::MissingField {
            kind,
            field: "value",
        })
    };

    let action = match kind {
        ActionKind::Navigate => Action::Navigate {
            url: need_value()?.trim().to_string(),
        },
        ActionKind::Click => Action::Click {
            target: need_target()?,
        },
        ActionKind::Fill => Action::Fill {
            target: need_target()?,
            text: need_value()?,
        },
        ActionKind::Select => Action::Select {
            target: need_target()?,
            option: need_value()?.trim().to_string(),
        },
        ActionKind::Check => Action::Check {
            target: need_target()?,
        },
        ActionKind::Uncheck => Action::Uncheck {
            target: need_target()?,
        },
        ActionKind::Hover => Action::Hover {
            target: need_target()?,
        },
        ActionKind::Wait => Action::Wait {
            until: WaitSpec::parse(&need_value()?)?,
        },
        ActionKind::Assert => Action::Assert {
            target: need_target()?,
            expect: Expectation::parse(&need_value()?)?,
        },
        ActionKind::Screenshot => Action::Screenshot {
            label: value
                .as_deref()
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(str::to_string),
        },
        ActionKind::Extract => {
            let (variable, format) = parse_extract_value(value.as_deref())?;
            Action::Extract {
                target: need_target()?,
                variable,
                format,
            }
        }
    };

    Ok(ActionStep {
        action,
        timeout_ms,
        description: raw
            .description
            .as_deref()
            .map(str::trim)
            .filter(|description| !description.is_empty())
            .map(str::to_string),
    })
}

/// Vocabulary description embedded in planning prompts.
pub fn schema_prompt() -> String {
    let mut lines = vec![
        "Each step is a JSON object with fields: kind, target, value, timeout_ms, description."
            .to_string(),
        "target is a locator: text=<visible text>, role=<aria role>[name=\"<accessible name>\"], or a CSS selector."
            .to_string(),
        "Allowed kinds:".to_string(),
    ];
    for kind in ActionKind::ALL {
        let target = match kind.target_rule() {
            FieldRule::Required => "target required",
            FieldRule::Optional => "target optional",
            FieldRule::Forbidden => "no target",
        };
        let value = match kind.value_rule() {
            FieldRule::Required => format!("value required: {}", kind.value_hint()),
            FieldRule::Optional => format!("value optional: {}", kind.value_hint()),
            FieldRule::Forbidden => "no value".to_string(),
        };
        lines.push(format!("- {kind}: {target}; {value}"));
    }
    lines.push(
        "timeout_ms, when given, is a positive integer in milliseconds; use null otherwise."
            .to_string(),
    );
    lines.join("\n")
}

/// JSON schema handed to the model as its structured-output constraint.
pub fn structured_output_schema() -> Value {
    let kinds: Vec<&str> = ActionKind::ALL.iter().map(|kind| kind.as_str()).collect();
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["steps"],
        "properties": {
            "steps": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["kind", "target", "value", "timeout_ms", "description"],
                    "properties": {
                        "kind": { "type": "string", "enum": kinds },
                        "target": { "type": ["string", "null"] },
                        "value": { "type": ["string", "null"] },
                        "timeout_ms": { "type": ["integer", "null"] },
                        "description": { "type": "string" }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(kind: &str) -> RawStep {
        RawStep::new(kind)
    }

    #[test]
    fn required_fields_are_enforced_per_kind() {
        for kind in ActionKind::ALL {
            let mut raw = step(kind.as_str());
            if kind.target_rule() == FieldRule::Required {
                raw = raw.target("#thing");
            }
            if kind.value_rule() == FieldRule::Required {
                raw = raw.value(match kind {
                    ActionKind::Navigate => "https://example.com",
                    ActionKind::Wait => "1s",
                    ActionKind::Assert => "visible",
                    _ => "x",
                });
            }
            assert!(validate(&raw).is_ok(), "{kind} with required fields should pass");

            if kind.target_rule() == FieldRule::Required {
                let mut missing = raw.clone();
                missing.target = None;
                assert_eq!(
                    validate(&missing),
                    Err(ValidationError::MissingField {
                        kind,
                        field: "target"
                    })
                );
            }
            if kind.value_rule() == FieldRule::Required {
                let mut missing = raw.clone();
                missing.value = None;
                assert_eq!(
                    validate(&missing),
                    Err(ValidationError::MissingField {
                        kind,
                        field: "value"
                    })
                );
            }
        }
    }

    #[test]
    fn null_value_counts_as_missing() {
        let raw = step("fill").target("#email").value(Value::Null);
        assert_eq!(
            validate(&raw),
            Err(ValidationError::MissingField {
                kind: ActionKind::Fill,
                field: "value"
            })
        );
    }

    #[test]
    fn rejects_unknown_kind_and_blank_target() {
        assert_eq!(
            validate(&step("scroll").target("body")),
            Err(ValidationError::UnknownKind("scroll".into()))
        );
        assert_eq!(
            validate(&step("click").target("   ")),
            Err(ValidationError::EmptyField {
                kind: ActionKind::Click,
                field: "target"
            })
        );
        assert!(matches!(
            validate(&RawStep::default()),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_target_on_navigate_rather_than_guessing() {
        let raw = step("navigate").target("https://example.com");
        assert_eq!(
            validate(&raw),
            Err(ValidationError::UnexpectedField {
                kind: ActionKind::Navigate,
                field: "target"
            })
        );
    }

    #[test]
    fn timeout_must_be_positive_integer() {
        let base = || step("click").target("#go");
        assert_eq!(validate(&base().timeout_ms(2_500)).unwrap().timeout_ms(), Some(2_500));
        for bad in [json!(0), json!(-5), json!(1.5), json!("100")] {
            assert!(
                matches!(
                    validate(&base().timeout_ms(bad.clone())),
                    Err(ValidationError::InvalidTimeout(_))
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn validate_is_idempotent_on_valid_steps() {
        let raws = [
            step("navigate").value("https://example.com/menu"),
            step("click").target("text=Join My Rewards").description("join"),
            step("fill").target("#email").value("a@b.c").timeout_ms(4_000),
            step("select").target("select#size").value("Large"),
            step("check").target("role=checkbox[name=\"Terms\"]"),
            step("wait").value(3),
            step("wait").value("visible: .inventory_list"),
            step("assert").target(".cart").value("Contains: 1 item"),
            step("screenshot").value("landing"),
            step("extract").target("h1").value("html:headline"),
            step("extract").target(".price"),
            step("click").target("css=text=Sale"),
            step("click").target("css=role=nav"),
            step("hover").target("text=\"'Quoted'\""),
            step("hover").target("text=\"\"Twice\"\""),
            step("click").target("text=\"  padded \""),
            step("click").target("role=button[name=\"'Buy now'\"]"),
            step("wait").value("visible:css=text=Sale"),
            step("assert").target("text=\"'Total'\"").value("visible"),
        ];
        for raw in raws {
            let first = validate(&raw).unwrap();
            let second = validate(&first.to_raw()).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn serde_round_trip_revalidates() {
        let bad = json!({ "kind": "fill", "target": "#q" });
        assert!(serde_json::from_value::<ActionStep>(bad).is_err());

        let good = json!({ "action": "click", "selector": "text=View Full Menu" });
        let step: ActionStep = serde_json::from_value(good).unwrap();
        assert_eq!(
            step.target(),
            Some(&Selector::Text("View Full Menu".into()))
        );
    }

    #[test]
    fn selector_forms() {
        assert_eq!(
            Selector::parse("text='Join My Rewards'").unwrap(),
            Selector::Text("Join My Rewards".into())
        );
        assert_eq!(
            Selector::parse("role=Button[name=\"Sign in\"]").unwrap(),
            Selector::Role {
                role: "button".into(),
                name: Some("Sign in".into())
            }
        );
        assert_eq!(
            Selector::parse("input[data-test='username']").unwrap(),
            Selector::Css("input[data-test='username']".into())
        );
        assert!(Selector::parse("role=button[label=x]").is_err());
        assert!(Selector::parse("text=").is_err());
    }

    #[test]
    fn wait_values() {
        let wait = |value: &str| match validate(&step("wait").value(value)).map(|s| s.action().clone()) {
            Ok(Action::Wait { until }) => Ok(until),
            Ok(other) => panic!("unexpected action {other:?}"),
            Err(error) => Err(error),
        };
        assert_eq!(wait("500ms"), Ok(WaitSpec::Duration(Duration::from_millis(500))));
        assert_eq!(wait("1.5s"), Ok(WaitSpec::Duration(Duration::from_millis(1_500))));
        assert_eq!(
            wait("url:/checkout"),
            Ok(WaitSpec::Condition(WaitCondition::UrlContains("/checkout".into())))
        );
        assert!(wait("0").is_err());
        assert!(wait("soon").is_err());
    }

    #[test]
    fn assert_and_extract_values() {
        let assert = validate(&step("assert").target("#total").value("equals:$4.99")).unwrap();
        assert_eq!(
            assert.action(),
            &Action::Assert {
                target: Selector::Css("#total".into()),
                expect: Expectation::TextEquals("$4.99".into())
            }
        );

        let extract = validate(&step("extract").target("#total").value("order total"));
        assert!(matches!(extract, Err(ValidationError::InvalidValue { .. })));
    }

    #[test]
    fn structured_schema_lists_every_kind() {
        let schema = structured_output_schema();
        let kinds = schema["properties"]["steps"]["items"]["properties"]["kind"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(kinds.len(), ActionKind::ALL.len());
        let prompt = schema_prompt();
        for kind in ActionKind::ALL {
            assert!(prompt.contains(&format!("- {kind}:")));
        }
    }
}
