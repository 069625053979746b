use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifacts::ArtifactStore;
use crate::plan::FailurePolicy;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "rpa-agent.toml";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Relative `navigate` targets resolve against this.
    pub base_url: Option<String>,
    pub model: ModelConfig,
    pub planner: PlannerConfig,
    pub executor: ExecutorConfig,
    pub browser: BrowserConfig,
    pub artifacts: ArtifactConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub api_base: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub temperature: f32,
    pub request_timeout_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: 0.2,
            request_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Re-prompts allowed after the first response fails validation.
    pub repair_attempts: u32,
    pub provider_retry: RetryPolicy,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            repair_attempts: 1,
            provider_retry: RetryPolicy {
                base_delay_ms: 500,
                max_delay_ms: 8_000,
                ..RetryPolicy::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub step_timeout_ms: u64,
    pub plan_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub screenshot_on_failure: bool,
    pub failure_screenshot_timeout_ms: u64,
    pub failure_policy: FailurePolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 10_000,
            plan_timeout_ms: 300_000,
            retry: RetryPolicy::default(),
            screenshot_on_failure: true,
            failure_screenshot_timeout_ms: 5_000,
            failure_policy: FailurePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    /// DevTools endpoint of an already running Chrome to attach to.
    pub attach_url: Option<String>,
    pub chrome_path: Option<PathBuf>,
    pub user_data_dir: Option<PathBuf>,
    pub sandbox: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub idle_timeout_secs: u64,
    /// Pause after navigation and clicks so the page can react.
    pub settle_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            attach_url: None,
            chrome_path: None,
            user_data_dir: None,
            sandbox: true,
            window_width: 1280,
            window_height: 900,
            idle_timeout_secs: 600,
            settle_ms: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub root: Option<PathBuf>,
    /// Write `plan.json` and `test_case.py` for every case.
    pub emit_scripts: bool,
    pub write_report: bool,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            root: None,
            emit_scripts: true,
            write_report: true,
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl AgentConfig {
    /// Reads `path`, else `rpa-agent.toml` when present, else defaults; then
    /// applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = Self::from_toml_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Applies `RPA_*` overrides looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        if let Some(model) = lookup("RPA_MODEL") {
            self.model.model = model;
        }
        if let Some(api_base) = lookup("RPA_API_BASE") {
            self.model.api_base = api_base;
        }
        if let Some(base_url) = lookup("RPA_BASE_URL") {
            self.base_url = Some(base_url);
        }
        if let Some(root) = lookup("RPA_ARTIFACTS_DIR") {
            self.artifacts.root = Some(PathBuf::from(root));
        }
        if let Some(attach) = lookup("RPA_CHROME_ATTACH") {
            self.browser.attach_url = Some(attach);
        }
        if let Some(raw) = lookup("RPA_HEADLESS") {
            match parse_bool(&raw) {
                Some(headless) => self.browser.headless = headless,
                None => warn!(value = %raw, "ignoring RPA_HEADLESS: expected true or false"),
            }
        }
        if let Some(raw) = lookup("RPA_MAX_RETRIES") {
            match raw.trim().parse() {
                Ok(max_retries) => self.executor.retry.max_retries = max_retries,
                Err(_) => warn!(value = %raw, "ignoring RPA_MAX_RETRIES: expected an integer"),
            }
        }
    }

    pub fn artifacts_root(&self) -> PathBuf {
        self.artifacts
            .root
            .clone()
            .unwrap_or_else(ArtifactStore::default_root)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::plan::OnFailure;
    use crate::schema::ActionKind;

    #[test]
    fn defaults_match_documented_values() {
        let config = AgentConfig::default();
        assert_eq!(config.executor.step_timeout_ms, 10_000);
        assert_eq!(config.executor.retry.max_retries, 2);
        assert_eq!(config.planner.repair_attempts, 1);
        assert!(config.executor.screenshot_on_failure);
        assert_eq!(config.executor.failure_policy.default, OnFailure::Abort);
    }

    #[test]
    fn toml_sections_override_defaults() {
        let config = AgentConfig::from_toml_str(
            r#"
base_url = "https://shop.test"

[executor]
step_timeout_ms = 2500

[executor.retry]
max_retries = 4
strategy = "fixed"

[executor.failure_policy]
default = "continue"
overrides = { click = "abort" }

[browser]
headless = false
"#,
        )
        .unwrap();
        assert_eq!(config.base_url.as_deref(), Some("https://shop.test"));
        assert_eq!(config.executor.step_timeout_ms, 2_500);
        assert_eq!(config.executor.retry.max_retries, 4);
        assert_eq!(config.executor.retry.base_delay_ms, 200);
        assert_eq!(
            config.executor.failure_policy.on_failure(ActionKind::Hover),
            OnFailure::Continue
        );
        assert_eq!(
            config.executor.failure_policy.on_failure(ActionKind::Click),
            OnFailure::Abort
        );
        assert!(!config.browser.headless);
        assert_eq!(config.model, ModelConfig::default());
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("RPA_MODEL", "gpt-test"),
            ("RPA_BASE_URL", "https://staging.test"),
            ("RPA_HEADLESS", "maybe"),
            ("RPA_MAX_RETRIES", "5"),
            ("RPA_ARTIFACTS_DIR", " "),
        ]);
        let mut config = AgentConfig::default();
        config.apply_overrides(|name| env.get(name).map(|value| value.to_string()));
        assert_eq!(config.model.model, "gpt-test");
        assert_eq!(config.base_url.as_deref(), Some("https://staging.test"));
        assert!(config.browser.headless);
        assert_eq!(config.executor.retry.max_retries, 5);
        assert_eq!(config.artifacts.root, None);
    }
}
