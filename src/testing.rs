//! In-memory stand-ins for the browser and the language model, for tests and
//! dry runs that must not touch a real browser or network.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::brain::{LanguageModel, Prompt};
use crate::driver::{BrowserDriver, ElementHandle, WaitCondition};
use crate::error::{DriverError, ProviderError};
use crate::schema::Selector;

#[derive(Debug, Default)]
struct StubState {
    calls: Vec<String>,
    url: String,
    missing: BTreeSet<String>,
    flaky: BTreeMap<String, u32>,
    texts: BTreeMap<String, String>,
    values: BTreeMap<String, String>,
    disabled: BTreeSet<String>,
    hidden: BTreeSet<String>,
    disconnect_after: Option<usize>,
    disconnected: bool,
    close_calls: usize,
}

/// Scriptable [`BrowserDriver`]. Every call is logged as `"<op> <arg>"`;
/// elements resolve unless marked missing.
#[derive(Debug)]
pub struct StubDriver {
    state: Mutex<StubState>,
    latency: Option<Duration>,
    patient_waits: bool,
}

impl Default for StubDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl StubDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StubState {
                url: "about:blank".to_string(),
                ..StubState::default()
            }),
            latency: None,
            patient_waits: false,
        }
    }

    fn with_state(self, edit: impl FnOnce(&mut StubState)) -> Self {
        edit(&mut self.lock());
        self
    }

    /// `locator` never resolves.
    pub fn missing(self, locator: &str) -> Self {
        self.with_state(|state| {
            state.missing.insert(locator.to_string());
        })
    }

    /// `locator` fails to resolve `failures` times, then resolves.
    pub fn flaky(self, locator: &str, failures: u32) -> Self {
        self.with_state(|state| {
            state.flaky.insert(locator.to_string(), failures);
        })
    }

    pub fn text(self, locator: &str, text: &str) -> Self {
        self.with_state(|state| {
            state.texts.insert(locator.to_string(), text.to_string());
        })
    }

    pub fn disabled(self, locator: &str) -> Self {
        self.with_state(|state| {
            state.disabled.insert(locator.to_string());
        })
    }

    pub fn hidden(self, locator: &str) -> Self {
        self.with_state(|state| {
            state.hidden.insert(locator.to_string());
        })
    }

    /// The browser drops after `calls` successful driver calls.
    pub fn disconnect_after(self, calls: usize) -> Self {
        self.with_state(|state| state.disconnect_after = Some(calls))
    }

    /// Every call sleeps this long before answering.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Unmet waits hold on for their whole timeout before failing, the way a
    /// polling browser does.
    pub fn patient_waits(mut self) -> Self {
        self.patient_waits = true;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StubState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn find_attempts(&self, locator: &str) -> usize {
        let wanted = format!("find {locator}");
        self.lock()
            .calls
            .iter()
            .filter(|call| **call == wanted)
            .count()
    }

    pub fn close_calls(&self) -> usize {
        self.lock().close_calls
    }

    async fn record(&self, call: String) -> Result<(), DriverError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        if state.disconnected {
            return Err(DriverError::Disconnected("target closed".to_string()));
        }
        if state.disconnect_after == Some(state.calls.len()) {
            state.disconnected = true;
            return Err(DriverError::Disconnected("target closed".to_string()));
        }
        state.calls.push(call);
        Ok(())
    }

    fn text_of(&self, locator: &str) -> String {
        self.lock().texts.get(locator).cloned().unwrap_or_default()
    }

    fn resolves(&self, locator: &str) -> bool {
        let mut state = self.lock();
        if state.missing.contains(locator) {
            return false;
        }
        match state.flaky.get_mut(locator) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                false
            }
            _ => true,
        }
    }
}

#[async_trait]
impl BrowserDriver for StubDriver {
    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        self.record(format!("goto {url}")).await?;
        self.lock().url = url.to_string();
        Ok(())
    }

    async fn find_element(&self, selector: &Selector) -> Result<ElementHandle, DriverError> {
        let locator = selector.locator();
        self.record(format!("find {locator}")).await?;
        if !self.resolves(&locator) {
            return Err(DriverError::ElementNotFound { selector: locator });
        }
        Ok(ElementHandle {
            selector: selector.clone(),
            reference: locator,
        })
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), DriverError> {
        self.record(format!("click {}", element.reference)).await
    }

    async fn fill(&self, element: &ElementHandle, text: &str) -> Result<(), DriverError> {
        self.record(format!("fill {} {text}", element.reference))
            .await?;
        self.lock()
            .values
            .insert(element.reference.clone(), text.to_string());
        Ok(())
    }

    async fn select(&self, element: &ElementHandle, option: &str) -> Result<(), DriverError> {
        self.record(format!("select {} {option}", element.reference))
            .await?;
        self.lock()
            .values
            .insert(element.reference.clone(), option.to_string());
        Ok(())
    }

    async fn set_checked(&self, element: &ElementHandle, checked: bool) -> Result<(), DriverError> {
        self.record(format!("checked {} {checked}", element.reference))
            .await
    }

    async fn hover(&self, element: &ElementHandle) -> Result<(), DriverError> {
        self.record(format!("hover {}", element.reference)).await
    }

    async fn wait_for(
        &self,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        self.record(format!("wait {condition}")).await?;
        let met = match condition {
            WaitCondition::Visible(selector) | WaitCondition::Attached(selector) => {
                let locator = selector.locator();
                let state = self.lock();
                !state.missing.contains(&locator) && !state.hidden.contains(&locator)
            }
            WaitCondition::Hidden(selector) | WaitCondition::Detached(selector) => {
                let locator = selector.locator();
                let state = self.lock();
                state.missing.contains(&locator) || state.hidden.contains(&locator)
            }
            WaitCondition::Enabled(selector) => !self.lock().disabled.contains(&selector.locator()),
            WaitCondition::Disabled(selector) => self.lock().disabled.contains(&selector.locator()),
            WaitCondition::UrlContains(part) => self.lock().url.contains(part.as_str()),
            WaitCondition::TextPresent(part) => {
                self.lock().texts.values().any(|text| text.contains(part.as_str()))
            }
        };
        if met {
            Ok(())
        } else {
            if self.patient_waits {
                tokio::time::sleep(timeout).await;
            }
            Err(DriverError::Timeout {
                operation: condition.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.record("screenshot".to_string()).await?;
        Ok(b"\x89PNG\r\n\x1a\nstub".to_vec())
    }

    async fn extract_text(&self, selector: Option<&Selector>) -> Result<String, DriverError> {
        let locator = selector.map(Selector::locator).unwrap_or_else(|| "body".to_string());
        self.record(format!("text {locator}")).await?;
        Ok(self.text_of(&locator))
    }

    async fn extract_html(&self, selector: Option<&Selector>) -> Result<String, DriverError> {
        let locator = selector.map(Selector::locator).unwrap_or_else(|| "body".to_string());
        self.record(format!("html {locator}")).await?;
        Ok(format!("<div>{}</div>", self.text_of(&locator)))
    }

    async fn input_value(&self, element: &ElementHandle) -> Result<String, DriverError> {
        self.record(format!("value {}", element.reference)).await?;
        Ok(self
            .lock()
            .values
            .get(&element.reference)
            .cloned()
            .unwrap_or_default())
    }

    async fn is_enabled(&self, element: &ElementHandle) -> Result<bool, DriverError> {
        self.record(format!("enabled {}", element.reference))
            .await?;
        Ok(!self.lock().disabled.contains(&element.reference))
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        let state = self.lock();
        if state.disconnected {
            return Err(DriverError::Disconnected("target closed".to_string()));
        }
        Ok(state.url.clone())
    }

    async fn close(&self) -> Result<(), DriverError> {
        let mut state = self.lock();
        state.close_calls += 1;
        state.disconnected = true;
        Ok(())
    }
}

/// [`LanguageModel`] that replays canned responses in order and remembers
/// every prompt it was sent.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<String, ProviderError>>>,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(responses: &[&str]) -> Self {
        Self::new(
            responses
                .iter()
                .map(|response| Ok(response.to_string()))
                .collect(),
        )
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, prompt: &Prompt, _schema: &Value) -> Result<String, ProviderError> {
        self.prompts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(prompt.clone());
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::InvalidResponse("script exhausted".to_string())))
    }
}
