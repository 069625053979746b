//! [`BrowserDriver`] over a real Chrome via `headless_chrome`.
//!
//! `headless_chrome` is synchronous, so every call runs on the blocking pool.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::dom;
use crate::driver::{BrowserDriver, ElementHandle, WaitCondition};
use crate::error::DriverError;
use crate::schema::Selector;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct ChromeDriver {
    browser: Mutex<Option<Browser>>,
    tab: Arc<Tab>,
    /// Held by whichever blocking call is touching the tab, until that call
    /// returns, even when its caller has stopped waiting.
    gate: Arc<AsyncMutex<()>>,
    closed: AtomicBool,
    next_ref: AtomicU64,
    settle: Duration,
    default_timeout_ms: u64,
}

impl ChromeDriver {
    /// Attaches to `attach_url` when configured and reachable, otherwise
    /// launches a fresh Chrome. Blocking; see [`ChromeDriver::start`].
    pub fn launch(config: &BrowserConfig, default_timeout: Duration) -> Result<Self> {
        if let Some(url) = &config.attach_url {
            info!(%url, "attaching to running Chrome");
            match Browser::connect(url.clone()) {
                Ok(browser) => {
                    let existing = browser
                        .get_tabs()
                        .lock()
                        .map_err(|_| anyhow!("tab list lock poisoned"))?
                        .first()
                        .cloned();
                    let tab = match existing {
                        Some(tab) => tab,
                        None => browser.new_tab()?,
                    };
                    return Ok(Self::from_parts(browser, tab, config, default_timeout));
                }
                Err(error) => warn!("could not attach ({error:#}); launching a new browser"),
            }
        }

        let options = LaunchOptions {
            headless: config.headless,
            sandbox: config.sandbox,
            window_size: Some((config.window_width, config.window_height)),
            path: config.chrome_path.clone().or_else(find_chrome),
            user_data_dir: config.user_data_dir.clone(),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
                OsStr::new("--password-store=basic"),
            ],
            idle_browser_timeout: Duration::from_secs(config.idle_timeout_secs),
            ..Default::default()
        };
        info!(headless = config.headless, "launching Chrome");
        let browser = Browser::new(options).context("browser launch failed")?;
        let tab = browser.new_tab().context("could not open a tab")?;
        tab.navigate_to("about:blank")?;
        info!("Chrome ready");
        Ok(Self::from_parts(browser, tab, config, default_timeout))
    }

    pub async fn start(config: BrowserConfig, default_timeout: Duration) -> Result<Self> {
        tokio::task::spawn_blocking(move || Self::launch(&config, default_timeout))
            .await
            .map_err(|error| anyhow!("browser launch panicked: {error}"))?
    }

    fn from_parts(
        browser: Browser,
        tab: Arc<Tab>,
        config: &BrowserConfig,
        default_timeout: Duration,
    ) -> Self {
        tab.set_default_timeout(default_timeout);
        Self {
            browser: Mutex::new(Some(browser)),
            tab,
            gate: Arc::new(AsyncMutex::new(())),
            closed: AtomicBool::new(false),
            next_ref: AtomicU64::new(0),
            settle: Duration::from_millis(config.settle_ms),
            default_timeout_ms: default_timeout.as_millis() as u64,
        }
    }

    async fn blocking<T, F>(&self, operation: String, work: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Disconnected("browser session closed".to_string()));
        }
        let tab = Arc::clone(&self.tab);
        let label = operation.clone();
        match exclusive(&self.gate, move || work(&tab)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(classify(&label, self.default_timeout_ms, &error)),
            Err(join) => Err(DriverError::Failed(format!("{operation} panicked: {join}"))),
        }
    }

    async fn on_element<T, F>(
        &self,
        operation: &str,
        element: &ElementHandle,
        work: F,
    ) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&headless_chrome::Element<'_>) -> Result<T> + Send + 'static,
    {
        let css = element.reference.clone();
        self.blocking(format!("{operation} {}", element.selector), move |tab| {
            let found = tab.find_element(&css)?;
            work(&found)
        })
        .await
    }
}

/// Runs `work` on the blocking pool once every earlier call has finished.
/// The guard travels with the work, so a timed-out caller does not free the
/// tab for the next operation while the work is still running.
async fn exclusive<T, F>(gate: &Arc<AsyncMutex<()>>, work: F) -> Result<T, tokio::task::JoinError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let guard = Arc::clone(gate).lock_owned().await;
    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        work()
    })
    .await
}

/// Maps `headless_chrome`'s stringly errors onto the driver taxonomy.
fn classify(operation: &str, timeout_ms: u64, error: &anyhow::Error) -> DriverError {
    let text = format!("{error:#}");
    let lower = text.to_ascii_lowercase();
    if lower.contains("couldn't find element")
        || lower.contains("no element found")
        || lower.contains("could not find node")
    {
        DriverError::ElementNotFound {
            selector: operation.to_string(),
        }
    } else if lower.contains("timed out") || lower.contains("timeout") || lower.contains("never came") {
        DriverError::Timeout {
            operation: operation.to_string(),
            timeout_ms,
        }
    } else if lower.contains("connection is closed")
        || lower.contains("disconnected")
        || lower.contains("closed channel")
        || lower.contains("target closed")
        || lower.contains("no such target")
    {
        DriverError::Disconnected(text)
    } else {
        DriverError::Failed(text)
    }
}

fn as_bool(object: headless_chrome::protocol::cdp::Runtime::RemoteObject) -> bool {
    object.value.and_then(|value| value.as_bool()).unwrap_or(false)
}

fn as_string(object: headless_chrome::protocol::cdp::Runtime::RemoteObject) -> String {
    object
        .value
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default()
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        let target = url.to_string();
        let settle = self.settle;
        self.blocking(format!("navigation to {url}"), move |tab| {
            tab.navigate_to(&target)?;
            tab.wait_until_navigated()?;
            std::thread::sleep(settle);
            Ok(())
        })
        .await?;
        debug!(%url, "navigated");
        Ok(())
    }

    async fn find_element(&self, selector: &Selector) -> Result<ElementHandle, DriverError> {
        let reference = format!("r{}", self.next_ref.fetch_add(1, Ordering::SeqCst));
        let script = dom::resolve_script(selector, &reference);
        let found = self
            .blocking(format!("element {selector}"), move |tab| {
                Ok(as_bool(tab.evaluate(&script, false)?))
            })
            .await?;
        if !found {
            return Err(DriverError::ElementNotFound {
                selector: selector.locator(),
            });
        }
        Ok(ElementHandle {
            selector: selector.clone(),
            reference: dom::ref_selector(&reference),
        })
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), DriverError> {
        let settle = self.settle;
        self.on_element("click", element, move |found| {
            found.scroll_into_view()?;
            found.click()?;
            std::thread::sleep(settle);
            Ok(())
        })
        .await
    }

    async fn fill(&self, element: &ElementHandle, text: &str) -> Result<(), DriverError> {
        let text = text.to_string();
        self.on_element("fill", element, move |found| {
            found.click()?;
            found.call_js_fn(dom::CLEAR_VALUE_FN, vec![], false)?;
            if !text.is_empty() {
                found.type_into(&text)?;
            }
            Ok(())
        })
        .await
    }

    async fn select(&self, element: &ElementHandle, option: &str) -> Result<(), DriverError> {
        let option = option.to_string();
        self.on_element("select", element, move |found| {
            let picked = found.call_js_fn(dom::SELECT_OPTION_FN, vec![json!(option)], false)?;
            if !as_bool(picked) {
                bail!("option '{option}' is not offered");
            }
            Ok(())
        })
        .await
    }

    async fn set_checked(&self, element: &ElementHandle, checked: bool) -> Result<(), DriverError> {
        self.on_element("check", element, move |found| {
            let done = found.call_js_fn(dom::SET_CHECKED_FN, vec![json!(checked)], false)?;
            if !as_bool(done) {
                bail!("checkbox refused to change state");
            }
            Ok(())
        })
        .await
    }

    async fn hover(&self, element: &ElementHandle) -> Result<(), DriverError> {
        self.on_element("hover", element, |found| {
            found.move_mouse_over()?;
            Ok(())
        })
        .await
    }

    async fn wait_for(
        &self,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        let script = dom::condition_script(condition);
        let met = self
            .blocking(format!("condition {condition}"), move |tab| {
                let started = Instant::now();
                loop {
                    if as_bool(tab.evaluate(&script, false)?) {
                        return Ok(true);
                    }
                    if started.elapsed() >= timeout {
                        return Ok(false);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            })
            .await?;
        if met {
            Ok(())
        } else {
            Err(DriverError::Timeout {
                operation: condition.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.blocking("screenshot".to_string(), |tab| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
        })
        .await
    }

    async fn extract_text(&self, selector: Option<&Selector>) -> Result<String, DriverError> {
        match selector {
            Some(selector) => {
                let element = self.find_element(selector).await?;
                self.on_element("text of", &element, |found| found.get_inner_text())
                    .await
            }
            None => {
                self.blocking("page text".to_string(), |tab| {
                    Ok(as_string(tab.evaluate(dom::BODY_TEXT_JS, false)?))
                })
                .await
            }
        }
    }

    async fn extract_html(&self, selector: Option<&Selector>) -> Result<String, DriverError> {
        match selector {
            Some(selector) => {
                let element = self.find_element(selector).await?;
                self.on_element("html of", &element, |found| found.get_content())
                    .await
            }
            None => {
                self.blocking("page html".to_string(), |tab| tab.get_content())
                    .await
            }
        }
    }

    async fn input_value(&self, element: &ElementHandle) -> Result<String, DriverError> {
        self.on_element("value of", element, |found| {
            Ok(as_string(found.call_js_fn(dom::INPUT_VALUE_FN, vec![], false)?))
        })
        .await
    }

    async fn is_enabled(&self, element: &ElementHandle) -> Result<bool, DriverError> {
        self.on_element("state of", element, |found| {
            Ok(as_bool(found.call_js_fn(dom::IS_ENABLED_FN, vec![], false)?))
        })
        .await
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        self.blocking("current url".to_string(), |tab| {
            let url = as_string(tab.evaluate(dom::CURRENT_URL_JS, false)?);
            Ok(if url.is_empty() { tab.get_url() } else { url })
        })
        .await
    }

    async fn page_outline(&self) -> Result<Option<String>, DriverError> {
        let outline = self
            .blocking("page outline".to_string(), |tab| {
                Ok(as_string(tab.evaluate(dom::OUTLINE_JS, false)?))
            })
            .await?;
        Ok(Some(dom::truncate_outline(outline)).filter(|outline| !outline.is_empty()))
    }

    async fn close(&self) -> Result<(), DriverError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let browser = self
            .browser
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(browser) = browser {
            // Dropping the handle ends a launched process or detaches.
            exclusive(&self.gate, move || drop(browser))
                .await
                .map_err(|error| DriverError::Failed(format!("browser shutdown panicked: {error}")))?;
        }
        info!("browser session closed");
        Ok(())
    }
}

/// First Chrome or Chromium install found in the usual places.
fn find_chrome() -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = vec![
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
        PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        PathBuf::from("/usr/bin/google-chrome"),
        PathBuf::from("/usr/bin/google-chrome-stable"),
        PathBuf::from("/usr/bin/chromium"),
        PathBuf::from("/usr/bin/chromium-browser"),
        PathBuf::from("/snap/bin/chromium"),
    ];
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(
            local
                .join("Google")
                .join("Chrome")
                .join("Application")
                .join("chrome.exe"),
        );
    }
    let found = candidates.into_iter().find(|path| path.exists());
    if found.is_none() {
        debug!("no Chrome in the usual places; letting headless_chrome search");
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_headless_chrome_errors() {
        let missing = anyhow!("Couldn't find element using selector: #x");
        assert!(matches!(
            classify("click #x", 1000, &missing),
            DriverError::ElementNotFound { .. }
        ));

        let slow = anyhow!("The event waited for never came");
        assert_eq!(
            classify("navigation", 1000, &slow),
            DriverError::Timeout {
                operation: "navigation".into(),
                timeout_ms: 1000
            }
        );

        let gone = anyhow!("Unable to make method calls because underlying connection is closed");
        assert!(classify("click", 1000, &gone).is_fatal());

        let other = anyhow!("Node is not an HTMLElement");
        assert!(matches!(classify("click", 1000, &other), DriverError::Failed(_)));
    }

    #[tokio::test]
    async fn timed_out_work_holds_the_tab_until_it_finishes() {
        let gate = Arc::new(AsyncMutex::new(()));
        let finished = Arc::new(AtomicBool::new(false));

        let slow = {
            let finished = Arc::clone(&finished);
            exclusive(&gate, move || {
                std::thread::sleep(Duration::from_millis(150));
                finished.store(true, Ordering::SeqCst);
            })
        };
        assert!(tokio::time::timeout(Duration::from_millis(20), slow).await.is_err());

        let saw_finished = {
            let finished = Arc::clone(&finished);
            exclusive(&gate, move || finished.load(Ordering::SeqCst))
        }
        .await
        .unwrap();
        assert!(saw_finished, "second call ran while the first was still in flight");
    }
}
