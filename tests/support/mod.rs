#![allow(dead_code)]

use std::sync::Arc;

use rpa_test_agent::config::AgentConfig;
use rpa_test_agent::retry::{BackoffStrategy, RetryPolicy};
pub use rpa_test_agent::testing::{ScriptedModel, StubDriver};
use rpa_test_agent::TestAgent;
use tempfile::TempDir;

pub struct Harness {
    pub agent: TestAgent,
    pub driver: Arc<StubDriver>,
    pub model: Arc<ScriptedModel>,
    pub root: TempDir,
}

fn quick_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        strategy: BackoffStrategy::Fixed,
        base_delay_ms: 1,
        max_delay_ms: 1,
        jitter: false,
    }
}

/// Millisecond retries and timeouts; artifacts land under `root`.
pub fn fast_config(root: &TempDir) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.executor.step_timeout_ms = 500;
    config.executor.retry = quick_retry(2);
    config.planner.provider_retry = quick_retry(0);
    config.artifacts.root = Some(root.path().to_path_buf());
    config
}

pub async fn harness_with(
    driver: StubDriver,
    replies: &[&str],
    edit: impl FnOnce(&mut AgentConfig),
) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let mut config = fast_config(&root);
    edit(&mut config);
    let driver = Arc::new(driver);
    let model = Arc::new(ScriptedModel::replying(replies));
    let agent = TestAgent::new(driver.clone(), model.clone(), config)
        .await
        .unwrap();
    Harness {
        agent,
        driver,
        model,
        root,
    }
}

pub async fn harness(driver: StubDriver, replies: &[&str]) -> Harness {
    harness_with(driver, replies, |_| {}).await
}
