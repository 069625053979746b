//! The narrow browser capability the executor drives.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DriverError;
pub use crate::schema::WaitCondition;
use crate::schema::Selector;

/// A resolved element. Handles are never reused across attempts: every
/// retry resolves its target again because the DOM may have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle {
    pub selector: Selector,
    /// Driver-specific reference that addresses exactly this element.
    pub reference: String,
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), DriverError>;

    async fn find_element(&self, selector: &Selector) -> Result<ElementHandle, DriverError>;

    async fn click(&self, element: &ElementHandle) -> Result<(), DriverError>;

    async fn fill(&self, element: &ElementHandle, text: &str) -> Result<(), DriverError>;

    async fn select(&self, element: &ElementHandle, option: &str) -> Result<(), DriverError>;

    async fn set_checked(&self, element: &ElementHandle, checked: bool) -> Result<(), DriverError>;

    async fn hover(&self, element: &ElementHandle) -> Result<(), DriverError>;

    async fn wait_for(
        &self,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> Result<(), DriverError>;

    /// PNG bytes of the full page.
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;

    /// Inner text of `selector`, or of the whole document when `None`.
    async fn extract_text(&self, selector: Option<&Selector>) -> Result<String, DriverError>;

    async fn extract_html(&self, selector: Option<&Selector>) -> Result<String, DriverError>;

    /// Current value of a form control.
    async fn input_value(&self, element: &ElementHandle) -> Result<String, DriverError>;

    async fn is_enabled(&self, element: &ElementHandle) -> Result<bool, DriverError>;

    async fn current_url(&self) -> Result<String, DriverError>;

    /// Compact outline for planning prompts; drivers without one return `None`.
    async fn page_outline(&self) -> Result<Option<String>, DriverError> {
        Ok(None)
    }

    async fn close(&self) -> Result<(), DriverError>;
}
