use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// State carried from one plan execution to the next within a session.
///
/// Passed into and returned from every run instead of living on the agent,
/// so two sessions never share it and a test can construct one directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContext {
    #[serde(default)]
    pub current_url: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Compact outline of the page as it looked before planning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_outline: Option<String>,
    /// Descriptions already executed in this session, oldest first.
    #[serde(default)]
    pub history: Vec<String>,
}

impl PageContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            current_url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// Expands `{{name}}` references; unknown names are left as written.
    pub fn interpolate(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let name = after[..end].trim();
                    match self.variables.get(name) {
                        Some(value) => out.push_str(value),
                        None => out.push_str(&rest[start..start + 2 + end + 2]),
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Section of the planning prompt describing where the session stands.
    pub fn prompt_section(&self) -> String {
        let mut lines = Vec::new();
        match &self.current_url {
            Some(url) => lines.push(format!("Current URL: {url}")),
            None => lines.push("Current URL: none (browser has not navigated yet)".to_string()),
        }
        if !self.variables.is_empty() {
            lines.push("Extracted variables (reference as {{name}}):".to_string());
            for (name, value) in &self.variables {
                let preview: String = value.chars().take(120).collect();
                lines.push(format!("- {name} = {preview}"));
            }
        }
        if !self.history.is_empty() {
            lines.push("Already executed in this session:".to_string());
            for description in &self.history {
                lines.push(format!("- {description}"));
            }
        }
        if let Some(outline) = &self.page_outline {
            lines.push(format!("Visible page outline:\n{outline}"));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_known_variables_only() {
        let mut context = PageContext::new();
        context.set_variable("order_id", "A-1009");
        assert_eq!(
            context.interpolate("/orders/{{ order_id }}?ref={{missing}}"),
            "/orders/A-1009?ref={{missing}}"
        );
        assert_eq!(context.interpolate("no refs"), "no refs");
        assert_eq!(context.interpolate("dangling {{order_id"), "dangling {{order_id");
    }

    #[test]
    fn prompt_section_mentions_url_variables_and_history() {
        let mut context = PageContext::with_url("https://shop.test/menu");
        context.set_variable("price", "$4.99");
        context.history.push("open the menu".into());
        let section = context.prompt_section();
        assert!(section.contains("Current URL: https://shop.test/menu"));
        assert!(section.contains("- price = $4.99"));
        assert!(section.contains("- open the menu"));
    }
}
