//! Replay script generation: a validated plan rendered as a standalone
//! Playwright (Python) test, so it can run without the agent or the model.

use serde_json::Value;

use crate::executor::resolve_url;
use crate::plan::TestPlan;
use crate::schema::{Action, ActionStep, Expectation, ExtractFormat, Selector, WaitCondition, WaitSpec};

#[derive(Debug, Clone, Default)]
pub struct ScriptOptions {
    pub base_url: Option<String>,
    pub default_timeout_ms: u64,
    pub headless: bool,
}

/// Python string literal. JSON string escapes are valid Python.
fn py(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}

/// Literal, or an `expand(...)` call when the text references variables.
fn py_value(text: &str) -> String {
    if text.contains("{{") {
        format!("expand({}, variables)", py(text))
    } else {
        py(text)
    }
}

fn locator(selector: &Selector) -> String {
    match selector {
        Selector::Css(css) => format!("page.locator({}).first", py(css)),
        Selector::Text(text) => format!("page.get_by_text({}).first", py(text)),
        Selector::Role { role, name: None } => format!("page.get_by_role({}).first", py(role)),
        Selector::Role {
            role,
            name: Some(name),
        } => format!("page.get_by_role({}, name={}).first", py(role), py(name)),
    }
}

fn render_step(step: &ActionStep, number: usize, options: &ScriptOptions) -> Vec<String> {
    let timeout = step.timeout_ms().unwrap_or(options.default_timeout_ms);
    let mut lines = vec![format!("# {number}. {}", step.summary())];
    let line = match step.action() {
        Action::Navigate { url } => {
            let resolved = if url.contains("{{") {
                url.clone()
            } else {
                resolve_url(options.base_url.as_deref(), url)
            };
            format!("page.goto({}, timeout={timeout})", py_value(&resolved))
        }
        Action::Click { target } => format!("{}.click(timeout={timeout})", locator(target)),
        Action::Fill { target, text } => {
            format!("{}.fill({}, timeout={timeout})", locator(target), py_value(text))
        }
        Action::Select { target, option } => format!(
            "{}.select_option({}, timeout={timeout})",
            locator(target),
            py_value(option)
        ),
        Action::Check { target } => format!("{}.check(timeout={timeout})", locator(target)),
        Action::Uncheck { target } => format!("{}.uncheck(timeout={timeout})", locator(target)),
        Action::Hover { target } => format!("{}.hover(timeout={timeout})", locator(target)),
        Action::Wait {
            until: WaitSpec::Duration(pause),
        } => format!("page.wait_for_timeout({})", pause.as_millis()),
        Action::Wait {
            until: WaitSpec::Condition(condition),
        } => match condition {
            WaitCondition::Visible(target) => {
                format!("{}.wait_for(state=\"visible\", timeout={timeout})", locator(target))
            }
            WaitCondition::Hidden(target) => {
                format!("{}.wait_for(state=\"hidden\", timeout={timeout})", locator(target))
            }
            WaitCondition::Attached(target) => {
                format!("{}.wait_for(state=\"attached\", timeout={timeout})", locator(target))
            }
            WaitCondition::Detached(target) => {
                format!("{}.wait_for(state=\"detached\", timeout={timeout})", locator(target))
            }
            WaitCondition::Enabled(target) => {
                format!("expect({}).to_be_enabled(timeout={timeout})", locator(target))
            }
            WaitCondition::Disabled(target) => {
                format!("expect({}).to_be_disabled(timeout={timeout})", locator(target))
            }
            WaitCondition::UrlContains(part) => format!(
                "page.wait_for_url(re.compile(re.escape({})), timeout={timeout})",
                py_value(part)
            ),
            WaitCondition::TextPresent(part) => format!(
                "page.get_by_text({}).first.wait_for(timeout={timeout})",
                py_value(part)
            ),
        },
        Action::Assert { target, expect } => {
            let subject = format!("expect({})", locator(target));
            match expect {
                Expectation::Visible => format!("{subject}.to_be_visible(timeout={timeout})"),
                Expectation::Hidden => format!("{subject}.to_be_hidden(timeout={timeout})"),
                Expectation::Enabled => format!("{subject}.to_be_enabled(timeout={timeout})"),
                Expectation::Disabled => format!("{subject}.to_be_disabled(timeout={timeout})"),
                Expectation::TextContains(text) => {
                    format!("{subject}.to_contain_text({}, timeout={timeout})", py_value(text))
                }
                Expectation::TextEquals(text) => {
                    format!("{subject}.to_have_text({}, timeout={timeout})", py_value(text))
                }
                Expectation::ValueEquals(text) => {
                    format!("{subject}.to_have_value({}, timeout={timeout})", py_value(text))
                }
            }
        }
        Action::Screenshot { .. } => format!(
            "page.screenshot(path=\"step-{number:02}-screenshot.png\", full_page=True)"
        ),
        Action::Extract {
            target,
            variable,
            format,
        } => {
            let name = variable
                .clone()
                .unwrap_or_else(|| format!("extract_{number}"));
            let getter = match format {
                ExtractFormat::Text => "inner_text",
                ExtractFormat::Html => "inner_html",
            };
            format!(
                "variables[{}] = {}.{getter}(timeout={timeout})",
                py(&name),
                locator(target)
            )
        }
    };
    lines.push(line);
    lines
}

/// Renders `plan` as a runnable Python module.
pub fn render_playwright(plan: &TestPlan, options: &ScriptOptions) -> String {
    let mut out = Vec::new();
    out.push(format!("\"\"\"Replay of: {}\"\"\"", plan.description().replace("\"\"\"", "'''")));
    out.push(String::new());
    out.push("import re".to_string());
    out.push(String::new());
    out.push("from playwright.sync_api import Page, expect, sync_playwright".to_string());
    out.push(String::new());
    out.push(String::new());
    out.push("def expand(text: str, variables: dict) -> str:".to_string());
    out.push(
        "    return re.sub(r\"\\{\\{\\s*(\\w+)\\s*\\}\\}\", lambda m: variables.get(m.group(1), m.group(0)), text)"
            .to_string(),
    );
    out.push(String::new());
    out.push(String::new());
    out.push("def run(page: Page) -> dict:".to_string());
    out.push("    variables = {}".to_string());
    for (index, step) in plan.steps().iter().enumerate() {
        for line in render_step(step, index + 1, options) {
            out.push(format!("    {line}"));
        }
    }
    out.push("    return variables".to_string());
    out.push(String::new());
    out.push(String::new());
    out.push("if __name__ == \"__main__\":".to_string());
    out.push("    with sync_playwright() as playwright:".to_string());
    out.push(format!(
        "        browser = playwright.chromium.launch(headless={})",
        if options.headless { "True" } else { "False" }
    ));
    out.push("        page = browser.new_page()".to_string());
    out.push("        try:".to_string());
    out.push("            print(run(page))".to_string());
    out.push("        finally:".to_string());
    out.push("            browser.close()".to_string());
    out.push(String::new());
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RawStep, validate};

    fn plan(steps: Vec<RawStep>) -> TestPlan {
        let steps = steps.iter().map(|raw| validate(raw).unwrap()).collect();
        TestPlan::new("join rewards", steps).unwrap()
    }

    fn options() -> ScriptOptions {
        ScriptOptions {
            base_url: Some("https://shop.test".to_string()),
            default_timeout_ms: 10_000,
            headless: true,
        }
    }

    #[test]
    fn renders_each_step_against_literal_locators() {
        let script = render_playwright(
            &plan(vec![
                RawStep::new("navigate").value("/menu"),
                RawStep::new("click").target("text=Join My Rewards"),
                RawStep::new("fill")
                    .target("role=textbox[name=\"Email\"]")
                    .value("a@b.test")
                    .timeout_ms(2500),
                RawStep::new("assert").target("h1").value("equals:Welcome"),
            ]),
            &options(),
        );
        assert!(script.contains("    page.goto(\"https://shop.test/menu\", timeout=10000)"));
        assert!(script.contains("page.get_by_text(\"Join My Rewards\").first.click(timeout=10000)"));
        assert!(script.contains(
            "page.get_by_role(\"textbox\", name=\"Email\").first.fill(\"a@b.test\", timeout=2500)"
        ));
        assert!(script.contains("expect(page.locator(\"h1\").first).to_have_text(\"Welcome\", timeout=10000)"));
        assert!(script.contains("browser = playwright.chromium.launch(headless=True)"));
    }

    #[test]
    fn extracted_variables_flow_into_later_values() {
        let script = render_playwright(
            &plan(vec![
                RawStep::new("extract").target(".order").value("order"),
                RawStep::new("fill").target("#q").value("{{order}}"),
            ]),
            &options(),
        );
        assert!(script.contains("variables[\"order\"] = page.locator(\".order\").first.inner_text(timeout=10000)"));
        assert!(script.contains("fill(expand(\"{{order}}\", variables), timeout=10000)"));
    }

    #[test]
    fn quotes_are_escaped() {
        let script = render_playwright(
            &plan(vec![RawStep::new("click").target("text=Say \"hi\"")]),
            &options(),
        );
        assert!(script.contains(r#"page.get_by_text("Say \"hi\"").first"#));
    }
}
