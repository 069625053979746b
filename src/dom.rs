//! JavaScript run inside the page by [`crate::hands::ChromeDriver`].

use serde_json::Value;

use crate::driver::WaitCondition;
use crate::schema::Selector;

pub const OUTLINE_MAX_CHARS: usize = 6_000;

/// Attribute stamped on a resolved element so later calls can address it
/// with a plain CSS selector.
pub const REF_ATTRIBUTE: &str = "data-rpa-ref";

/// Compact, read-only outline of the visible page for planning prompts.
/// One line per interactive element, plus short leaf texts.
pub const OUTLINE_JS: &str = r#"
(() => {
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','LINK','META']);
  const lines = [];
  const seen = new Set();
  const clip = (text, n) => (text || '').replace(/\s+/g, ' ').trim().slice(0, n);

  function isVisible(el) {
    if (el.offsetParent === null && el.tagName !== 'BODY' && el.tagName !== 'HTML') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function describe(el, tag) {
    const id = el.id ? ' #' + el.id : '';
    const testId = el.getAttribute('data-testid') ? ' [data-testid=' + el.getAttribute('data-testid') + ']' : '';
    if (tag === 'a') return 'link "' + clip(el.textContent, 60) + '"' + id + testId;
    if (tag === 'button') return 'button "' + clip(el.textContent || el.value, 60) + '"' + id + testId;
    if (tag === 'select') {
      const opts = [...el.options].map(o => clip(o.text, 20)).join('|');
      return 'select [' + opts + ']' + id + testId;
    }
    let desc = tag + ' type=' + (el.type || 'text');
    if (el.placeholder) desc += ' placeholder="' + clip(el.placeholder, 40) + '"';
    if (el.name) desc += ' name=' + el.name;
    if (el.getAttribute('aria-label')) desc += ' label="' + clip(el.getAttribute('aria-label'), 40) + '"';
    if (el.type === 'checkbox' || el.type === 'radio') desc += el.checked ? ' checked' : ' unchecked';
    return desc + id + testId;
  }

  function walk(node, depth) {
    if (depth > 15) return;
    for (const child of node.children) {
      if (SKIP.has(child.tagName) || !isVisible(child)) continue;
      const tag = child.tagName.toLowerCase();
      let line = null;
      if (['a','button','input','textarea','select'].includes(tag) || child.getAttribute('role') === 'button') {
        line = describe(child, tag === 'div' || tag === 'span' ? 'button' : tag);
      } else if (child.children.length === 0) {
        const text = clip(child.textContent, 100);
        if (text.length > 2) line = '  "' + text + '"';
      }
      if (line && !seen.has(line)) {
        seen.add(line);
        lines.push(line);
      }
      walk(child, depth + 1);
    }
  }

  if (document.body) walk(document.body, 0);
  return lines.join('\n');
})()
"#;

/// Shared locator helpers; spliced into each script below.
const FIND_PRELUDE: &str = r#"
  const norm = t => (t || '').replace(/\s+/g, ' ').trim();
  const visible = el => {
    const r = el.getBoundingClientRect();
    const s = getComputedStyle(el);
    return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none';
  };
  const IMPLICIT = {
    button: 'button,input[type=button],input[type=submit],input[type=reset]',
    link: 'a[href]',
    textbox: 'input:not([type]),input[type=text],input[type=email],input[type=password],input[type=search],input[type=tel],input[type=url],textarea',
    checkbox: 'input[type=checkbox]',
    radio: 'input[type=radio]',
    combobox: 'select',
    heading: 'h1,h2,h3,h4,h5,h6',
    img: 'img',
  };
  const accessibleName = el => {
    const labelled = el.getAttribute('aria-labelledby');
    if (labelled) {
      const ref = document.getElementById(labelled);
      if (ref) return norm(ref.innerText);
    }
    if (el.labels && el.labels.length) return norm(el.labels[0].innerText);
    return norm(el.getAttribute('aria-label') || el.innerText || el.value || el.getAttribute('title') || el.getAttribute('alt'));
  };
  const find = (kind, query, name) => {
    if (kind === 'css') return document.querySelector(query);
    if (kind === 'text') {
      const wanted = norm(query).toLowerCase();
      const all = [...document.querySelectorAll('body *')].filter(visible);
      const exact = all.filter(el => norm(el.innerText).toLowerCase() === wanted);
      const pool = exact.length ? exact : all.filter(el => norm(el.innerText).toLowerCase().includes(wanted));
      return pool.find(el => !pool.some(other => other !== el && el.contains(other))) || null;
    }
    const css = '[role="' + query + '"]' + (IMPLICIT[query] ? ',' + IMPLICIT[query] : '');
    const candidates = [...document.querySelectorAll(css)];
    if (name === null) return candidates.find(visible) || candidates[0] || null;
    const wanted = norm(name).toLowerCase();
    return candidates.find(el => accessibleName(el).toLowerCase() === wanted)
      || candidates.find(el => accessibleName(el).toLowerCase().includes(wanted))
      || null;
  };
"#;

fn js_string(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}

fn selector_args(selector: &Selector) -> String {
    let (kind, query, name) = match selector {
        Selector::Css(css) => ("css", css.as_str(), None),
        Selector::Text(text) => ("text", text.as_str(), None),
        Selector::Role { role, name } => ("role", role.as_str(), name.as_deref()),
    };
    let name = name.map(js_string).unwrap_or_else(|| "null".to_string());
    format!("{}, {}, {name}", js_string(kind), js_string(query))
}

/// Expression that tags the element matched by `selector` with `reference`
/// and evaluates to whether one was found.
pub fn resolve_script(selector: &Selector, reference: &str) -> String {
    format!(
        "(() => {{{FIND_PRELUDE}\n  const el = find({});\n  if (!el) return false;\n  el.setAttribute('{REF_ATTRIBUTE}', {});\n  return true;\n}})()",
        selector_args(selector),
        js_string(reference),
    )
}

/// CSS selector addressing a previously resolved element.
pub fn ref_selector(reference: &str) -> String {
    format!("[{REF_ATTRIBUTE}=\"{reference}\"]")
}

/// Boolean expression that is true once `condition` holds.
pub fn condition_script(condition: &WaitCondition) -> String {
    let body = match condition {
        WaitCondition::Visible(selector) => {
            format!("const el = find({}); return !!el && visible(el);", selector_args(selector))
        }
        WaitCondition::Hidden(selector) => {
            format!("const el = find({}); return !el || !visible(el);", selector_args(selector))
        }
        WaitCondition::Attached(selector) => {
            format!("return !!find({});", selector_args(selector))
        }
        WaitCondition::Detached(selector) => {
            format!("return !find({});", selector_args(selector))
        }
        WaitCondition::Enabled(selector) => {
            format!("const el = find({}); return !!el && !el.disabled;", selector_args(selector))
        }
        WaitCondition::Disabled(selector) => {
            format!("const el = find({}); return !!el && !!el.disabled;", selector_args(selector))
        }
        WaitCondition::UrlContains(part) => {
            format!("return window.location.href.includes({});", js_string(part))
        }
        WaitCondition::TextPresent(part) => format!(
            "return !!document.body && document.body.innerText.includes({});",
            js_string(part)
        ),
    };
    format!("(() => {{{FIND_PRELUDE}\n  {body}\n}})()")
}

pub const BODY_TEXT_JS: &str = "document.body ? document.body.innerText : ''";

pub const CURRENT_URL_JS: &str = "window.location.href";

/// Element functions, called with `this` bound to the element.
pub const CLEAR_VALUE_FN: &str = "function() { if ('value' in this) { this.value = ''; this.dispatchEvent(new Event('input', { bubbles: true })); } }";

pub const SELECT_OPTION_FN: &str = r#"function(wanted) {
  const norm = t => (t || '').replace(/\s+/g, ' ').trim().toLowerCase();
  const option = [...this.options].find(o => o.value === wanted)
    || [...this.options].find(o => norm(o.text) === norm(wanted));
  if (!option) return false;
  this.value = option.value;
  this.dispatchEvent(new Event('input', { bubbles: true }));
  this.dispatchEvent(new Event('change', { bubbles: true }));
  return true;
}"#;

pub const SET_CHECKED_FN: &str = r#"function(checked) {
  if (this.checked !== checked) this.click();
  return this.checked === checked;
}"#;

pub const INPUT_VALUE_FN: &str = "function() { return this.value == null ? '' : String(this.value); }";

pub const IS_ENABLED_FN: &str = "function() { return !this.disabled && this.getAttribute('aria-disabled') !== 'true'; }";

/// Cuts an outline to [`OUTLINE_MAX_CHARS`] on a char boundary.
pub fn truncate_outline(raw: String) -> String {
    if raw.len() <= OUTLINE_MAX_CHARS {
        return raw;
    }
    let mut cut = OUTLINE_MAX_CHARS;
    while !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n... [truncated, {} total chars]", &raw[..cut], raw.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_arguments_are_json_escaped() {
        let selector = Selector::Role {
            role: "button".into(),
            name: Some("Say \"hi\"".into()),
        };
        assert_eq!(selector_args(&selector), r#""role", "button", "Say \"hi\"""#);
        assert_eq!(
            selector_args(&Selector::Text("Join".into())),
            r#""text", "Join", null"#
        );
    }

    #[test]
    fn resolve_script_tags_the_reference() {
        let script = resolve_script(&Selector::Css("#go".into()), "r7");
        assert!(script.contains(r##"find("css", "#go", null)"##));
        assert!(script.contains(r#"el.setAttribute('data-rpa-ref', "r7")"#));
        assert_eq!(ref_selector("r7"), r#"[data-rpa-ref="r7"]"#);
    }

    #[test]
    fn url_condition_does_not_need_a_locator() {
        let script = condition_script(&WaitCondition::UrlContains("/done".into()));
        assert!(script.contains(r#"window.location.href.includes("/done")"#));
    }

    #[test]
    fn outline_truncation_respects_char_boundaries() {
        let raw = "é".repeat(OUTLINE_MAX_CHARS);
        let cut = truncate_outline(raw);
        assert!(cut.contains("[truncated,"));
    }
}
