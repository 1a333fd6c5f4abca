//! Prompt assembly for agent runs.
//!
//! A pure function of the chat message plus captured page context, stable
//! across retries: the same inputs always produce the same prompt.

use crate::protocol::ElementContext;

/// Canonical follow-up prompt issued after an approved plan.
pub const PLAN_CONTINUATION_PROMPT: &str =
    "The plan has been approved. Continue with the implementation.";

const TEXT_LIMIT: usize = 500;
const SNIPPET_LIMIT: usize = 1000;

/// Render the outgoing prompt from the message and optional page context.
pub fn build_prompt(
    message: &str,
    element: Option<&ElementContext>,
    selected_text: Option<&str>,
) -> String {
    let mut prompt = String::from(message.trim());

    if let Some(selected) = selected_text.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str("\n\n[Selected text]\n");
        prompt.push_str(&truncate(selected, SNIPPET_LIMIT));
    }

    if let Some(element) = element {
        prompt.push_str("\n\n[Captured element]\n");
        prompt.push_str(&render_element(element));
    }

    prompt
}

fn render_element(element: &ElementContext) -> String {
    let mut out = String::new();

    let tag = element.tag.as_deref().unwrap_or("element");
    out.push('<');
    out.push_str(tag);
    if let Some(id) = element.id.as_deref().filter(|i| !i.is_empty()) {
        out.push_str(&format!(" id=\"{id}\""));
    }
    if !element.classes.is_empty() {
        out.push_str(&format!(" class=\"{}\"", element.classes.join(" ")));
    }
    out.push('>');

    if let Some(selector) = element.selector.as_deref().filter(|s| !s.is_empty()) {
        out.push_str(&format!("\nselector: {selector}"));
    }
    if let Some(text) = element.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        out.push_str(&format!("\ntext: {}", truncate(text, TEXT_LIMIT)));
    }

    // HashMap iteration order is unstable; sort for retry-stable prompts.
    let mut attrs: Vec<_> = element.attributes.iter().collect();
    attrs.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in attrs {
        out.push_str(&format!("\nattr {key}: {}", truncate(value, TEXT_LIMIT)));
    }

    if let Some(snippet) = element.html_snippet.as_deref().filter(|s| !s.is_empty()) {
        out.push_str(&format!("\nhtml: {}", truncate(snippet, SNIPPET_LIMIT)));
    }
    if element.screenshot_base64.is_some() {
        out.push_str("\n(screenshot captured)");
    }

    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
