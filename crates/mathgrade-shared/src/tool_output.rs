//! Decoding of tool results.
//!
//! Tools answer with an MCP-style body `{content: [{type: "text", text}]}`
//! whose text should be a JSON document. Model output is not always that
//! disciplined, so decoding distinguishes three outcomes:
//!
//! - `Structured`: the text (or the raw result when there is no content
//!   wrapper) parsed as JSON as-is
//! - `Recovered`: a JSON object was extracted from a fenced code block or
//!   from the first balanced `{...}` span that parses
//! - `Unstructured`: nothing machine-readable, only the text

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Structured(Value),
    Recovered { value: Value, text: String },
    Unstructured(String),
}

impl ToolOutput {
    pub fn from_result(result: Value) -> Self {
        match content_text(&result) {
            Some(text) => Self::from_text(&text),
            None => ToolOutput::Structured(result),
        }
    }

    pub fn from_text(text: &str) -> Self {
        if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
            return ToolOutput::Structured(value);
        }
        match extract_json(text) {
            Some(value) => ToolOutput::Recovered {
                value,
                text: text.to_string(),
            },
            None => ToolOutput::Unstructured(text.to_string()),
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            ToolOutput::Structured(value) | ToolOutput::Recovered { value, .. } => Some(value),
            ToolOutput::Unstructured(_) => None,
        }
    }

    pub fn is_recovered(&self) -> bool {
        matches!(self, ToolOutput::Recovered { .. })
    }

    /// Human-readable text for callers that only display the output
    pub fn display_text(&self) -> String {
        match self {
            ToolOutput::Structured(Value::String(s)) => s.clone(),
            ToolOutput::Structured(value) => value.to_string(),
            ToolOutput::Recovered { text, .. } | ToolOutput::Unstructured(text) => text.clone(),
        }
    }
}

/// Wrap text the way tool handlers return it
pub fn text_content(text: impl Into<String>) -> Value {
    serde_json::json!({
        "content": [
            { "type": "text", "text": text.into() }
        ]
    })
}

fn content_text(result: &Value) -> Option<String> {
    let items = result.get("content")?.as_array()?;
    let parts: Vec<&str> = items
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn fenced_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:json|JSON)?\s*([\s\S]*?)```").expect("static regex"))
}

fn extract_json(text: &str) -> Option<Value> {
    for caps in fenced_block().captures_iter(text) {
        if let Some(body) = caps.get(1) {
            if let Ok(value) = serde_json::from_str::<Value>(body.as_str().trim()) {
                return Some(value);
            }
        }
    }

    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        if let Some(close) = matching_brace(bytes, open) {
            if let Ok(value) = serde_json::from_str::<Value>(&text[open..=close]) {
                return Some(value);
            }
        }
        start = open + 1;
    }
    None
}

/// Index of the `}` closing the `{` at `open`, skipping string literals
fn matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
