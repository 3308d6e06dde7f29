//! Directive parsing — what did the model just ask for?
//!
//! Providers return raw text. Somewhere in that text may be a JSON
//! action block requesting a tool, or a terminal answer block; models
//! wrap these in varying amounts of prose, so the parser scans for
//! embedded JSON rather than demanding a clean payload. The trait seam
//! exists so a different model dialect can swap in its own parser.

use regex_lite::Regex;
use serde::Deserialize;

/// The parsed intent of one provider response.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// The model wants a tool executed before it continues.
    ToolRequest {
        name: String,
        input: serde_json::Value,
    },

    /// The model is done; this is the answer.
    FinalAnswer(String),
}

/// Parses raw model output into a [`Directive`].
pub trait DirectiveParser: Send + Sync {
    fn parse(&self, text: &str) -> Directive;
}

fn strip_scratch(text: &str) -> String {
    match Regex::new(r"(?s)<scratch>.*?</scratch>") {
        Ok(re) => re.replace_all(text, "").into_owned(),
        Err(_) => text.to_string(),
    }
}

/// The default parser: embedded JSON blocks, tolerant of surrounding text.
///
/// Recognized shapes:
/// - `{"action": "<tool>", "input": {...}}` → tool request
/// - `{"final_answer": "..."}` → terminal answer
///
/// `<scratch>…</scratch>` regions are stripped before parsing and never
/// leak into a final answer. Text with no recognizable directive is the
/// final answer as-is.
pub struct JsonDirectiveParser;

#[derive(Deserialize)]
struct ActionBlock {
    action: String,
    #[serde(default)]
    input: serde_json::Value,
}

#[derive(Deserialize)]
struct AnswerBlock {
    final_answer: String,
}

impl DirectiveParser for JsonDirectiveParser {
    fn parse(&self, text: &str) -> Directive {
        let cleaned = strip_scratch(text);
        let cleaned = cleaned.trim();

        for candidate in json_candidates(cleaned) {
            if let Ok(block) = serde_json::from_str::<ActionBlock>(candidate) {
                return Directive::ToolRequest {
                    name: block.action,
                    input: block.input,
                };
            }
            if let Ok(block) = serde_json::from_str::<AnswerBlock>(candidate) {
                return Directive::FinalAnswer(block.final_answer);
            }
        }

        Directive::FinalAnswer(cleaned.to_string())
    }
}

/// Yield balanced `{…}` spans in order of appearance.
///
/// Tracks string literals and escapes so braces inside JSON strings
/// don't break the balance count.
fn json_candidates(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut candidates = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }

        let start = i;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;

        for (offset, &b) in bytes[start..].iter().enumerate() {
            if escaped {
                escaped = false;
                continue;
            }
            match b {
                b'\\' if in_string => escaped = true,
                b'"' => in_string = !in_string,
                b'{' if !in_string => depth += 1,
                b'}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(start + offset + 1);
                        break;
                    }
                }
                _ => {}
            }
        }

        match end {
            Some(end) => {
                candidates.push(&text[start..end]);
                i = end;
            }
            // Unbalanced from here on; no more candidates
            None => break,
        }
    }

    candidates
}
