//! Final-answer post-processing.
//!
//! Two adjustments run when the loop reaches a final answer: list-style
//! queries get structured enumeration, and queries carrying emotional
//! content get a brief acknowledgment prepended. Both are deterministic
//! text transforms, not model calls.

const LIST_MARKERS: &[&str] = &[
    "list",
    "what are",
    "which of",
    "steps",
    "options",
    "types of",
    "kinds of",
];

const EMOTION_MARKERS: &[&str] = &[
    "worried",
    "worrying",
    "stressed",
    "stressful",
    "anxious",
    "afraid",
    "scared",
    "frustrated",
    "overwhelmed",
    "panicking",
    "panic",
];

/// Whether the query reads like a request for a list.
pub fn wants_enumeration(query: &str) -> bool {
    let q = query.to_lowercase();
    LIST_MARKERS.iter().any(|m| q.contains(m))
}

/// Acknowledgment line for emotionally loaded queries, if warranted.
///
/// Exposed separately from [`post_process`] so the streaming path can
/// emit it before the first relayed chunk.
pub fn acknowledgment_for(query: &str) -> Option<&'static str> {
    let q = query.to_lowercase();
    if EMOTION_MARKERS.iter().any(|m| q.contains(m)) {
        Some("I understand this can feel stressful; let me walk you through it. ")
    } else {
        None
    }
}

/// Apply all final-answer adjustments.
pub fn post_process(query: &str, answer: &str) -> String {
    let mut out = if wants_enumeration(query) {
        enumerate(answer)
    } else {
        answer.to_string()
    };

    if let Some(ack) = acknowledgment_for(query) {
        out = format!("{ack}{out}");
    }

    out
}

/// Number multi-line answers when they aren't already structured.
///
/// Answers that are a single line, or already carry numbering or
/// bullets, pass through unchanged.
fn enumerate(answer: &str) -> String {
    let lines: Vec<&str> = answer.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() < 2 || lines.iter().any(|l| is_enumerated(l)) {
        return answer.to_string();
    }

    lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{}. {}", i + 1, line.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_enumerated(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("- ")
        || trimmed.starts_with("* ")
        || trimmed
            .split_once('.')
            .is_some_and(|(head, _)| head.chars().all(|c| c.is_ascii_digit()) && !head.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_query_gets_numbered() {
        let answer = "Keep mileage logs\nKeep receipts\nKeep bank statements";
        let out = post_process("What are the records I need to keep?", answer);
        assert!(out.contains("1. Keep mileage logs"));
        assert!(out.contains("3. Keep bank statements"));
    }

    #[test]
    fn already_enumerated_is_untouched() {
        let answer = "1. Keep logs\n2. Keep receipts";
        let out = post_process("List the records to keep", answer);
        assert_eq!(out, answer);
    }

    #[test]
    fn bulleted_answer_is_untouched() {
        let answer = "- mileage logs\n- receipts";
        let out = post_process("List the records", answer);
        assert_eq!(out, answer);
    }

    #[test]
    fn single_line_answer_is_untouched() {
        let answer = "Keep your mileage logs and receipts.";
        let out = post_process("What are the records to keep?", answer);
        assert_eq!(out, answer);
    }

    #[test]
    fn emotional_query_gets_acknowledgment() {
        let out = post_process(
            "I'm really worried about my audit, what do I do?",
            "Gather your records and respond by the deadline.",
        );
        assert!(out.starts_with("I understand"));
        assert!(out.contains("Gather your records"));
    }

    #[test]
    fn neutral_query_gets_no_acknowledgment() {
        let out = post_process(
            "What is the standard deduction?",
            "The standard deduction is $15,000.",
        );
        assert_eq!(out, "The standard deduction is $15,000.");
    }

    #[test]
    fn acknowledgment_and_enumeration_compose() {
        let out = post_process(
            "I'm stressed, list what I need for the audit",
            "Mileage logs\nReceipts",
        );
        assert!(out.starts_with("I understand"));
        assert!(out.contains("1. Mileage logs"));
    }
}
