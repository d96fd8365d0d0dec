//! Verdict extraction from a stage's final report.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Severity, StageOutcome, Verdict};
use crate::Result;

static VERDICT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:verdict|result|status)\s*[:=]\s*[*_`]*\s*(pass(?:ed)?|approved?|fail(?:ed)?|rejected?|changes[ _]requested|blocked)\b",
    )
    .unwrap()
});

static SEVERITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bseverity\s*[:=]\s*[*_`]*\s*(critical|high|medium|low)\b").unwrap()
});

static FAIL_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(tests? (?:are )?fail(?:ed|ing)?|changes requested|blocking issues?|not approved|\d+ failed)\b")
        .unwrap()
});

static PASS_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(all tests pass(?:ed)?|lgtm|approved|no issues found)\b").unwrap()
});

/// Structured completion acknowledgment attached to a stage report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionAck {
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl From<CompletionAck> for StageOutcome {
    fn from(ack: CompletionAck) -> Self {
        StageOutcome {
            verdict: ack.verdict,
            severity: ack.severity,
        }
    }
}

/// Extract a verdict and severity from free text.
///
/// An explicit `verdict:` line wins over loose phrases; a fail phrase wins
/// over a pass phrase.
pub fn parse_verdict(text: &str) -> (Option<Verdict>, Option<Severity>) {
    let severity = SEVERITY_RE
        .captures(text)
        .and_then(|c| match c[1].to_ascii_lowercase().as_str() {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            _ => None,
        });

    let verdict = VERDICT_RE
        .captures(text)
        .map(|c| {
            let word = c[1].to_ascii_lowercase();
            if word.starts_with("pass") || word.starts_with("approve") {
                Verdict::Pass
            } else {
                Verdict::Fail
            }
        })
        .or_else(|| FAIL_PHRASE_RE.is_match(text).then_some(Verdict::Fail))
        .or_else(|| PASS_PHRASE_RE.is_match(text).then_some(Verdict::Pass));

    (verdict, severity)
}

/// Text of the last assistant message in a JSONL transcript.
///
/// Returns `None` for a missing file or a transcript without assistant text.
pub fn last_assistant_message(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(is_assistant_entry)
        .find_map(|entry| entry_text(&entry)))
}

fn is_assistant_entry(entry: &Value) -> bool {
    entry.get("type").and_then(Value::as_str) == Some("assistant")
        || entry.pointer("/message/role").and_then(Value::as_str) == Some("assistant")
}

fn entry_text(entry: &Value) -> Option<String> {
    let content = entry.pointer("/message/content")?;
    let text = match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return None,
    };
    (!text.trim().is_empty()).then_some(text)
}
