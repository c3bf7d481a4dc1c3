//! Policy Enforcement / Sanitizer: the "internal tools only" layer.
//!
//! Generated text is never trusted verbatim. Every `Try:` line is stripped,
//! lines promoting external brands are dropped, generic "pick a tool"
//! instructions are rewritten to the chosen internal tool, blank-line runs
//! are collapsed, and ordered lists are renumbered. Fenced code blocks pass
//! through untouched. After enforcement the output contains zero brand-like
//! external mentions and at most one canonical `Try:` line, present only
//! when a tool was deliberately chosen this turn.

use crate::intent::{normalize_text, token_overlap};
use crate::shared::ToolDoc;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Overlap against the allow-list at or above this counts as internal.
const ALLOW_OVERLAP: f32 = 0.7;

static TRY_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*try:\s*").expect("static regex"));

static HINT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(use|using|via|choose|pick|select|set\s?up|install|integrate|connect|leverage|with|app|apps|tool|tools|platform|plugin|software)\b",
    )
    .expect("static regex")
});

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)https?://\S+").expect("static regex"));

static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[a-z0-9][a-z0-9-]*\.(?:com|io|ai|app|net|org|co|dev)\b")
        .expect("static regex")
});

static CAP_PHRASE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z][A-Za-z0-9'&-]*(?:\s+[A-Z][A-Za-z0-9'&-]*){0,2}\b").expect("static regex")
});

static GENERIC_PICK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(pick|use|choose|select)\b\s+(?:a|an|any|some)\s+(?:\w+\s+)?(?:tool|app|platform|software)\b")
        .expect("static regex")
});

static LIST_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\s*)(\d+)([.)])\s+(.*)$").expect("static regex"));

/// Words that look capitalized but are never brand candidates: pronouns,
/// weekday names, and common sentence openers.
static STOPLIST: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "i", "i'm", "i'll", "i've", "i'd", "we", "we're", "you", "you're", "your", "yours",
        "he", "she", "they", "them", "their", "it", "its", "it's", "my", "our", "me", "us",
        "monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday",
        "mondays", "tuesdays", "wednesdays", "thursdays", "fridays", "saturdays", "sundays",
        "the", "a", "an", "this", "that", "these", "those", "if", "when", "while", "for",
        "and", "but", "or", "so", "also", "then", "next", "first", "second", "third",
        "finally", "consider", "start", "try", "use", "pick", "choose", "select", "make",
        "set", "ask", "keep", "remember", "note", "step", "tip", "tips", "do", "don't",
        "here", "what", "how", "why", "where", "who", "please", "once", "now", "today",
        "after", "before", "during", "every", "each", "one", "two", "three",
    ]
    .into_iter()
    .collect()
});

/// Normalized internal titles used as the allow-list.
pub fn build_allow_list(tools: &[ToolDoc]) -> Vec<String> {
    tools.iter().map(|t| normalize_text(&t.title)).collect()
}

/// Enforce the internal-tools-only policy over generated text.
pub fn enforce(text: &str, allowed_titles: &[String], chosen: Option<&ToolDoc>) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut in_fence = false;

    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            kept.push(line.to_string());
            continue;
        }
        if in_fence {
            kept.push(line.to_string());
            continue;
        }
        // Model-authored recommendation lines are never trusted.
        if TRY_LINE_RE.is_match(line) {
            continue;
        }
        if let Some(tool) = chosen {
            if GENERIC_PICK_RE.is_match(line) {
                let replacement = format!("Use **{}** for this", tool.title);
                let rewritten =
                    GENERIC_PICK_RE.replace_all(line, replacement.as_str()).into_owned();
                // The rest of the line can still carry a brand; the rewrite
                // never exempts it from the external check.
                if promotes_external(&rewritten, allowed_titles) {
                    tracing::debug!(target: "coach::sanitize", "dropped external-promoting line");
                    continue;
                }
                kept.push(rewritten);
                continue;
            }
        }
        if promotes_external(line, allowed_titles) {
            tracing::debug!(target: "coach::sanitize", "dropped external-promoting line");
            continue;
        }
        kept.push(line.to_string());
    }

    let collapsed = collapse_blank_runs(&kept);
    let mut out = renumber_lists(&collapsed.join("\n"));

    if let Some(tool) = chosen {
        while out.ends_with('\n') {
            out.pop();
        }
        if out.is_empty() {
            out = format!("Try: {}", tool.title);
        } else {
            out.push_str(&format!("\n\nTry: {}", tool.title));
        }
    }
    out
}

/// A line is external-promoting when it carries a hint phrase (or URL) and
/// at least one brand-like candidate not fuzzy-matched to the allow-list.
fn promotes_external(line: &str, allowed_titles: &[String]) -> bool {
    if !HINT_RE.is_match(line) && !URL_RE.is_match(line) {
        return false;
    }
    for candidate in brand_candidates(line) {
        let norm = normalize_text(&candidate);
        if norm.is_empty() {
            continue;
        }
        let allowed = allowed_titles
            .iter()
            .any(|title| token_overlap(&norm, title) >= ALLOW_OVERLAP);
        if !allowed {
            return true;
        }
    }
    false
}

/// Brand-like candidates in a line: domain-looking tokens plus capitalized
/// 1–3-word phrases, excluding stoplisted words and single capitalized
/// words opening a sentence.
fn brand_candidates(line: &str) -> Vec<String> {
    let mut out: Vec<String> = DOMAIN_RE
        .find_iter(line)
        .map(|m| m.as_str().to_string())
        .collect();

    for m in CAP_PHRASE_RE.find_iter(line) {
        let phrase = m.as_str();
        let words: Vec<&str> = phrase.split_whitespace().collect();
        if words
            .iter()
            .all(|w| STOPLIST.contains(w.to_lowercase().as_str()))
        {
            continue;
        }
        // A lone capitalized word at the start of a line or sentence is
        // ordinary prose, not a brand.
        if words.len() == 1 && at_sentence_start(line, m.start()) {
            continue;
        }
        out.push(phrase.to_string());
    }
    out
}

fn at_sentence_start(line: &str, offset: usize) -> bool {
    let before = line[..offset].trim_end();
    before.is_empty()
        || before.ends_with('.')
        || before.ends_with('!')
        || before.ends_with('?')
        || before.ends_with(':')
        || before.ends_with('-')
        || before.ends_with('*')
}

/// Collapse runs of 3+ blank lines to exactly one blank line; shorter runs
/// are kept as-is. Fenced blocks untouched.
fn collapse_blank_runs(lines: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut blanks: Vec<String> = Vec::new();
    let mut in_fence = false;
    for line in lines {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        if !in_fence && line.trim().is_empty() {
            blanks.push(line.clone());
            continue;
        }
        if !blanks.is_empty() {
            if blanks.len() >= 3 {
                out.push(String::new());
            } else {
                out.append(&mut blanks);
            }
            blanks.clear();
        }
        out.push(line.clone());
    }
    if !blanks.is_empty() {
        if blanks.len() >= 3 {
            out.push(String::new());
        } else {
            out.append(&mut blanks);
        }
    }
    out
}

/// Renumber ordered-list markers sequentially within contiguous blocks.
/// The counter resets on a blank line followed by non-list content and on
/// fenced code block boundaries. Idempotent: applying it twice yields the
/// same output.
pub fn renumber_lists(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut counter = 0usize;
    let mut in_fence = false;

    for (i, line) in lines.iter().enumerate() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            counter = 0;
            out.push((*line).to_string());
            continue;
        }
        if in_fence {
            out.push((*line).to_string());
            continue;
        }
        if let Some(c) = LIST_MARKER_RE.captures(line) {
            counter += 1;
            out.push(format!("{}{}{} {}", &c[1], counter, &c[3], &c[4]));
        } else if line.trim().is_empty() {
            let next_is_list = lines
                .get(i + 1)
                .map(|next| LIST_MARKER_RE.is_match(next))
                .unwrap_or(false);
            if !next_is_list {
                counter = 0;
            }
            out.push(String::new());
        } else {
            counter = 0;
            out.push((*line).to_string());
        }
    }
    out.join("\n")
}
