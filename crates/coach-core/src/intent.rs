//! Intent Matcher: decides whether a specific internal tool is being
//! requested, using regex patterns, keyword overlap, fuzzy token overlap,
//! and per-tool boost phrases. Each tool is scored; the strictly highest
//! score above the floor wins, ties keep the first tool encountered.

use crate::shared::ToolDoc;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;

/// Weight of one successful regex pattern hit.
const PATTERN_WEIGHT: f32 = 2.0;
/// Weight of one keyword substring hit.
const KEYWORD_WEIGHT: f32 = 1.0;
/// Multiplier applied to the token-overlap ratio.
const OVERLAP_WEIGHT: f32 = 3.0;
/// Additive boost when a tool's boost phrase matches the user text.
const BOOST_WEIGHT: f32 = 3.0;
/// Keywords shorter than this are ignored (noisy short tokens like "ok").
const MIN_KEYWORD_LEN: usize = 4;
/// Minimum title overlap to accept an assistant-authored `Try:` back-reference.
const TRY_LINE_OVERLAP: f32 = 0.7;

static TRY_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^try:\s*(.+)$").expect("static regex"));

/// Lowercase, drop the literal word "tool"/"tools", collapse non-alphanumerics
/// to single spaces.
pub fn normalize_text(s: &str) -> String {
    let lower = s.to_lowercase();
    let mut out = String::with_capacity(lower.len());
    let mut prev_space = true;
    for c in lower.chars() {
        if c.is_alphanumeric() {
            out.push(c);
            prev_space = false;
        } else if !prev_space {
            out.push(' ');
            prev_space = true;
        }
    }
    out.split_whitespace()
        .filter(|w| *w != "tool" && *w != "tools")
        .collect::<Vec<_>>()
        .join(" ")
}

fn token_set(s: &str) -> HashSet<String> {
    normalize_text(s).split_whitespace().map(String::from).collect()
}

/// Jaccard-like overlap: |intersection| / max(|A|, |B|). Empty on either
/// side => 0. Identical normalized strings => 1.0.
pub fn token_overlap(a: &str, b: &str) -> f32 {
    let sa = token_set(a);
    let sb = token_set(b);
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }
    let inter = sa.intersection(&sb).count();
    inter as f32 / sa.len().max(sb.len()) as f32
}

/// Aggregate intent score of one tool against raw user text.
pub fn score_tool(text: &str, tool: &ToolDoc) -> f32 {
    let lower = text.to_lowercase();
    let mut score = 0.0_f32;

    // Strongest signal: curated regex patterns against the raw text.
    // Malformed patterns contribute 0, never abort matching.
    for pattern in &tool.patterns {
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(re) => {
                if re.is_match(text) {
                    score += PATTERN_WEIGHT;
                }
            }
            Err(e) => {
                tracing::warn!(target: "coach::intent", slug = %tool.slug, error = %e, "malformed tool pattern");
            }
        }
    }

    for keyword in &tool.keywords {
        let kw = keyword.trim().to_lowercase();
        if kw.len() >= MIN_KEYWORD_LEN && lower.contains(&kw) {
            score += KEYWORD_WEIGHT;
        }
    }

    let haystack = [
        tool.title.as_str(),
        tool.summary.as_deref().unwrap_or(""),
        tool.why.as_deref().unwrap_or(""),
        tool.outcome.as_deref().unwrap_or(""),
        tool.content.as_deref().unwrap_or(""),
    ]
    .join(" ");
    score += OVERLAP_WEIGHT * token_overlap(text, &haystack);

    // Declarative per-tool disambiguators: every word of the phrase must
    // appear in the user text.
    for phrase in &tool.boost_phrases {
        let words: Vec<String> = normalize_text(phrase)
            .split_whitespace()
            .map(String::from)
            .collect();
        if !words.is_empty() {
            let norm = normalize_text(text);
            let text_tokens: HashSet<&str> = norm.split_whitespace().collect();
            if words.iter().all(|w| text_tokens.contains(w.as_str())) {
                score += BOOST_WEIGHT;
                break;
            }
        }
    }

    score
}

/// The enabled tool with the strictly highest score at or above `floor`.
/// A synthetic tie deterministically keeps the first tool encountered.
pub fn match_tool_by_intent<'a>(
    text: &str,
    tools: &'a [ToolDoc],
    floor: f32,
) -> Option<&'a ToolDoc> {
    let mut best: Option<(&ToolDoc, f32)> = None;
    for tool in tools.iter().filter(|t| t.enabled) {
        let score = score_tool(text, tool);
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((tool, score)),
        }
    }
    match best {
        Some((tool, score)) if score >= floor => {
            tracing::debug!(target: "coach::intent", slug = %tool.slug, score, "intent match");
            Some(tool)
        }
        _ => None,
    }
}

/// Resolve a tool previously offered in assistant text: extract the first
/// `Try: <candidate>` line and fuzzy-match the candidate against tool titles.
pub fn detect_tool_from_assistant<'a>(text: &str, tools: &'a [ToolDoc]) -> Option<&'a ToolDoc> {
    let captured = TRY_LINE_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())?;
    let mut best: Option<(&ToolDoc, f32)> = None;
    for tool in tools.iter().filter(|t| t.enabled) {
        let overlap = token_overlap(captured, &tool.title);
        match best {
            Some((_, b)) if overlap <= b => {}
            _ => best = Some((tool, overlap)),
        }
    }
    best.filter(|(_, overlap)| *overlap >= TRY_LINE_OVERLAP)
        .map(|(tool, _)| tool)
}
