//! Follow-up Classifier: categorizes a turn relative to a previously
//! proposed tool. An `accept` short-circuits the pipeline before the router
//! and generator run; `refine` extracts a partial parameter object that is
//! shallow-merged over the stored one.

use crate::shared::ToolParams;
use once_cell::sync::Lazy;
use regex::Regex;

/// Classification of a turn relative to the proposed tool.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowupKind {
    Accept,
    Reject,
    AskInfo,
    Compare,
    Refine(ToolParams),
    None,
}

static ACCEPT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(yes|yep|yeah|yup|sure|ok(?:ay)?|do it|go ahead|go for it|sounds good|let'?s (?:do it|go)|please do|absolutely)\b",
    )
    .expect("static regex")
});

static REJECT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(no\b|nope|nah|pass\b|skip\b|not (?:now|really)|i(?:'d)? (?:rather|prefer) not|don'?t\b)")
        .expect("static regex")
});

static ASKINFO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(what (?:is|does) (?:this|it|that)(?:\s+tool)?(?:\s+do)?|how does (?:this|it|that) work|explain|tell me more|why\b)",
    )
    .expect("static regex")
});

static COMPARE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(alternatives?|compare|vs\.?|versus|other options)\b").expect("static regex")
});

static CADENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(daily|weekly|biweekly|monthly)\b").expect("static regex"));
static DAY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b")
        .expect("static regex")
});
static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*(am|pm)\b").expect("static regex"));
static CHANNEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(slack|email|app)\b").expect("static regex"));
static ANON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\banonymous(?:ly)?\b").expect("static regex"));
static NUDGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b([0-2])\s*(?:nudges?|reminders?)\b").expect("static regex"));

/// Best-effort field extraction from free text into a partial parameter
/// object. Absent fields stay `None`.
pub fn parse_params(text: &str) -> ToolParams {
    let mut params = ToolParams::default();
    if let Some(c) = CADENCE_RE.captures(text) {
        params.cadence = Some(c[1].to_lowercase());
    }
    if let Some(c) = DAY_RE.captures(text) {
        params.day = Some(c[1].to_lowercase());
    }
    if let Some(c) = TIME_RE.captures(text) {
        let hour = &c[1];
        let minutes = c.get(2).map(|m| m.as_str()).unwrap_or("00");
        let half = c[3].to_lowercase();
        params.time = Some(format!("{}:{}{}", hour, minutes, half));
    }
    if let Some(c) = CHANNEL_RE.captures(text) {
        params.channel = Some(c[1].to_lowercase());
    }
    if ANON_RE.is_match(text) {
        params.anonymous = Some(true);
    }
    if let Some(c) = NUDGE_RE.captures(text) {
        params.nudges = c[1].parse().ok();
    }
    params
}

/// Priority order: accept, reject, askinfo, compare, refine. Questions win
/// over parameter extraction so "tell me more about the weekly one" stays
/// an askinfo, not a refine.
pub fn classify(text: &str) -> FollowupKind {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return FollowupKind::None;
    }
    if ACCEPT_RE.is_match(trimmed) {
        return FollowupKind::Accept;
    }
    if REJECT_RE.is_match(trimmed) {
        return FollowupKind::Reject;
    }
    if ASKINFO_RE.is_match(trimmed) {
        return FollowupKind::AskInfo;
    }
    if COMPARE_RE.is_match(trimmed) {
        return FollowupKind::Compare;
    }
    let params = parse_params(trimmed);
    if !params.is_empty() {
        return FollowupKind::Refine(params);
    }
    FollowupKind::None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affirmations_accept() {
        for input in ["yes", "Yep, do it", "ok", "sounds good to me", "go ahead"] {
            assert_eq!(classify(input), FollowupKind::Accept, "{input}");
        }
    }

    #[test]
    fn negations_reject() {
        for input in ["no thanks", "nah", "skip it", "I'd prefer not to"] {
            assert_eq!(classify(input), FollowupKind::Reject, "{input}");
        }
    }

    #[test]
    fn questions_ask_info() {
        for input in ["what does this tool do?", "how does it work", "tell me more"] {
            assert_eq!(classify(input), FollowupKind::AskInfo, "{input}");
        }
    }

    #[test]
    fn comparisons_compare() {
        assert_eq!(classify("any other options?"), FollowupKind::Compare);
        assert_eq!(classify("how does this compare to alternatives"), FollowupKind::Compare);
    }

    #[test]
    fn parameters_refine() {
        let kind = classify("make it weekly on Friday at 3:30pm via Slack, anonymous, 2 reminders");
        match kind {
            FollowupKind::Refine(p) => {
                assert_eq!(p.cadence.as_deref(), Some("weekly"));
                assert_eq!(p.day.as_deref(), Some("friday"));
                assert_eq!(p.time.as_deref(), Some("3:30pm"));
                assert_eq!(p.channel.as_deref(), Some("slack"));
                assert_eq!(p.anonymous, Some(true));
                assert_eq!(p.nudges, Some(2));
            }
            other => panic!("expected refine, got {other:?}"),
        }
    }

    #[test]
    fn bare_time_refines() {
        match classify("3pm works") {
            FollowupKind::Refine(p) => assert_eq!(p.time.as_deref(), Some("3:00pm")),
            other => panic!("expected refine, got {other:?}"),
        }
    }

    #[test]
    fn unrelated_text_is_none() {
        assert_eq!(classify("my margins are shrinking"), FollowupKind::None);
        assert_eq!(classify("   "), FollowupKind::None);
    }

    #[test]
    fn merge_keeps_old_fields_new_wins() {
        let old = parse_params("weekly on monday");
        let new = parse_params("actually friday");
        let merged = old.merged_with(&new);
        assert_eq!(merged.cadence.as_deref(), Some("weekly"));
        assert_eq!(merged.day.as_deref(), Some("friday"));
    }
}
