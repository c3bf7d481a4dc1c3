//! Response Generator / Composer: builds a schema-constrained request to the
//! completion backend per mode and normalizes its structured output.
//!
//! Provider output is schema-loose by nature; normalization tolerates the
//! common field-naming variants at the boundary instead of trusting
//! structure. A single self-heal retry runs when the mode contradicts an
//! unambiguous signal (media request, prior-list selection) or a deep dive
//! comes back thin; after that, a deterministic template guarantees the
//! user never sees an empty or trivial reply.

use crate::bridge::CompletionBackend;
use crate::router::is_media_request;
use crate::shared::{ConversationTurn, MediaItem, Reply, Role, Span};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;

/// Shown whenever generation produced nothing usable.
pub const FALLBACK_MESSAGE: &str =
    "I'm here to help. Could you share a bit more about what you're working on?";

/// History turns sent to the backend.
const HISTORY_WINDOW: usize = 12;
/// Minimum normalized length for a deep dive to count as substantial.
const DEEP_DIVE_MIN_CHARS: usize = 180;

static LIST_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(?:\d+[.)]|[-*])\s+\S").expect("static regex"));

/// Candidate tool passed to the backend for grounding.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Candidate {
    pub slug: String,
    pub title: String,
    pub score: f32,
}

/// Per-turn hints for the composer.
#[derive(Debug, Clone, Default)]
pub struct ComposeHints {
    /// Route already decided for this turn, if any.
    pub route: Option<String>,
    /// Resolved title when the user referenced a prior list item.
    pub selection_title: Option<String>,
    /// Slug of the last tool the user affirmed, if any.
    pub last_reco_slug: Option<String>,
    /// Retrieved grounding spans.
    pub spans: Vec<Span>,
}

const SYSTEM_INSTRUCTION: &str = r#"You are a digital coach for small-business owners. Reply with ONE JSON object, no prose outside it, choosing exactly one mode:

- "qa": {"mode":"qa","message":string} — answer a factual question, grounded in the provided spans when present.
- "coach": {"mode":"coach","message":string} — practical coaching guidance.
- "media_recs": {"mode":"media_recs","message":string,"items":[{"title","by","why","takeaway"}],"ask":string} — 3 to 5 items, each with title, why, and takeaway; exactly one trailing follow-up question in "ask".
- "offer_tool": {"mode":"offer_tool","tool_slug":string,"confidence":number,"slots":object,"message":string,"confirm_cta":string,"requires_confirmation":true} — tool_slug MUST be one of the provided candidates. Never include a ready-to-execute plan, only a confirmation prompt.
- "deep_dive": {"mode":"deep_dive","message":string} — a thorough breakdown of the referenced item, with a numbered or bulleted structure.

Rules: pick media_recs for any books/podcasts/articles/courses request. Pick deep_dive when a selection_title hint is present. Never invent tool slugs. Never recommend external products, apps, or services by name."#;

pub struct Composer {
    backend: Option<Arc<dyn CompletionBackend>>,
}

impl Composer {
    pub fn new(backend: Option<Arc<dyn CompletionBackend>>) -> Self {
        Self { backend }
    }

    /// One schema-constrained generation with the bounded self-heal retry.
    pub async fn compose(
        &self,
        user_text: &str,
        candidates: &[Candidate],
        history: &[ConversationTurn],
        hints: &ComposeHints,
    ) -> Reply {
        let context = self.build_context(user_text, candidates, history, hints);
        let mut reply = self.generate_once(&context).await;

        if self.needs_retry(user_text, hints, &reply) {
            tracing::info!(target: "coach::compose", mode = reply.mode(), "self-heal retry");
            reply = self.generate_once(&context).await;
        }

        // After the bounded retry, substitute deterministic content rather
        // than showing a thin or mis-moded deep dive.
        if let Some(title) = hints.selection_title.as_deref() {
            let ok = matches!(&reply, Reply::DeepDive { message } if looks_substantial(message));
            if !ok {
                reply = template_deep_dive(title);
            }
        }
        reply
    }

    async fn generate_once(&self, context: &Value) -> Reply {
        let value = match &self.backend {
            Some(backend) => {
                match backend
                    .complete_json(SYSTEM_INSTRUCTION, &context.to_string())
                    .await
                {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(target: "coach::compose", error = %e, "generation failed; using empty object");
                        json!({})
                    }
                }
            }
            None => json!({}),
        };
        normalize_reply(&value)
    }

    fn needs_retry(&self, user_text: &str, hints: &ComposeHints, reply: &Reply) -> bool {
        if self.backend.is_none() {
            return false;
        }
        if is_media_request(user_text) && !matches!(reply, Reply::MediaRecs { .. }) {
            return true;
        }
        if hints.selection_title.is_some() {
            return match reply {
                Reply::DeepDive { message } => !looks_substantial(message),
                _ => true,
            };
        }
        false
    }

    fn build_context(
        &self,
        user_text: &str,
        candidates: &[Candidate],
        history: &[ConversationTurn],
        hints: &ComposeHints,
    ) -> Value {
        let recent: Vec<Value> = history
            .iter()
            .rev()
            .take(HISTORY_WINDOW)
            .rev()
            .map(|t| {
                json!({
                    "role": match t.role {
                        Role::User => "user",
                        Role::Assistant => "assistant",
                        Role::System => "system",
                    },
                    "content": t.content,
                })
            })
            .collect();
        let spans: Vec<Value> = hints
            .spans
            .iter()
            .map(|s| json!({"title": s.title, "content": s.content, "score": s.score}))
            .collect();
        json!({
            "message": user_text,
            "candidates": candidates,
            "history": recent,
            "hints": {
                "route": hints.route,
                "selection_title": hints.selection_title,
                "last_reco_slug": hints.last_reco_slug,
            },
            "grounding": spans,
        })
    }
}

/// True when the text carries a numbered or bulleted list and enough body.
pub fn looks_substantial(message: &str) -> bool {
    let normalized: String = message.split_whitespace().collect::<Vec<_>>().join(" ");
    LIST_LINE_RE.is_match(message) && normalized.chars().count() >= DEEP_DIVE_MIN_CHARS
}

/// Deterministic deep-dive scaffold used when generation cannot produce a
/// substantial one.
pub fn template_deep_dive(title: &str) -> Reply {
    Reply::DeepDive {
        message: format!(
            "Here is a practical way to get value out of \"{title}\":\n\n\
             1. Skim the table of contents and pick the one chapter closest to your current bottleneck.\n\
             2. Read that chapter first and write down the single idea you could apply this week.\n\
             3. Turn that idea into one small experiment with your team and set a date to review it.\n\
             4. Only then go back and read the rest, noting what confirms or contradicts your experiment.\n\n\
             Start small: one idea applied beats ten ideas highlighted."
        ),
    }
}

fn loose_str(value: &Value, fields: &[&str]) -> Option<String> {
    for f in fields {
        if let Some(s) = value.get(*f).and_then(Value::as_str) {
            let s = s.trim();
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

fn non_empty(message: Option<String>) -> String {
    message
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| FALLBACK_MESSAGE.to_string())
}

/// Normalize a provider JSON object into a [`Reply`], tolerating field-name
/// variants. Unknown or missing mode => coach.
pub fn normalize_reply(value: &Value) -> Reply {
    let mode = loose_str(value, &["mode", "type"]).unwrap_or_default();
    let message = loose_str(value, &["message", "text", "reply", "intro"]);
    match mode.as_str() {
        "qa" => Reply::Qa {
            message: non_empty(message),
        },
        "media_recs" | "media" => {
            let raw_items = ["items", "recommendations", "recs"]
                .iter()
                .find_map(|f| value.get(*f).and_then(Value::as_array).cloned())
                .unwrap_or_default();
            let items: Vec<MediaItem> = raw_items
                .iter()
                .filter_map(|item| {
                    let title = loose_str(item, &["title", "name"])?;
                    Some(MediaItem {
                        title,
                        by: loose_str(item, &["by", "author"]),
                        why: loose_str(item, &["why", "reason", "why_this"]).unwrap_or_default(),
                        takeaway: loose_str(item, &["takeaway", "key_takeaway", "lesson"])
                            .unwrap_or_default(),
                    })
                })
                .collect();
            Reply::MediaRecs {
                message: non_empty(message),
                items,
                ask: loose_str(value, &["ask", "question", "follow_up"]),
            }
        }
        "offer_tool" | "offer" => {
            let tool_slug = loose_str(value, &["tool_slug", "slug", "tool"]).unwrap_or_default();
            if tool_slug.is_empty() {
                return Reply::Coach {
                    message: non_empty(message),
                };
            }
            let confidence = value
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(0.0)
                .clamp(0.0, 1.0) as f32;
            let slots = ["slots", "params"]
                .iter()
                .find_map(|f| value.get(*f).filter(|v| v.is_object()).cloned())
                .unwrap_or_else(|| json!({}));
            Reply::OfferTool {
                tool_slug,
                confidence,
                slots,
                message: non_empty(message),
                confirm_cta: loose_str(value, &["confirm_cta", "cta", "confirm"])
                    .unwrap_or_else(|| "Want me to set this up?".to_string()),
                requires_confirmation: true,
            }
        }
        "deep_dive" => Reply::DeepDive {
            message: non_empty(message),
        },
        _ => Reply::Coach {
            message: non_empty(message),
        },
    }
}

/// Render a reply to the final user-facing text (pre-enforcement).
pub fn render_reply(reply: &Reply) -> String {
    match reply {
        Reply::Qa { message } | Reply::Coach { message } | Reply::DeepDive { message } => {
            message.clone()
        }
        Reply::MediaRecs { message, items, ask } => {
            let mut out = message.clone();
            for item in items {
                out.push_str("\n- **");
                out.push_str(&item.title);
                out.push_str("**");
                if let Some(by) = &item.by {
                    out.push_str(&format!(" by {by}"));
                }
                if !item.why.is_empty() {
                    out.push_str(&format!(" — {}", item.why));
                }
                if !item.takeaway.is_empty() {
                    out.push_str(&format!(" Takeaway: {}", item.takeaway));
                }
            }
            let ask = ask
                .clone()
                .unwrap_or_else(|| "Which of these sounds most useful to you?".to_string());
            out.push_str("\n\n");
            out.push_str(&ask);
            out
        }
        Reply::OfferTool {
            message,
            confirm_cta,
            ..
        } => format!("{message}\n\n{confirm_cta}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoachResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn empty_object_becomes_safe_coach_reply() {
        let reply = normalize_reply(&json!({}));
        assert_eq!(reply.mode(), "coach");
        assert_eq!(reply.message(), FALLBACK_MESSAGE);
    }

    #[test]
    fn empty_qa_message_falls_back() {
        let reply = normalize_reply(&json!({"mode": "qa", "message": ""}));
        assert_eq!(reply.mode(), "qa");
        assert!(!reply.message().is_empty());
    }

    #[test]
    fn media_field_variants_normalize() {
        let reply = normalize_reply(&json!({
            "mode": "media_recs",
            "text": "Some reads:",
            "recommendations": [
                {"name": "The E-Myth Revisited", "author": "Gerber", "reason": "systems", "lesson": "work on the business"},
                {"title": "Deep Work", "why_this": "focus", "takeaway": "block time"}
            ],
            "question": "Want a summary of one?"
        }));
        match reply {
            Reply::MediaRecs { items, ask, .. } => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].why, "systems");
                assert_eq!(items[1].takeaway, "block time");
                assert_eq!(ask.as_deref(), Some("Want a summary of one?"));
            }
            other => panic!("expected media_recs, got {}", other.mode()),
        }
    }

    #[test]
    fn offer_without_slug_degrades_to_coach() {
        let reply = normalize_reply(&json!({"mode": "offer_tool", "message": "try a thing"}));
        assert_eq!(reply.mode(), "coach");
    }

    #[test]
    fn offer_normalizes_confirmation_and_confidence() {
        let reply = normalize_reply(&json!({
            "mode": "offer_tool",
            "slug": "weekly-report",
            "confidence": 7.5,
            "message": "A weekly report could help.",
            "requires_confirmation": false
        }));
        match reply {
            Reply::OfferTool {
                tool_slug,
                confidence,
                requires_confirmation,
                ..
            } => {
                assert_eq!(tool_slug, "weekly-report");
                assert!((confidence - 1.0).abs() < f32::EPSILON);
                assert!(requires_confirmation);
            }
            other => panic!("expected offer_tool, got {}", other.mode()),
        }
    }

    #[test]
    fn substantial_heuristic_requires_list_and_length() {
        assert!(!looks_substantial("short note"));
        let long_flat = "x".repeat(300);
        assert!(!looks_substantial(&long_flat));
        let listy = format!("Intro\n1. {}\n2. more", "y".repeat(200));
        assert!(looks_substantial(&listy));
    }

    struct ScriptedBackend {
        calls: AtomicUsize,
        responses: Vec<Value>,
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete_json(&self, _s: &str, _u: &str) -> CoachResult<Value> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .responses
                .get(i)
                .cloned()
                .unwrap_or_else(|| self.responses.last().cloned().unwrap_or(json!({}))))
        }
        fn model(&self) -> &str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn media_mode_mismatch_retries_once() {
        let backend = Arc::new(ScriptedBackend {
            calls: AtomicUsize::new(0),
            responses: vec![
                json!({"mode": "coach", "message": "delegate more"}),
                json!({"mode": "media_recs", "message": "reads", "items": [
                    {"title": "A", "why": "w", "takeaway": "t"},
                    {"title": "B", "why": "w", "takeaway": "t"},
                    {"title": "C", "why": "w", "takeaway": "t"}
                ], "ask": "Which one?"}),
            ],
        });
        let composer = Composer::new(Some(backend.clone()));
        let reply = composer
            .compose("recommend a book about delegation", &[], &[], &ComposeHints::default())
            .await;
        assert_eq!(reply.mode(), "media_recs");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_deep_dive_retry_substitutes_template() {
        let backend = Arc::new(ScriptedBackend {
            calls: AtomicUsize::new(0),
            responses: vec![json!({"mode": "deep_dive", "message": "thin"})],
        });
        let composer = Composer::new(Some(backend.clone()));
        let hints = ComposeHints {
            selection_title: Some("Deep Work".to_string()),
            ..Default::default()
        };
        let reply = composer.compose("tell me more about the second one", &[], &[], &hints).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        match reply {
            Reply::DeepDive { message } => {
                assert!(message.contains("Deep Work"));
                assert!(looks_substantial(&message));
            }
            other => panic!("expected deep_dive, got {}", other.mode()),
        }
    }
}
