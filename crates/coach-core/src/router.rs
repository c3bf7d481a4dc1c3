//! Router: chooses one of {qa, coach, tools} for a turn. QA-first policy
//! with media and tool guards, evaluated in order, first match wins:
//!
//! 1. Media guard — requests for books/podcasts/articles/courses are always
//!    `qa`, never `tools`.
//! 2. QA hint — docs/policy/where phrasing triggers retrieval; spans above
//!    the floor return `qa` with grounding.
//! 3. Explicit tool-seeking phrasing routes to `tools`.
//! 4. Optional LLM-assisted fallback, accepted only above a confidence
//!    threshold and never allowed to invent a tool slug.
//! 5. Default `coach`.
//!
//! The router never fails a turn: retrieval or backend errors degrade to
//! the next rule.

use crate::bridge::CompletionBackend;
use crate::compose::Candidate;
use crate::intent::{match_tool_by_intent, score_tool};
use crate::retrieval::Retriever;
use crate::shared::{Route, RouteDecision, ToolDoc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;

/// Candidates sent to the LLM fallback.
const MAX_LLM_CANDIDATES: usize = 5;

static MEDIA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(books?|audiobooks?|podcasts?|articles?|courses?|newsletters?|blogs?|videos?|reading list|something to (?:read|listen to|watch))\b",
    )
    .expect("static regex")
});

static QA_HINT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(where (?:is|can i find|do i)|docs?|documentation|policy|policies|wiki|link|handbook|sop|guideline)\b",
    )
    .expect("static regex")
});

static TOOL_SEEK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(which|what|recommend(?: me)? a?|suggest a?|is there a)\s+tool\b|\brecommend a tool\b")
        .expect("static regex")
});

/// Broad "asking for reading/listening material" detection, shared with the
/// composer's self-heal check.
pub fn is_media_request(text: &str) -> bool {
    MEDIA_RE.is_match(text)
}

const ROUTER_SYSTEM: &str = r#"You are a routing classifier for a small-business coach. Reply with ONE JSON object: {"route":"qa"|"coach"|"tools","tool_slug":string|null,"confidence":number}.
Rules: pick "tools" only when the user wants a concrete internal capability, and tool_slug MUST be one of the provided candidate slugs — never invent one. Never pick "tools" for book/podcast/article/course requests. If the user just affirmed a previous offer, prefer "tools" with the last_reco_slug. "qa" is for factual/reference questions, "coach" for everything else."#;

pub struct RouterOptions {
    pub rag_top_k: usize,
    pub rag_min_score: f32,
    pub min_intent_score: f32,
    pub confidence_threshold: f32,
    pub llm_enabled: bool,
}

pub struct CoachRouter {
    retriever: Retriever,
    backend: Option<Arc<dyn CompletionBackend>>,
    opts: RouterOptions,
}

impl CoachRouter {
    pub fn new(
        retriever: Retriever,
        backend: Option<Arc<dyn CompletionBackend>>,
        opts: RouterOptions,
    ) -> Self {
        Self {
            retriever,
            backend,
            opts,
        }
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Decide the route for a turn. Never fails; collaborator errors degrade
    /// to the next rule or the default.
    pub async fn route(
        &self,
        user_text: &str,
        tools: &[ToolDoc],
        last_reco_slug: Option<&str>,
    ) -> RouteDecision {
        // 1. Media guard: reading-material requests must never become a
        //    tool recommendation.
        if is_media_request(user_text) {
            tracing::info!(target: "coach::router", route = "qa", rule = "media_guard", "routed");
            return RouteDecision::plain(Route::Qa);
        }

        // 2. QA hint with retrieval.
        if QA_HINT_RE.is_match(user_text) {
            let (spans, meta) = self
                .retriever
                .retrieve(user_text, self.opts.rag_top_k, self.opts.rag_min_score)
                .await;
            if !spans.is_empty() {
                tracing::info!(target: "coach::router", route = "qa", rule = "qa_hint", count = meta.count, "routed");
                return RouteDecision {
                    route: Route::Qa,
                    rag_spans: spans,
                    rag_meta: Some(meta),
                    best_tool_slug: None,
                };
            }
        }

        // 3. Explicit tool-seeking phrasing.
        if TOOL_SEEK_RE.is_match(user_text) {
            let best = match_tool_by_intent(user_text, tools, self.opts.min_intent_score);
            tracing::info!(target: "coach::router", route = "tools", rule = "tool_seek", best = best.map(|t| t.slug.as_str()), "routed");
            let mut decision = RouteDecision::plain(Route::Tools);
            decision.best_tool_slug = best.map(|t| t.slug.clone());
            return decision;
        }

        // 4. LLM-assisted fallback, best-effort.
        if self.opts.llm_enabled {
            if let Some(decision) = self.llm_fallback(user_text, tools, last_reco_slug).await {
                return decision;
            }
        }

        // 5. Default.
        tracing::info!(target: "coach::router", route = "coach", rule = "default", "routed");
        RouteDecision::plain(Route::Coach)
    }

    /// Intent-scored candidate list for the LLM fallback.
    pub fn candidates(&self, user_text: &str, tools: &[ToolDoc]) -> Vec<Candidate> {
        let mut scored: Vec<Candidate> = tools
            .iter()
            .filter(|t| t.enabled)
            .map(|t| Candidate {
                slug: t.slug.clone(),
                title: t.title.clone(),
                score: score_tool(user_text, t),
            })
            .filter(|c| c.score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(MAX_LLM_CANDIDATES);
        scored
    }

    async fn llm_fallback(
        &self,
        user_text: &str,
        tools: &[ToolDoc],
        last_reco_slug: Option<&str>,
    ) -> Option<RouteDecision> {
        let backend = self.backend.as_ref()?;
        let candidates = self.candidates(user_text, tools);
        let payload = json!({
            "message": user_text,
            "candidates": candidates,
            "last_reco_slug": last_reco_slug,
        });
        // Any call or parse failure is swallowed; the deterministic default
        // already computed stands.
        let value = match backend.complete_json(ROUTER_SYSTEM, &payload.to_string()).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(target: "coach::router", error = %e, "llm fallback failed; keeping deterministic decision");
                return None;
            }
        };
        self.accept_llm_decision(&value, &candidates)
    }

    fn accept_llm_decision(
        &self,
        value: &Value,
        candidates: &[Candidate],
    ) -> Option<RouteDecision> {
        let confidence = value
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as f32;
        if confidence < self.opts.confidence_threshold {
            return None;
        }
        let route = value
            .get("route")
            .and_then(Value::as_str)
            .and_then(Route::parse)?;
        let slug = value
            .get("tool_slug")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|s| !s.is_empty());
        if route == Route::Tools {
            // Never accept an invented slug.
            let slug = slug.filter(|s| candidates.iter().any(|c| &c.slug == s))?;
            tracing::info!(target: "coach::router", route = "tools", rule = "llm", slug = %slug, confidence, "routed");
            let mut decision = RouteDecision::plain(Route::Tools);
            decision.best_tool_slug = Some(slug);
            return Some(decision);
        }
        tracing::info!(target: "coach::router", route = %route, rule = "llm", confidence, "routed");
        Some(RouteDecision::plain(route))
    }
}
