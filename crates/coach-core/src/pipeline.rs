//! Turn orchestration: follow-up short-circuit, routing, generation, and
//! policy enforcement, in that order.
//!
//! A known "yes" to a known offer needs no model call: the accept path
//! renders the plan deterministically and bypasses the router and generator
//! entirely. Everything that leaves this module has passed the sanitizer.

use crate::compose::{render_reply, Composer, ComposeHints, FALLBACK_MESSAGE};
use crate::config::CoachConfig;
use crate::error::{CoachError, CoachResult};
use crate::followup::{classify, parse_params, FollowupKind};
use crate::intent::{detect_tool_from_assistant, normalize_text};
use crate::registry::ToolRegistry;
use crate::router::CoachRouter;
use crate::sanitize::{build_allow_list, enforce};
use crate::shared::{
    ConversationTurn, ProposedTool, Reply, Role, Route, SessionState, ToolDoc, ToolParams,
    DEFAULT_SESSION_ID,
};
use crate::store::CoachStore;
use crate::telemetry::{TelemetrySink, TurnRecord};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::sync::Arc;

static ORDINAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(first|second|third|fourth|fifth)\b|#([1-5])\b|\bnumber\s+([1-5])\b")
        .expect("static regex")
});

static LIST_ITEM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*(?:[-*]|\d+[.)])\s+(.+)$").expect("static regex"));

/// Inbound turn, already decoded from the HTTP body.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub q: Option<String>,
    pub messages: Vec<ConversationTurn>,
    pub session_id: Option<String>,
    pub confirm_tool_slug: Option<String>,
    pub approval_text: Option<String>,
}

/// Outcome of one turn.
#[derive(Debug, Clone)]
pub struct TurnResponse {
    pub route: Route,
    pub text: String,
    /// Extra fields exposed only when COACH_DEBUG is set.
    pub debug: Option<serde_json::Value>,
}

pub struct CoachPipeline {
    registry: ToolRegistry,
    store: Arc<CoachStore>,
    router: CoachRouter,
    composer: Composer,
    telemetry: TelemetrySink,
    cfg: CoachConfig,
}

impl CoachPipeline {
    pub fn new(
        registry: ToolRegistry,
        store: Arc<CoachStore>,
        router: CoachRouter,
        composer: Composer,
        cfg: CoachConfig,
    ) -> Self {
        let telemetry = TelemetrySink::new(Arc::clone(&store));
        Self {
            registry,
            store,
            router,
            composer,
            telemetry,
            cfg,
        }
    }

    pub fn store(&self) -> &Arc<CoachStore> {
        &self.store
    }

    pub fn tools(&self) -> Arc<Vec<ToolDoc>> {
        self.registry.get_tools()
    }

    /// Handle one turn end to end. Only input errors surface; every
    /// collaborator failure degrades to safe content.
    pub async fn handle_turn(&self, req: TurnRequest) -> CoachResult<TurnResponse> {
        let session_id = req
            .session_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string());
        let tools = self.registry.get_tools();
        let mut state = self.store.get_session(&session_id);

        // Explicit confirm flow from the UI: the user pressed the confirm
        // CTA for a specific tool.
        if let Some(slug) = req.confirm_tool_slug.as_deref() {
            if let Some(tool) = tools.iter().find(|t| t.slug == slug && t.enabled) {
                let extra = req
                    .approval_text
                    .as_deref()
                    .map(parse_params)
                    .unwrap_or_default();
                let params = state
                    .proposed
                    .as_ref()
                    .filter(|p| p.slug == slug)
                    .map(|p| p.params.merged_with(&extra))
                    .unwrap_or(extra);
                let noted = req.approval_text.clone().unwrap_or_default();
                return Ok(self.finish_accept(&session_id, &mut state, tool, params, &tools, &noted));
            }
            tracing::warn!(target: "coach::pipeline", slug, "confirm for unknown tool; continuing as normal turn");
        }

        let user_text = resolve_user_text(&req);
        if user_text.is_empty() {
            return Err(CoachError::BadRequest(
                "Please send a message to get started.".to_string(),
            ));
        }

        // A tool may have been proposed in session state, or offered in the
        // previous assistant turn's Try: line.
        let proposed = state.proposed.clone().or_else(|| {
            last_assistant_text(&req.messages)
                .and_then(|text| detect_tool_from_assistant(text, &tools))
                .map(|tool| ProposedTool {
                    slug: tool.slug.clone(),
                    title: tool.title.clone(),
                    params: ToolParams::default(),
                })
        });

        if let Some(proposed) = proposed {
            match classify(&user_text) {
                FollowupKind::Accept => {
                    let tool = find_tool(&tools, &proposed.slug)
                        .cloned()
                        .unwrap_or_else(|| placeholder_tool(&proposed));
                    let params = proposed.params.clone();
                    return Ok(self.finish_accept(
                        &session_id,
                        &mut state,
                        &tool,
                        params,
                        &tools,
                        &user_text,
                    ));
                }
                FollowupKind::Reject => {
                    state.proposed = None;
                    state.reco = false;
                    self.store.put_session(&session_id, &state);
                    // Falls through to the router with a clean slate.
                }
                FollowupKind::Refine(new_params) => {
                    let merged = proposed.params.merged_with(&new_params);
                    let tool = find_tool(&tools, &proposed.slug)
                        .cloned()
                        .unwrap_or_else(|| placeholder_tool(&proposed));
                    state.proposed = Some(ProposedTool {
                        slug: proposed.slug.clone(),
                        title: proposed.title.clone(),
                        params: merged.clone(),
                    });
                    self.store.put_session(&session_id, &state);
                    let text = render_plan(&tool.title, &merged);
                    let enforced = self.enforce_text(&text, &tools, Some(&tool));
                    self.emit(&session_id, Route::Tools, "plan", &user_text, &enforced, Some(&tool.slug), 0);
                    return Ok(TurnResponse {
                        route: Route::Tools,
                        text: enforced,
                        debug: None,
                    });
                }
                FollowupKind::AskInfo => {
                    let tool = find_tool(&tools, &proposed.slug)
                        .cloned()
                        .unwrap_or_else(|| placeholder_tool(&proposed));
                    // Informational only: no reco flag, no Try line.
                    let text = render_info(&tool);
                    let enforced = self.enforce_text(&text, &tools, None);
                    self.emit(&session_id, Route::Tools, "info", &user_text, &enforced, Some(&tool.slug), 0);
                    return Ok(TurnResponse {
                        route: Route::Tools,
                        text: enforced,
                        debug: None,
                    });
                }
                FollowupKind::Compare | FollowupKind::None => {}
            }
        }

        // Full path: route, generate, enforce.
        let last_reco = state.proposed.as_ref().map(|p| p.slug.clone());
        let decision = self
            .router
            .route(&user_text, &tools, last_reco.as_deref())
            .await;
        let candidates = self.router.candidates(&user_text, &tools);
        let hints = ComposeHints {
            route: Some(decision.route.as_str().to_string()),
            selection_title: detect_selection(&req.messages, &user_text),
            last_reco_slug: last_reco,
            spans: decision.rag_spans.clone(),
        };
        let reply = self
            .composer
            .compose(&user_text, &candidates, &req.messages, &hints)
            .await;

        // A tool is "chosen this turn" when the router matched one or the
        // generator offered a valid one.
        let chosen: Option<ToolDoc> = match &reply {
            Reply::OfferTool { tool_slug, .. } => find_tool(&tools, tool_slug).cloned(),
            _ => decision
                .best_tool_slug
                .as_deref()
                .and_then(|slug| find_tool(&tools, slug))
                .cloned(),
        };

        if decision.route == Route::Tools {
            if let Some(tool) = &chosen {
                let params = match &reply {
                    Reply::OfferTool { slots, .. } => {
                        serde_json::from_value::<ToolParams>(slots.clone()).unwrap_or_default()
                    }
                    _ => ToolParams::default(),
                };
                // Offered, not yet confirmed: reco stays false until an
                // explicit accept.
                state.proposed = Some(ProposedTool {
                    slug: tool.slug.clone(),
                    title: tool.title.clone(),
                    params,
                });
                state.reco = false;
                self.store.put_session(&session_id, &state);
            }
        }

        let rendered = render_reply(&reply);
        let chosen_ref = if decision.route == Route::Tools {
            chosen.as_ref()
        } else {
            None
        };
        let enforced = self.enforce_text(&rendered, &tools, chosen_ref);

        self.emit(
            &session_id,
            decision.route,
            reply.mode(),
            &user_text,
            &enforced,
            decision.best_tool_slug.as_deref(),
            decision.rag_spans.len(),
        );

        let debug = self.cfg.debug.then(|| {
            json!({
                "candidates": candidates,
                "reply": reply,
                "rag_meta": decision.rag_meta,
                "best_tool_slug": decision.best_tool_slug,
            })
        });

        Ok(TurnResponse {
            route: decision.route,
            text: enforced,
            debug,
        })
    }

    /// Shared tail of every accept path: plan, Try line, reco flag.
    fn finish_accept(
        &self,
        session_id: &str,
        state: &mut SessionState,
        tool: &ToolDoc,
        params: ToolParams,
        tools: &[ToolDoc],
        user_text: &str,
    ) -> TurnResponse {
        state.proposed = Some(ProposedTool {
            slug: tool.slug.clone(),
            title: tool.title.clone(),
            params: params.clone(),
        });
        state.reco = true;
        self.store.put_session(session_id, state);
        let text = render_plan(&tool.title, &params);
        let enforced = self.enforce_text(&text, tools, Some(tool));
        self.emit(session_id, Route::Tools, "plan", user_text, &enforced, Some(&tool.slug), 0);
        tracing::info!(target: "coach::pipeline", slug = %tool.slug, "accept short-circuit");
        TurnResponse {
            route: Route::Tools,
            text: enforced,
            debug: None,
        }
    }

    fn enforce_text(&self, text: &str, tools: &[ToolDoc], chosen: Option<&ToolDoc>) -> String {
        let allow = build_allow_list(tools);
        let enforced = enforce(text, &allow, chosen);
        if enforced.trim().is_empty() {
            FALLBACK_MESSAGE.to_string()
        } else {
            enforced
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        session_id: &str,
        route: Route,
        mode: &str,
        user_text: &str,
        reply_text: &str,
        best_tool_slug: Option<&str>,
        rag_count: usize,
    ) {
        self.telemetry.emit(TurnRecord {
            session_id: session_id.to_string(),
            route: route.as_str().to_string(),
            mode: mode.to_string(),
            user_text: user_text.to_string(),
            reply_text: reply_text.to_string(),
            best_tool_slug: best_tool_slug.map(str::to_string),
            rag_count,
            timestamp: Utc::now(),
        });
    }
}

/// Resolution order: explicit `q` field, then the last user-role message.
fn resolve_user_text(req: &TurnRequest) -> String {
    if let Some(q) = req.q.as_deref() {
        let q = q.trim();
        if !q.is_empty() {
            return q.to_string();
        }
    }
    req.messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.trim().to_string())
        .unwrap_or_default()
}

fn last_assistant_text(messages: &[ConversationTurn]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .map(|m| m.content.as_str())
}

fn find_tool<'a>(tools: &'a [ToolDoc], slug: &str) -> Option<&'a ToolDoc> {
    tools.iter().find(|t| t.slug == slug && t.enabled)
}

/// Catalog rows can disappear between turns; the session still remembers
/// enough to render a plan.
fn placeholder_tool(proposed: &ProposedTool) -> ToolDoc {
    ToolDoc {
        slug: proposed.slug.clone(),
        title: proposed.title.clone(),
        enabled: true,
        ..Default::default()
    }
}

/// Deterministic plan rendering for an accepted or refined tool. The
/// canonical `Try:` line is appended by the sanitizer.
pub fn render_plan(title: &str, params: &ToolParams) -> String {
    let mut out = format!("Here's the plan for **{title}**:");
    let mut any = false;
    if let Some(cadence) = &params.cadence {
        out.push_str(&format!("\n- Cadence: {cadence}"));
        any = true;
    }
    if let Some(day) = &params.day {
        out.push_str(&format!("\n- Day: {day}"));
        any = true;
    }
    if let Some(time) = &params.time {
        out.push_str(&format!("\n- Time: {time}"));
        any = true;
    }
    if let Some(channel) = &params.channel {
        out.push_str(&format!("\n- Channel: {channel}"));
        any = true;
    }
    if let Some(anonymous) = params.anonymous {
        out.push_str(&format!(
            "\n- Responses: {}",
            if anonymous { "anonymous" } else { "named" }
        ));
        any = true;
    }
    if let Some(nudges) = params.nudges {
        out.push_str(&format!("\n- Reminders: {nudges}"));
        any = true;
    }
    if !any {
        out.push_str("\nI'll start with sensible defaults; tell me a cadence, day, time, or channel to adjust.");
    }
    out
}

/// Informational blurb for an askinfo follow-up. No recommendation framing.
fn render_info(tool: &ToolDoc) -> String {
    let mut parts: Vec<String> = vec![format!("**{}**", tool.title)];
    if let Some(summary) = &tool.summary {
        parts.push(summary.clone());
    }
    if let Some(why) = &tool.why {
        parts.push(format!("Why it helps: {why}"));
    }
    if let Some(outcome) = &tool.outcome {
        parts.push(format!("What you get: {outcome}"));
    }
    if parts.len() == 1 {
        parts.push("It's one of our built-in tools; say the word and I'll walk you through it.".to_string());
    }
    parts.join("\n\n")
}

/// Resolve a reference to an item from the previous assistant list, either
/// by ordinal ("the second one") or by naming enough of the title.
fn detect_selection(messages: &[ConversationTurn], user_text: &str) -> Option<String> {
    let assistant = last_assistant_text(messages)?;
    let items: Vec<String> = LIST_ITEM_RE
        .captures_iter(assistant)
        .map(|c| clean_item_title(&c[1]))
        .filter(|t| !t.is_empty())
        .collect();
    if items.is_empty() {
        return None;
    }

    if let Some(c) = ORDINAL_RE.captures(user_text) {
        let idx = if let Some(word) = c.get(1) {
            match word.as_str().to_lowercase().as_str() {
                "first" => 0,
                "second" => 1,
                "third" => 2,
                "fourth" => 3,
                _ => 4,
            }
        } else {
            let digit = c.get(2).or_else(|| c.get(3))?.as_str();
            digit.parse::<usize>().ok()?.saturating_sub(1)
        };
        return items.get(idx).cloned();
    }

    // Title reference: every word of an item title appears in the text.
    let norm_text = normalize_text(user_text);
    let text_words: std::collections::HashSet<&str> = norm_text.split_whitespace().collect();
    items
        .iter()
        .find(|title| {
            let norm = normalize_text(title);
            let words: Vec<&str> = norm.split_whitespace().collect();
            !words.is_empty() && words.iter().all(|w| text_words.contains(w))
        })
        .cloned()
}

/// Take the leading title out of a rendered list item: markdown bold
/// stripped, trailing author/why segments cut.
fn clean_item_title(raw: &str) -> String {
    let stripped = raw.replace("**", "");
    let head = stripped
        .split(['—', ':'])
        .next()
        .unwrap_or(&stripped)
        .split(" by ")
        .next()
        .unwrap_or(&stripped);
    head.trim().trim_matches('"').to_string()
}
