//! Integration test: full turn pipeline — routing, follow-up short-circuit,
//! generation, and policy enforcement over a real sled store.
//!
//! ## Scenarios
//! 1. Media request ("What books help train entry-level employees on daily
//!    checklists?") routes `qa`, renders 3-5 items with one trailing
//!    question, and never emits a `Try:` line.
//! 2. An accepted proposal ("yes") short-circuits: the router and generator
//!    are never called, the reply is a deterministic plan ending in the
//!    canonical `Try:` line, and the session flips to confirmed.
//! 3. Generated text promoting external brands is scrubbed; exactly one
//!    `Try:` line survives and it names the chosen internal tool.
//! 4. The explicit confirm flow merges approval-text parameters into the
//!    stored proposal and confirms it; an unknown slug falls back to a
//!    normal turn.
//! 5. Reject clears the proposal; refine re-renders the plan with merged
//!    parameters; askinfo answers without a `Try:` line.
//! 6. Empty generation output degrades to a non-empty fallback.
//! 7. Catalog rows lacking an enabled flag stay visible (permissive
//!    registry).

use async_trait::async_trait;
use coach_core::{
    CoachConfig, CoachError, CoachPipeline, CoachResult, CoachRouter, CoachStore,
    CompletionBackend, Composer, ConversationTurn, DisabledIndex, ProposedTool, Retriever, Role,
    RouterOptions, Route, SessionState, ToolParams, ToolRegistry, TurnRequest,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct ScriptedBackend {
    calls: AtomicUsize,
    responses: Vec<Value>,
}

impl ScriptedBackend {
    fn new(responses: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            responses,
        })
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete_json(&self, _system: &str, _user: &str) -> CoachResult<Value> {
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

/// Fails the test if the pipeline reaches for the backend at all.
struct ForbiddenBackend;

#[async_trait]
impl CompletionBackend for ForbiddenBackend {
    async fn complete_json(&self, _system: &str, _user: &str) -> CoachResult<Value> {
        panic!("backend must not be called on this path");
    }
    fn model(&self) -> &str {
        "forbidden"
    }
}

fn weekly_report_row() -> Value {
    json!({
        "tool_name": "Weekly Report",
        "slug": "weekly-report",
        "summary": "A recurring end-of-week status ritual for the whole team.",
        "why": "Keeps everyone honest about progress without meetings.",
        "keywords": ["report", "checklist", "status"],
        "patterns": [r"weekly\s+(report|update)"],
        "enabled": true
    })
}

fn pipeline_with(
    backend: Option<Arc<dyn CompletionBackend>>,
    rows: &[Value],
    llm_router: bool,
) -> (CoachPipeline, Arc<CoachStore>) {
    let dir = tempfile::tempdir().unwrap().into_path();
    let store = Arc::new(CoachStore::open_path(dir).unwrap());
    for (i, row) in rows.iter().enumerate() {
        store.put_tool_row(&format!("t{i}"), row).unwrap();
    }
    let registry = ToolRegistry::new(Arc::clone(&store), Duration::from_secs(120));
    let router = CoachRouter::new(
        Retriever::new(Arc::new(DisabledIndex)),
        backend.clone(),
        RouterOptions {
            rag_top_k: 5,
            rag_min_score: 0.35,
            min_intent_score: 2.0,
            confidence_threshold: 0.6,
            llm_enabled: llm_router,
        },
    );
    let composer = Composer::new(backend);
    let cfg = CoachConfig::default();
    let pipeline = CoachPipeline::new(registry, Arc::clone(&store), router, composer, cfg);
    (pipeline, store)
}

fn ask(q: &str) -> TurnRequest {
    TurnRequest {
        q: Some(q.to_string()),
        ..Default::default()
    }
}

fn ask_in_session(q: &str, session: &str) -> TurnRequest {
    TurnRequest {
        q: Some(q.to_string()),
        session_id: Some(session.to_string()),
        ..Default::default()
    }
}

fn try_lines(text: &str) -> Vec<&str> {
    text.lines()
        .filter(|l| l.trim_start().to_lowercase().starts_with("try:"))
        .collect()
}

#[tokio::test]
async fn media_request_routes_qa_with_items_and_no_try_line() {
    let backend = ScriptedBackend::new(vec![json!({
        "mode": "media_recs",
        "message": "A few reads that fit:",
        "items": [
            {"title": "The Checklist Manifesto", "by": "Atul Gawande", "why": "turns routine work into written steps", "takeaway": "write the checklist before the shift starts"},
            {"title": "The E-Myth Revisited", "by": "Michael Gerber", "why": "systems over heroics", "takeaway": "document one process this week"},
            {"title": "Atomic Habits", "by": "James Clear", "why": "small daily routines stick", "takeaway": "anchor the checklist to an existing habit"}
        ],
        "ask": "Which of these sounds closest to your team's situation?"
    })]);
    let (pipeline, _store) = pipeline_with(Some(backend), &[weekly_report_row()], false);

    let res = pipeline
        .handle_turn(ask(
            "What books help train entry-level employees on daily checklists?",
        ))
        .await
        .unwrap();

    assert_eq!(res.route, Route::Qa);
    let bullets = res.text.lines().filter(|l| l.starts_with("- ")).count();
    assert!((3..=5).contains(&bullets), "got {bullets} items:\n{}", res.text);
    assert!(res.text.contains("Checklist Manifesto"));
    assert!(res.text.trim_end().ends_with('?'), "should end with the one question");
    assert!(try_lines(&res.text).is_empty(), "media replies carry no Try line");
}

#[tokio::test]
async fn accept_short_circuits_without_router_or_generator() {
    let backend: Arc<dyn CompletionBackend> = Arc::new(ForbiddenBackend);
    let (pipeline, store) = pipeline_with(Some(backend), &[weekly_report_row()], true);
    store.put_session(
        "s1",
        &SessionState {
            proposed: Some(ProposedTool {
                slug: "weekly-report".into(),
                title: "Weekly Report".into(),
                params: ToolParams::default(),
            }),
            reco: false,
        },
    );

    let res = pipeline.handle_turn(ask_in_session("yes", "s1")).await.unwrap();

    assert_eq!(res.route, Route::Tools);
    assert!(res.text.contains("Weekly Report"));
    assert_eq!(try_lines(&res.text), vec!["Try: Weekly Report"]);
    let session = store.get_session("s1");
    assert!(session.reco, "explicit accept confirms the recommendation");
}

#[tokio::test]
async fn accept_resolves_from_previous_assistant_try_line() {
    let backend: Arc<dyn CompletionBackend> = Arc::new(ForbiddenBackend);
    let (pipeline, _store) = pipeline_with(Some(backend), &[weekly_report_row()], true);

    let req = TurnRequest {
        q: Some("yes, let's do it".into()),
        messages: vec![
            ConversationTurn {
                role: Role::User,
                content: "my team forgets status updates".into(),
            },
            ConversationTurn {
                role: Role::Assistant,
                content: "A weekly ritual would help.\n\nTry: Weekly Report".into(),
            },
        ],
        ..Default::default()
    };
    let res = pipeline.handle_turn(req).await.unwrap();
    assert_eq!(res.route, Route::Tools);
    assert_eq!(try_lines(&res.text), vec!["Try: Weekly Report"]);
}

#[tokio::test]
async fn external_brands_are_scrubbed_and_try_line_is_canonical() {
    let backend = ScriptedBackend::new(vec![json!({
        "mode": "offer_tool",
        "tool_slug": "weekly-report",
        "confidence": 0.9,
        "slots": {"cadence": "weekly"},
        "message": "A weekly rhythm would close the loop.\nTry: Asana\nUse Trello to manage the handoff.",
        "confirm_cta": "Want me to draft the first one?",
        "requires_confirmation": true
    })]);
    let (pipeline, store) = pipeline_with(Some(backend), &[weekly_report_row()], false);

    let res = pipeline
        .handle_turn(ask_in_session(
            "which tool should I use for weekly report updates?",
            "s2",
        ))
        .await
        .unwrap();

    assert_eq!(res.route, Route::Tools);
    assert!(!res.text.contains("Trello"));
    assert!(!res.text.contains("Asana"));
    assert_eq!(try_lines(&res.text), vec!["Try: Weekly Report"]);

    // Offered but not yet confirmed.
    let session = store.get_session("s2");
    assert_eq!(
        session.proposed.as_ref().map(|p| p.slug.as_str()),
        Some("weekly-report")
    );
    assert!(!session.reco);
}

#[tokio::test]
async fn confirm_flow_merges_approval_params_without_backend() {
    let backend: Arc<dyn CompletionBackend> = Arc::new(ForbiddenBackend);
    let (pipeline, store) = pipeline_with(Some(backend), &[weekly_report_row()], true);
    store.put_session(
        "s6",
        &SessionState {
            proposed: Some(ProposedTool {
                slug: "weekly-report".into(),
                title: "Weekly Report".into(),
                params: ToolParams {
                    cadence: Some("weekly".into()),
                    ..Default::default()
                },
            }),
            reco: false,
        },
    );

    let req = TurnRequest {
        session_id: Some("s6".into()),
        confirm_tool_slug: Some("weekly-report".into()),
        approval_text: Some("friday at 3pm".into()),
        ..Default::default()
    };
    let res = pipeline.handle_turn(req).await.unwrap();

    assert_eq!(res.route, Route::Tools);
    assert!(res.text.contains("- Cadence: weekly"), "stored field kept:\n{}", res.text);
    assert!(res.text.contains("- Day: friday"));
    assert!(res.text.contains("- Time: 3:00pm"));
    assert_eq!(try_lines(&res.text), vec!["Try: Weekly Report"]);
    assert!(store.get_session("s6").reco, "confirm counts as an explicit accept");
}

#[tokio::test]
async fn confirm_with_unknown_slug_falls_back_to_normal_turn() {
    let (pipeline, store) = pipeline_with(None, &[weekly_report_row()], false);

    let req = TurnRequest {
        q: Some("my margins are shrinking".into()),
        session_id: Some("s7".into()),
        confirm_tool_slug: Some("made-up".into()),
        ..Default::default()
    };
    let res = pipeline.handle_turn(req).await.unwrap();

    assert_eq!(res.route, Route::Coach);
    assert!(try_lines(&res.text).is_empty());
    assert!(!store.get_session("s7").reco);
}

#[tokio::test]
async fn reject_clears_the_proposal() {
    let (pipeline, store) = pipeline_with(None, &[weekly_report_row()], false);
    store.put_session(
        "s3",
        &SessionState {
            proposed: Some(ProposedTool {
                slug: "weekly-report".into(),
                title: "Weekly Report".into(),
                params: ToolParams::default(),
            }),
            reco: false,
        },
    );

    let res = pipeline
        .handle_turn(ask_in_session("no thanks", "s3"))
        .await
        .unwrap();

    assert_eq!(res.route, Route::Coach);
    assert!(store.get_session("s3").proposed.is_none());
    assert!(try_lines(&res.text).is_empty());
}

#[tokio::test]
async fn refine_merges_params_into_the_plan() {
    let (pipeline, store) = pipeline_with(None, &[weekly_report_row()], false);
    store.put_session(
        "s4",
        &SessionState {
            proposed: Some(ProposedTool {
                slug: "weekly-report".into(),
                title: "Weekly Report".into(),
                params: ToolParams {
                    cadence: Some("weekly".into()),
                    ..Default::default()
                },
            }),
            reco: false,
        },
    );

    let res = pipeline
        .handle_turn(ask_in_session("make it friday at 3pm", "s4"))
        .await
        .unwrap();

    assert_eq!(res.route, Route::Tools);
    assert!(res.text.contains("- Cadence: weekly"), "kept field:\n{}", res.text);
    assert!(res.text.contains("- Day: friday"));
    assert!(res.text.contains("- Time: 3:00pm"));
    assert_eq!(try_lines(&res.text), vec!["Try: Weekly Report"]);

    let merged = store.get_session("s4").proposed.unwrap().params;
    assert_eq!(merged.cadence.as_deref(), Some("weekly"));
    assert_eq!(merged.day.as_deref(), Some("friday"));
}

#[tokio::test]
async fn askinfo_answers_without_a_try_line() {
    let (pipeline, store) = pipeline_with(None, &[weekly_report_row()], false);
    store.put_session(
        "s5",
        &SessionState {
            proposed: Some(ProposedTool {
                slug: "weekly-report".into(),
                title: "Weekly Report".into(),
                params: ToolParams::default(),
            }),
            reco: false,
        },
    );

    let res = pipeline
        .handle_turn(ask_in_session("what does this tool do?", "s5"))
        .await
        .unwrap();

    assert!(res.text.contains("Weekly Report"));
    assert!(res.text.contains("status ritual"), "summary included:\n{}", res.text);
    assert!(try_lines(&res.text).is_empty(), "askinfo never recommends");
    assert!(!store.get_session("s5").reco);
}

#[tokio::test]
async fn empty_generation_degrades_to_fallback() {
    let backend = ScriptedBackend::new(vec![json!({"mode": "qa", "message": ""})]);
    let (pipeline, _store) = pipeline_with(Some(backend), &[], false);

    let res = pipeline
        .handle_turn(ask("help me think about pricing"))
        .await
        .unwrap();

    assert!(!res.text.trim().is_empty(), "never show an empty reply");
}

#[tokio::test]
async fn missing_user_text_is_an_input_error() {
    let (pipeline, _store) = pipeline_with(None, &[], false);
    let err = pipeline.handle_turn(TurnRequest::default()).await.unwrap_err();
    assert!(matches!(err, CoachError::BadRequest(_)));
}

#[tokio::test]
async fn rows_without_enabled_flag_stay_visible() {
    let row = json!({"tool_name": "Pulse Survey", "code": "pulse-survey"});
    let (pipeline, _store) = pipeline_with(None, &[row], false);
    let tools = pipeline.tools();
    assert_eq!(tools.len(), 1);
    assert!(tools[0].enabled, "registry is permissive by default");
    assert_eq!(tools[0].slug, "pulse-survey");
}
