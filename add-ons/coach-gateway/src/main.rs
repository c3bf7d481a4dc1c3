//! Axum-based API gateway for the coach pipeline. Config-driven via
//! CoachConfig; the LLM API key stays in the backend only — the frontend is
//! a stateless client and must never receive or send it.

use axum::{
    extract::{Json, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use coach_core::{
    CoachConfig, CoachError, CoachPipeline, CoachRouter, CoachStore, CompletionBackend,
    CompletionBridge, Composer, ConversationTurn, DisabledIndex, RemoteIndex, Retriever, Role,
    RouterOptions, SemanticIndex, ToolRegistry, TurnRequest,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const GATEWAY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
struct AppState {
    pipeline: Arc<CoachPipeline>,
    llm_configured: bool,
    index_configured: bool,
}

#[tokio::main]
async fn main() {
    // Load .env first; all API keys stay backend-side.
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[coach-gateway] .env not loaded: {e} (using system environment)");
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = CoachConfig::from_env();

    let store = match CoachStore::open_path(&cfg.db_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("[coach-gateway] cannot open database at {}: {e}", cfg.db_path);
            std::process::exit(1);
        }
    };

    // Handle --import-tools <file.json>: load catalog rows and exit.
    let args: Vec<String> = std::env::args().collect();
    if let Some(pos) = args.iter().position(|a| a == "--import-tools") {
        let path = args.get(pos + 1).cloned().unwrap_or_default();
        if path.is_empty() {
            eprintln!("Usage: coach-gateway --import-tools <file.json>");
            std::process::exit(1);
        }
        match import_tools(&store, &path) {
            Ok(n) => {
                println!("Imported {n} tool row(s) from {path}.");
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("Import failed: {e}");
                std::process::exit(1);
            }
        }
    }

    if cfg.llm_api_key.is_none() {
        eprintln!("[coach-gateway] Hint: set COACH_LLM_API_KEY or OPENROUTER_API_KEY in .env for live generation; the gateway holds the key, the frontend never sees it.");
    }

    let state = build_state(cfg.clone(), store);
    let app = build_app(state);

    let listener = match tokio::net::TcpListener::bind(&cfg.bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("[coach-gateway] cannot bind {}: {e}", cfg.bind_addr);
            std::process::exit(1);
        }
    };
    tracing::info!(target: "coach::gateway", addr = %cfg.bind_addr, version = GATEWAY_VERSION, "listening");
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("[coach-gateway] server error: {e}");
        std::process::exit(1);
    }
}

fn build_state(cfg: CoachConfig, store: Arc<CoachStore>) -> AppState {
    let registry = ToolRegistry::new(
        Arc::clone(&store),
        Duration::from_secs(cfg.registry_ttl_secs),
    );
    let backend: Option<Arc<dyn CompletionBackend>> =
        CompletionBridge::from_config(&cfg).map(|b| Arc::new(b) as Arc<dyn CompletionBackend>);
    let llm_configured = backend.is_some();

    let index: Arc<dyn SemanticIndex> = match cfg.embed_url.as_deref() {
        Some(url) => Arc::new(RemoteIndex::new(url, "remote-embed")),
        None => Arc::new(DisabledIndex),
    };
    let index_configured = index.is_configured();
    let retriever = Retriever::new(index);

    let router = CoachRouter::new(
        retriever,
        backend.clone(),
        RouterOptions {
            rag_top_k: cfg.rag_top_k,
            rag_min_score: cfg.rag_min_score,
            min_intent_score: cfg.min_intent_score,
            confidence_threshold: cfg.router_confidence,
            llm_enabled: cfg.router_llm_enabled,
        },
    );
    let composer = Composer::new(backend);
    let pipeline = Arc::new(CoachPipeline::new(registry, store, router, composer, cfg));

    AppState {
        pipeline,
        llm_configured,
        index_configured,
    }
}

fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/tools", get(tools_list))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

/// Turn endpoint. Anticipated collaborator failures still produce 200 with
/// degraded content; only missing user text is a client error.
async fn chat(State(state): State<AppState>, Json(body): Json<Value>) -> impl IntoResponse {
    let req = parse_turn_request(&body);
    match state.pipeline.handle_turn(req).await {
        Ok(turn) => {
            let mut payload = json!({
                "status": "ok",
                "route": turn.route.as_str(),
                "text": turn.text,
            });
            if let Some(debug) = turn.debug {
                payload["debug"] = debug;
            }
            (StatusCode::OK, axum::Json(payload))
        }
        Err(CoachError::BadRequest(msg)) => (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({ "status": "error", "error": msg })),
        ),
        Err(e) => {
            tracing::error!(target: "coach::gateway", error = %e, "turn failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({ "status": "error", "error": "internal error" })),
            )
        }
    }
}

async fn tools_list(State(state): State<AppState>) -> impl IntoResponse {
    let tools = state.pipeline.tools();
    axum::Json(json!({
        "status": "ok",
        "count": tools.len(),
        "tools": *tools,
    }))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "version": GATEWAY_VERSION,
        "tool_rows": state.pipeline.store().tool_row_count(),
        "llm_configured": state.llm_configured,
        "index_configured": state.index_configured,
    }))
}

fn first_str(body: &Value, fields: &[&str]) -> Option<String> {
    fields
        .iter()
        .find_map(|f| body.get(*f).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

const TEXT_ALIASES: &[&str] = &["q", "question", "message", "text", "prompt"];

/// Decode a loosely-shaped chat body. Clients vary: `q`/`message`/`text`,
/// camelCase ids, or everything nested under `data`. Text resolution order:
/// top-level aliases, then the last user-role message, then `data.*` aliases.
fn parse_turn_request(body: &Value) -> TurnRequest {
    let nested = body.get("data").filter(|v| v.is_object());
    let messages = ["messages", "history"]
        .iter()
        .find_map(|f| body.get(*f).or_else(|| nested.and_then(|d| d.get(*f))).cloned())
        .and_then(|v| serde_json::from_value::<Vec<ConversationTurn>>(v).ok())
        .unwrap_or_default();
    let has_user_message = messages
        .iter()
        .any(|m| m.role == Role::User && !m.content.trim().is_empty());
    let q = first_str(body, TEXT_ALIASES).or_else(|| {
        if has_user_message {
            None
        } else {
            nested.and_then(|d| first_str(d, TEXT_ALIASES))
        }
    });
    TurnRequest {
        q,
        messages,
        session_id: first_str(body, &["session_id", "sessionId", "session"]),
        confirm_tool_slug: first_str(body, &["confirm_tool_slug", "confirmToolSlug"]),
        approval_text: first_str(body, &["approval_text", "approvalText"]),
    }
}

fn import_tools(store: &CoachStore, path: &str) -> Result<usize, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    let rows: Vec<Value> = serde_json::from_str(&raw)?;
    let mut imported = 0usize;
    for (i, row) in rows.iter().enumerate() {
        let id = row
            .get("slug")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("row-{i}"));
        store.put_tool_row(&id, row)?;
        imported += 1;
    }
    Ok(imported)
}
