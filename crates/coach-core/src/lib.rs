//! coach-core: routing-and-policy pipeline for the small-business digital coach.
//!
//! The gateway composes one [`CoachPipeline`] per process; everything it needs
//! (catalog registry, session store, router, composer) is re-exported here so
//! add-ons keep a consistent public API.

mod bridge;
mod compose;
mod config;
mod error;
mod followup;
mod intent;
mod pipeline;
mod registry;
mod retrieval;
mod router;
mod sanitize;
mod shared;
mod store;
mod telemetry;

// Shared data model
pub use shared::{
    ConversationTurn, MediaItem, ProposedTool, RagMeta, Reply, Role, Route, RouteDecision,
    SessionState, Span, ToolDoc, ToolParams, DEFAULT_SESSION_ID,
};

// Configuration
pub use config::{CoachConfig, UserConfig};

// Errors
pub use error::{CoachError, CoachResult};

// Storage + catalog
pub use registry::{slugify, ToolRegistry};
pub use store::CoachStore;

// Intent + follow-up classification
pub use followup::{classify, parse_params, FollowupKind};
pub use intent::{detect_tool_from_assistant, match_tool_by_intent, score_tool};

// Backends
pub use bridge::{parse_json_object, CompletionBackend, CompletionBridge};
pub use retrieval::{DisabledIndex, RemoteIndex, Retriever, SemanticIndex};

// Routing, generation, enforcement
pub use compose::{render_reply, Candidate, Composer, ComposeHints, FALLBACK_MESSAGE};
pub use router::{is_media_request, CoachRouter, RouterOptions};
pub use sanitize::{build_allow_list, enforce, renumber_lists};

// Turn orchestration + telemetry
pub use pipeline::{render_plan, CoachPipeline, TurnRequest, TurnResponse};
pub use telemetry::{TelemetrySink, TurnRecord};
