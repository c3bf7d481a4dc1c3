//! Shared types for the coach pipeline: routes, tools, turns, spans, replies,
//! and per-session state.

use serde::{Deserialize, Serialize};

/// Default session id when the caller supplies none.
pub const DEFAULT_SESSION_ID: &str = "anonymous";

/// Coarse response mode for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Qa,
    Coach,
    Tools,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Qa => "qa",
            Route::Coach => "coach",
            Route::Tools => "tools",
        }
    }

    /// Parse a loose route label (from an LLM decision). Unknown labels => None.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "qa" => Some(Route::Qa),
            "coach" => Some(Route::Coach),
            "tools" | "tool" => Some(Route::Tools),
            _ => None,
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recommendable internal tool, normalized from a schema-flexible catalog row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolDoc {
    /// Stable identifier, unique, lowercase-kebab.
    pub slug: String,
    /// Display name.
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub why: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    /// Lowercase phrases for substring matching.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Regex strings tested against raw user text.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Declarative disambiguators: a phrase whose words all appear in the
    /// user text adds a fixed boost to this tool's intent score.
    #[serde(default)]
    pub boost_phrases: Vec<String>,
    /// Disabled tools are excluded from all matching.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// One turn of conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A scored snippet of retrieved grounding context. Ephemeral, one turn only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub content: String,
    pub score: f32,
}

/// Metadata describing how a set of spans was retrieved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagMeta {
    pub count: usize,
    pub mode: String,
    pub model: String,
}

/// Route decision produced fresh per turn; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    pub route: Route,
    pub rag_spans: Vec<Span>,
    pub rag_meta: Option<RagMeta>,
    pub best_tool_slug: Option<String>,
}

impl RouteDecision {
    pub fn plain(route: Route) -> Self {
        Self {
            route,
            rag_spans: Vec::new(),
            rag_meta: None,
            best_tool_slug: None,
        }
    }
}

/// Partial configuration parameters parsed from a refine follow-up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cadence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anonymous: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nudges: Option<u8>,
}

impl ToolParams {
    pub fn is_empty(&self) -> bool {
        self.cadence.is_none()
            && self.day.is_none()
            && self.time.is_none()
            && self.channel.is_none()
            && self.anonymous.is_none()
            && self.nudges.is_none()
    }

    /// Shallow merge: fields present in `newer` win.
    pub fn merged_with(&self, newer: &ToolParams) -> ToolParams {
        ToolParams {
            cadence: newer.cadence.clone().or_else(|| self.cadence.clone()),
            day: newer.day.clone().or_else(|| self.day.clone()),
            time: newer.time.clone().or_else(|| self.time.clone()),
            channel: newer.channel.clone().or_else(|| self.channel.clone()),
            anonymous: newer.anonymous.or(self.anonymous),
            nudges: newer.nudges.or(self.nudges),
        }
    }
}

/// The last tool offered in a session, pending accept/reject/refine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedTool {
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub params: ToolParams,
}

/// Per-session state. Last-write-wins; a best-effort UX aid, not a ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub proposed: Option<ProposedTool>,
    /// True only after the user explicitly accepted a proposed tool.
    #[serde(default)]
    pub reco: bool,
}

/// One item of a media recommendation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub title: String,
    #[serde(default)]
    pub by: Option<String>,
    pub why: String,
    pub takeaway: String,
}

/// Generation output, tagged by mode. Every variant's text is non-empty
/// after normalization; callers receiving an empty generation fall back to
/// a fixed safe string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Reply {
    Qa {
        message: String,
    },
    Coach {
        message: String,
    },
    MediaRecs {
        message: String,
        items: Vec<MediaItem>,
        #[serde(default)]
        ask: Option<String>,
    },
    OfferTool {
        tool_slug: String,
        confidence: f32,
        #[serde(default)]
        slots: serde_json::Value,
        message: String,
        confirm_cta: String,
        requires_confirmation: bool,
    },
    DeepDive {
        message: String,
    },
}

impl Reply {
    pub fn mode(&self) -> &'static str {
        match self {
            Reply::Qa { .. } => "qa",
            Reply::Coach { .. } => "coach",
            Reply::MediaRecs { .. } => "media_recs",
            Reply::OfferTool { .. } => "offer_tool",
            Reply::DeepDive { .. } => "deep_dive",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Reply::Qa { message }
            | Reply::Coach { message }
            | Reply::DeepDive { message }
            | Reply::MediaRecs { message, .. }
            | Reply::OfferTool { message, .. } => message,
        }
    }
}
