//! Coach configuration loaded from `.env`, with an optional `coach.toml`
//! overlay for per-user settings (API key, model).
//!
//! Tunables for the routing pipeline: intent score floor, LLM-router
//! confidence, retrieval thresholds, registry cache TTL. Change behavior
//! without code edits.

use serde::{Deserialize, Serialize};

/// Pipeline configuration loaded from environment.
///
/// | Env | Default | Description |
/// |-----|---------|--------------|
/// | COACH_DB_PATH | ./data/coach_vault | Sled database path (catalog, sessions, transcript). |
/// | COACH_BIND_ADDR | 127.0.0.1:8080 | Gateway bind address. |
/// | COACH_LLM_MODEL | meta-llama/llama-3.3-70b-instruct | Completion backend model. |
/// | COACH_REGISTRY_TTL_SECS | 120 | Tool catalog cache freshness window. |
/// | COACH_ROUTER_LLM_ENABLED | true | Allow the LLM-assisted routing fallback. |
/// | COACH_MIN_INTENT_SCORE | 2.0 | Minimum aggregate score before a tool match counts. |
/// | COACH_ROUTER_CONFIDENCE | 0.6 | Minimum confidence to accept an LLM route decision. |
/// | COACH_RAG_TOP_K | 6 | Retrieval candidate count. |
/// | COACH_RAG_MIN_SCORE | 0.35 | Retrieval similarity floor. |
/// | COACH_DEBUG | false | Expose candidates/raw reply/timing in responses. |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoachConfig {
    pub db_path: String,
    pub bind_addr: String,
    /// COACH_LLM_API_KEY or OPENROUTER_API_KEY; `coach.toml` wins when present.
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_api_url: String,
    /// COACH_EMBED_URL: embedding + nearest-neighbor search endpoint. Unset => retrieval disabled.
    pub embed_url: Option<String>,
    pub registry_ttl_secs: u64,
    pub router_llm_enabled: bool,
    pub min_intent_score: f32,
    pub router_confidence: f32,
    pub rag_top_k: usize,
    pub rag_min_score: f32,
    pub debug: bool,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/coach_vault".to_string(),
            bind_addr: "127.0.0.1:8080".to_string(),
            llm_api_key: None,
            llm_model: DEFAULT_MODEL.to_string(),
            llm_api_url: DEFAULT_API_URL.to_string(),
            embed_url: None,
            registry_ttl_secs: 120,
            router_llm_enabled: true,
            min_intent_score: 2.0,
            router_confidence: 0.6,
            rag_top_k: 6,
            rag_min_score: 0.35,
            debug: false,
        }
    }
}

pub const DEFAULT_MODEL: &str = "meta-llama/llama-3.3-70b-instruct";
pub const DEFAULT_API_URL: &str = "https://openrouter.ai/api/v1";

impl CoachConfig {
    /// Load from environment. Unset or invalid => defaults (see struct field docs).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let user = UserConfig::load().ok();
        let llm_api_key = user
            .as_ref()
            .and_then(|u| u.get_api_key())
            .or_else(|| env_opt_string("COACH_LLM_API_KEY"))
            .or_else(|| env_opt_string("OPENROUTER_API_KEY"));
        let llm_model = user
            .as_ref()
            .and_then(|u| u.get_llm_model())
            .or_else(|| env_opt_string("COACH_LLM_MODEL"))
            .unwrap_or(defaults.llm_model);
        let llm_api_url = user
            .as_ref()
            .and_then(|u| u.get_llm_api_url())
            .or_else(|| env_opt_string("COACH_LLM_API_URL"))
            .unwrap_or(defaults.llm_api_url);
        Self {
            db_path: env_opt_string("COACH_DB_PATH").unwrap_or(defaults.db_path),
            bind_addr: env_opt_string("COACH_BIND_ADDR").unwrap_or(defaults.bind_addr),
            llm_api_key,
            llm_model,
            llm_api_url,
            embed_url: env_opt_string("COACH_EMBED_URL"),
            registry_ttl_secs: env_u64("COACH_REGISTRY_TTL_SECS", 120),
            router_llm_enabled: env_bool("COACH_ROUTER_LLM_ENABLED", true),
            min_intent_score: env_f32("COACH_MIN_INTENT_SCORE", 2.0, 0.0, 10.0),
            router_confidence: env_f32("COACH_ROUTER_CONFIDENCE", 0.6, 0.0, 1.0),
            rag_top_k: env_u64("COACH_RAG_TOP_K", 6).clamp(1, 50) as usize,
            rag_min_score: env_f32("COACH_RAG_MIN_SCORE", 0.35, 0.0, 1.0),
            debug: env_bool("COACH_DEBUG", false),
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let t = v.trim();
            if t.is_empty() {
                default
            } else {
                t.eq_ignore_ascii_case("true") || t == "1"
            }
        }
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_f32(name: &str, default: f32, lo: f32, hi: f32) -> f32 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse::<f32>().unwrap_or(default).clamp(lo, hi),
        Err(_) => default,
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// User configuration (coach.toml): per-user API key and model overrides,
// stored locally so operators can configure a deployment without touching
// environment variables.
// ---------------------------------------------------------------------------

use std::fs;
use std::path::{Path, PathBuf};

/// User-specific configuration stored in `coach.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub llm_api_url: Option<String>,
    /// Set to false after initial setup.
    #[serde(default = "default_first_run")]
    pub first_run: bool,
}

fn default_first_run() -> bool {
    true
}

impl UserConfig {
    pub fn default_path() -> PathBuf {
        PathBuf::from("coach.toml")
    }

    /// Load from `coach.toml` if present; missing file => defaults (no write).
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        Self::load_from_path(&Self::default_path())
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn get_api_key(&self) -> Option<String> {
        self.api_key.clone().filter(|s| !s.trim().is_empty())
    }

    pub fn get_llm_model(&self) -> Option<String> {
        self.llm_model.clone().filter(|s| !s.trim().is_empty())
    }

    pub fn get_llm_api_url(&self) -> Option<String> {
        self.llm_api_url.clone().filter(|s| !s.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_canonical_constants() {
        let cfg = CoachConfig::default();
        assert_eq!(cfg.registry_ttl_secs, 120);
        assert!((cfg.min_intent_score - 2.0).abs() < f32::EPSILON);
        assert!((cfg.router_confidence - 0.6).abs() < f32::EPSILON);
    }

    #[test]
    fn user_config_missing_file_is_default() {
        let cfg = UserConfig::load_from_path(Path::new("/nonexistent/coach.toml")).unwrap();
        assert!(cfg.first_run);
        assert!(cfg.get_api_key().is_none());
    }
}
