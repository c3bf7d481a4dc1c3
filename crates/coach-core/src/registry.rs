//! Tool Registry Adapter: loads the internal tool catalog from storage,
//! coalesces heterogeneous row schemas into [`ToolDoc`], and caches the
//! result with a short TTL.
//!
//! The adapter is permissive by default: a row with no enabled-flag column
//! normalizes to `enabled = true` so legacy rows are not silently hidden.
//! Read failures yield an empty catalog, never an error, so the rest of the
//! pipeline degrades to "no tools known".

use crate::shared::ToolDoc;
use crate::store::CoachStore;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

const CATALOG_KEY: &str = "catalog";

/// Field-priority order for each canonical column.
const TITLE_FIELDS: &[&str] = &["title", "tool_name", "name", "display_name"];
const SLUG_FIELDS: &[&str] = &["slug", "tool_slug", "code"];
const SUMMARY_FIELDS: &[&str] = &["summary", "description"];
const WHY_FIELDS: &[&str] = &["why", "why_this", "reason"];
const OUTCOME_FIELDS: &[&str] = &["outcome", "result"];
const CONTENT_FIELDS: &[&str] = &["content", "body"];
const ENABLED_FIELDS: &[&str] = &["enabled", "is_enabled", "active", "is_active", "status"];
const TRUTHY_TOKENS: &[&str] = &["1", "true", "t", "y", "yes", "active", "enabled"];

/// Read-through cached view of the tool catalog.
pub struct ToolRegistry {
    store: Arc<CoachStore>,
    ttl: Duration,
    cache: DashMap<&'static str, (Instant, Arc<Vec<ToolDoc>>)>,
}

impl ToolRegistry {
    pub fn new(store: Arc<CoachStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: DashMap::new(),
        }
    }

    /// The normalized catalog. Concurrent refreshes may race; both populate
    /// the same cache entry, so staleness is the only consistency concern.
    pub fn get_tools(&self) -> Arc<Vec<ToolDoc>> {
        if let Some(entry) = self.cache.get(CATALOG_KEY) {
            let (loaded_at, tools) = entry.value();
            if loaded_at.elapsed() < self.ttl {
                return Arc::clone(tools);
            }
        }
        let tools = Arc::new(self.load_fresh());
        self.cache.insert(CATALOG_KEY, (Instant::now(), Arc::clone(&tools)));
        tools
    }

    fn load_fresh(&self) -> Vec<ToolDoc> {
        let rows = match self.store.tool_rows() {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(target: "coach::registry", error = %e, "catalog read failed; serving empty catalog");
                return Vec::new();
            }
        };
        let tools: Vec<ToolDoc> = rows.iter().filter_map(normalize_row).collect();
        tracing::info!(target: "coach::registry", count = tools.len(), "catalog refreshed");
        tools
    }
}

/// Coalesce one schema-flexible row into a [`ToolDoc`]. Returns `None` when
/// neither a title nor a slug can be resolved.
pub fn normalize_row(row: &Value) -> Option<ToolDoc> {
    let title = first_str(row, TITLE_FIELDS).unwrap_or_default();
    let slug = first_str(row, SLUG_FIELDS)
        .map(|s| slugify(&s))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| slugify(&title));
    if title.is_empty() && slug.is_empty() {
        return None;
    }
    let title = if title.is_empty() { slug.clone() } else { title };
    Some(ToolDoc {
        slug,
        title,
        summary: first_str(row, SUMMARY_FIELDS),
        why: first_str(row, WHY_FIELDS),
        outcome: first_str(row, OUTCOME_FIELDS),
        content: first_str(row, CONTENT_FIELDS),
        keywords: string_list(row, "keywords"),
        patterns: string_list(row, "patterns"),
        boost_phrases: string_list(row, "boost_phrases"),
        enabled: resolve_enabled(row),
    })
}

fn first_str(row: &Value, fields: &[&str]) -> Option<String> {
    for field in fields {
        if let Some(s) = row.get(*field).and_then(Value::as_str) {
            let s = s.trim();
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

/// Accepts a JSON array of strings or one comma-separated string.
fn string_list(row: &Value, field: &str) -> Vec<String> {
    match row.get(field) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// Boolean, numeric (`> 0`), or string truthy token. No flag column => true.
fn resolve_enabled(row: &Value) -> bool {
    for field in ENABLED_FIELDS {
        match row.get(*field) {
            Some(Value::Bool(b)) => return *b,
            Some(Value::Number(n)) => return n.as_f64().map(|f| f > 0.0).unwrap_or(false),
            Some(Value::String(s)) => {
                let token = s.trim().to_lowercase();
                if token.is_empty() {
                    continue;
                }
                return TRUTHY_TOKENS.contains(&token.as_str());
            }
            _ => continue,
        }
    }
    true
}

/// Lowercase, non-alphanumeric runs collapsed to `-`, trimmed.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_dash = false;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            prev_dash = false;
        } else if !prev_dash && !out.is_empty() {
            out.push('-');
            prev_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}
