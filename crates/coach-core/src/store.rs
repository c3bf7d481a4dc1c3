//! Sled-backed store: tool catalog rows, session state, and the append-only
//! transcript log. Catalog and sessions get a hot DashMap cache in front of
//! the trees.

use crate::error::CoachResult;
use crate::shared::SessionState;
use dashmap::DashMap;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

const TOOLS_TREE: &str = "tools";
const SESSIONS_TREE: &str = "sessions";
const TRANSCRIPT_TREE: &str = "transcript";

/// Long-term storage plus short-term session cache.
pub struct CoachStore {
    #[allow(dead_code)]
    db: Db,
    tools: Tree,
    sessions: Tree,
    transcript: Tree,
    /// Hot cache: session id -> state. Checked before sled.
    session_cache: Arc<DashMap<String, SessionState>>,
}

impl CoachStore {
    /// Opens or creates the sled database at the given path.
    pub fn open_path<P: AsRef<Path>>(path: P) -> CoachResult<Self> {
        let db = sled::open(path)?;
        let tools = db.open_tree(TOOLS_TREE)?;
        let sessions = db.open_tree(SESSIONS_TREE)?;
        let transcript = db.open_tree(TRANSCRIPT_TREE)?;
        Ok(Self {
            db,
            tools,
            sessions,
            transcript,
            session_cache: Arc::new(DashMap::new()),
        })
    }

    /// All raw catalog rows as JSON values. Rows that fail to parse are
    /// skipped, not fatal; the registry adapter handles shape coercion.
    pub fn tool_rows(&self) -> CoachResult<Vec<serde_json::Value>> {
        let mut rows = Vec::new();
        for entry in self.tools.iter() {
            let (_, value) = entry?;
            match serde_json::from_slice::<serde_json::Value>(&value) {
                Ok(v) => rows.push(v),
                Err(e) => {
                    tracing::warn!(target: "coach::store", error = %e, "skipping unparsable catalog row");
                }
            }
        }
        Ok(rows)
    }

    /// Insert or replace a catalog row (out-of-band editing surface).
    pub fn put_tool_row(&self, id: &str, row: &serde_json::Value) -> CoachResult<()> {
        let bytes = serde_json::to_vec(row)
            .map_err(|e| crate::error::CoachError::Parse(e.to_string()))?;
        self.tools.insert(id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Session state for the given id; missing or unreadable => default.
    pub fn get_session(&self, session_id: &str) -> SessionState {
        if let Some(state) = self.session_cache.get(session_id) {
            return state.clone();
        }
        match self.sessions.get(session_id.as_bytes()) {
            Ok(Some(bytes)) => {
                let state: SessionState = serde_json::from_slice(&bytes).unwrap_or_default();
                self.session_cache
                    .insert(session_id.to_string(), state.clone());
                state
            }
            Ok(None) => SessionState::default(),
            Err(e) => {
                tracing::warn!(target: "coach::store", error = %e, "session read failed");
                SessionState::default()
            }
        }
    }

    /// Persist session state. Last-write-wins; failures are logged, never
    /// surfaced (best-effort UX aid).
    pub fn put_session(&self, session_id: &str, state: &SessionState) {
        self.session_cache
            .insert(session_id.to_string(), state.clone());
        let bytes = match serde_json::to_vec(state) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(target: "coach::store", error = %e, "session serialize failed");
                return;
            }
        };
        if let Err(e) = self.sessions.insert(session_id.as_bytes(), bytes) {
            tracing::warn!(target: "coach::store", error = %e, "session write failed");
        }
    }

    /// Append a transcript/telemetry record. Key is caller-constructed to
    /// sort chronologically per session.
    pub fn append_transcript(&self, key: &str, record: &serde_json::Value) -> CoachResult<()> {
        let bytes = serde_json::to_vec(record)
            .map_err(|e| crate::error::CoachError::Parse(e.to_string()))?;
        self.transcript.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn tool_row_count(&self) -> usize {
        self.tools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{ProposedTool, ToolParams};
    use serde_json::json;

    fn temp_store() -> CoachStore {
        let dir = tempfile::tempdir().unwrap();
        CoachStore::open_path(dir.into_path()).unwrap()
    }

    #[test]
    fn session_roundtrip_and_cache() {
        let store = temp_store();
        assert!(store.get_session("s1").proposed.is_none());
        let state = SessionState {
            proposed: Some(ProposedTool {
                slug: "weekly-report".into(),
                title: "Weekly Report".into(),
                params: ToolParams::default(),
            }),
            reco: false,
        };
        store.put_session("s1", &state);
        let loaded = store.get_session("s1");
        assert_eq!(loaded.proposed.unwrap().slug, "weekly-report");
    }

    #[test]
    fn unparsable_rows_are_skipped() {
        let store = temp_store();
        store.put_tool_row("a", &json!({"title": "Weekly Report"})).unwrap();
        store.tools.insert(b"b", &b"not json"[..]).unwrap();
        assert_eq!(store.tool_rows().unwrap().len(), 1);
    }
}
