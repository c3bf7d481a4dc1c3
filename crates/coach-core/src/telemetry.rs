//! Fire-and-forget transcript/telemetry emission. Failures are logged and
//! swallowed; they never block or fail the main response.

use crate::store::CoachStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// One turn's telemetry record, appended to the transcript tree.
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub session_id: String,
    pub route: String,
    pub mode: String,
    pub user_text: String,
    pub reply_text: String,
    pub best_tool_slug: Option<String>,
    pub rag_count: usize,
    pub timestamp: DateTime<Utc>,
}

pub struct TelemetrySink {
    store: Arc<CoachStore>,
}

impl TelemetrySink {
    pub fn new(store: Arc<CoachStore>) -> Self {
        Self { store }
    }

    /// Emit without awaiting. The write happens on a spawned task and
    /// swallows its own errors.
    pub fn emit(&self, record: TurnRecord) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let key = format!(
                "{}:{}:{}",
                record.session_id,
                record.timestamp.timestamp_millis(),
                uuid::Uuid::new_v4()
            );
            let value = match serde_json::to_value(&record) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(target: "coach::telemetry", error = %e, "record serialize failed");
                    return;
                }
            };
            if let Err(e) = store.append_transcript(&key, &value) {
                tracing::warn!(target: "coach::telemetry", error = %e, "transcript write failed");
            }
        });
    }
}
