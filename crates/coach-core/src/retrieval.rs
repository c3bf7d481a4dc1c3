//! Retrieval Adapter: wraps the embedding + nearest-neighbor collaborator
//! with score thresholds, a single near-miss widening pass, and span
//! deduplication. On any search failure it returns empty spans, never an
//! error; the router degrades to its next rule.

use crate::error::{CoachError, CoachResult};
use crate::shared::{RagMeta, Span};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// If nothing clears the floor, the single best span is still kept when its
/// score is within this margin of the floor.
const NEAR_MISS_MARGIN: f32 = 0.20;
/// Spans sharing the same leading slice are considered duplicates.
const DEDUP_PREFIX_CHARS: usize = 120;
const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Embedding + nearest-neighbor search contract.
#[async_trait]
pub trait SemanticIndex: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> CoachResult<Vec<Span>>;

    /// Whether the index is configured at all (drives diagnostics).
    fn is_configured(&self) -> bool {
        true
    }

    /// Backend label for retrieval metadata.
    fn model(&self) -> &str;
}

/// HTTP-backed index: POST `{query, top_k}`, receive scored spans.
pub struct RemoteIndex {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl RemoteIndex {
    pub fn new(url: &str, model: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: url.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl SemanticIndex for RemoteIndex {
    async fn search(&self, query: &str, top_k: usize) -> CoachResult<Vec<Span>> {
        let res = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "query": query, "top_k": top_k }))
            .send()
            .await
            .map_err(|e| CoachError::Backend(format!("search request failed: {e}")))?;
        if !res.status().is_success() {
            return Err(CoachError::Backend(format!(
                "search API error {}",
                res.status()
            )));
        }
        res.json::<Vec<Span>>()
            .await
            .map_err(|e| CoachError::Parse(format!("search response parse failed: {e}")))
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Index used when no search endpoint is configured: always empty.
pub struct DisabledIndex;

#[async_trait]
impl SemanticIndex for DisabledIndex {
    async fn search(&self, _query: &str, _top_k: usize) -> CoachResult<Vec<Span>> {
        Ok(Vec::new())
    }

    fn is_configured(&self) -> bool {
        false
    }

    fn model(&self) -> &str {
        "disabled"
    }
}

/// Threshold + fallback policy over a [`SemanticIndex`].
pub struct Retriever {
    index: Arc<dyn SemanticIndex>,
}

impl Retriever {
    pub fn new(index: Arc<dyn SemanticIndex>) -> Self {
        Self { index }
    }

    pub fn is_configured(&self) -> bool {
        self.index.is_configured()
    }

    /// Retrieve grounding spans for a query. Filters to `score >= min_score`;
    /// if nothing clears the floor, widens once to the single best near-miss.
    pub async fn retrieve(&self, query: &str, top_k: usize, min_score: f32) -> (Vec<Span>, RagMeta) {
        let candidates = match self.index.search(query, top_k).await {
            Ok(spans) => spans,
            Err(e) => {
                tracing::warn!(target: "coach::retrieval", error = %e, "search failed; serving no spans");
                Vec::new()
            }
        };

        let mut spans: Vec<Span> = candidates
            .iter()
            .filter(|s| s.score >= min_score)
            .cloned()
            .collect();

        if spans.is_empty() {
            // One widening pass: keep a close-enough single best match
            // rather than discarding it.
            if let Some(best) = candidates
                .iter()
                .max_by(|a, b| a.score.total_cmp(&b.score))
            {
                if best.score >= min_score - NEAR_MISS_MARGIN {
                    tracing::debug!(target: "coach::retrieval", score = best.score, "near-miss widening kept one span");
                    spans.push(best.clone());
                }
            }
        }

        let spans = dedup_spans(spans);
        let meta = RagMeta {
            count: spans.len(),
            mode: "raw".to_string(),
            model: self.index.model().to_string(),
        };
        (spans, meta)
    }
}

/// Drop spans whose leading characters duplicate an earlier span.
fn dedup_spans(spans: Vec<Span>) -> Vec<Span> {
    let mut seen: HashSet<String> = HashSet::new();
    spans
        .into_iter()
        .filter(|s| {
            let prefix: String = s
                .content
                .chars()
                .take(DEDUP_PREFIX_CHARS)
                .collect::<String>()
                .trim()
                .to_lowercase();
            seen.insert(prefix)
        })
        .collect()
}
