//! # Retriever
//!
//! Chooses which documents ground a prompt.
//!
//! With a loaded [`EventIndex`] the query is embedded and the persisted
//! snapshot is searched; the live candidate list is only used to decide that
//! retrieval should happen at all. Without an index the first `top_k`
//! candidates are passed through untouched, in arrival order.
//!
//! The snapshot and the live candidates come from different fetches and are
//! never reconciled: ranked results may contain events that are not in the
//! current candidate list, and fresh candidates that postdate the snapshot can
//! never be ranked. This is a known limitation.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::embedder::Embedder;
use crate::event::EventRecord;
use crate::vector_index::EventIndex;

pub const DEFAULT_TOP_K: usize = 5;

/// One entry of a grounding context.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    /// Pre-rendered text (ranked results are rendered with [`EventRecord::display_doc`]).
    Passage(String),
    /// A candidate record passed through without ranking.
    Event(EventRecord),
}

impl Document {
    /// Text placed in the prompt's context block.
    pub fn render(&self) -> Cow<'_, str> {
        match self {
            Document::Passage(text) => Cow::Borrowed(text),
            Document::Event(record) => Cow::Owned(record.context_line()),
        }
    }
}

/// Ranked retrieval when an index is loaded; unranked truncation otherwise.
#[derive(Clone)]
pub struct Retriever {
    index: Option<Arc<EventIndex>>,
    embedder: Option<Arc<dyn Embedder>>,
    top_k: usize,
    embed_timeout: Duration,
}

impl Retriever {
    /// A retriever that only truncates.
    pub fn unindexed(top_k: usize) -> Self {
        Self {
            index: None,
            embedder: None,
            top_k: top_k.max(1),
            embed_timeout: Duration::from_secs(30),
        }
    }

    /// A retriever that ranks against `index` using `embedder` for queries.
    pub fn indexed(index: Arc<EventIndex>, embedder: Arc<dyn Embedder>, top_k: usize) -> Self {
        Self {
            index: Some(index),
            embedder: Some(embedder),
            top_k: top_k.max(1),
            embed_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    pub fn is_indexed(&self) -> bool {
        self.index.as_ref().is_some_and(|index| !index.is_empty()) && self.embedder.is_some()
    }

    /// Pick up to `top_k` documents for `query`.
    ///
    /// Returns nothing when `candidates` is empty; the caller is expected to
    /// fall back to an ungrounded prompt in that case. A failed or timed-out
    /// index search is logged and answered by truncation instead.
    pub async fn retrieve(&self, query: &str, candidates: &[EventRecord]) -> Vec<Document> {
        if candidates.is_empty() {
            debug!("No candidates, skipping retrieval");
            return Vec::new();
        }

        if let (Some(index), Some(embedder)) = (&self.index, &self.embedder) {
            if !index.is_empty() {
                match self.ranked(index, embedder, query).await {
                    Ok(records) => {
                        debug!("Ranked retrieval returned {} documents", records.len());
                        return records
                            .iter()
                            .map(|record| Document::Passage(record.display_doc()))
                            .collect();
                    }
                    Err(reason) => {
                        warn!("Index search failed ({}), using unranked candidates", reason);
                    }
                }
            }
        }

        self.truncate(candidates)
    }

    /// The first `top_k` candidates, unchanged and in order.
    pub fn truncate(&self, candidates: &[EventRecord]) -> Vec<Document> {
        candidates
            .iter()
            .take(self.top_k)
            .cloned()
            .map(Document::Event)
            .collect()
    }

    async fn ranked(
        &self,
        index: &Arc<EventIndex>,
        embedder: &Arc<dyn Embedder>,
        query: &str,
    ) -> Result<Vec<EventRecord>, String> {
        let index = Arc::clone(index);
        let embedder = Arc::clone(embedder);
        let query = query.to_string();
        let k = self.top_k;

        let task = tokio::task::spawn_blocking(move || index.search(embedder.as_ref(), &query, k));

        match tokio::time::timeout(self.embed_timeout, task).await {
            Ok(Ok(Ok(records))) => Ok(records),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(join_error)) => Err(format!("search task failed: {join_error}")),
            Err(_) => Err(format!("timed out after {:?}", self.embed_timeout)),
        }
    }
}
