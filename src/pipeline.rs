//! # Events assistant
//!
//! Per-question orchestration:
//!
//! 1. resolve the city and date window from the question;
//! 2. fetch live candidates (possibly none);
//! 3. no candidates: ask the model directly with the fallback prompt;
//! 4. otherwise retrieve documents, join them into a context block and build
//!    the grounded prompt;
//! 5. open the generation stream and hand it back.
//!
//! Conversation history is accepted on the request but plays no part in
//! retrieval or prompting.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::event::EventRecord;
use crate::generator::{FragmentStream, GenerationError, StreamingGenerator};
use crate::prompt::PromptBuilder;
use crate::query::QueryResolver;
use crate::retriever::{Document, Retriever};
use crate::sources::EventSource;

/// A prior exchange supplied by the caller. The role is kept as free text
/// since history is never sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Inbound question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            history: Vec::new(),
        }
    }
}

/// The prompt chosen for a question, and what grounded it.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedPrompt {
    Grounded { prompt: String, documents: Vec<Document> },
    Fallback { prompt: String },
}

impl PreparedPrompt {
    pub fn prompt(&self) -> &str {
        match self {
            PreparedPrompt::Grounded { prompt, .. } | PreparedPrompt::Fallback { prompt } => prompt,
        }
    }

    pub fn is_grounded(&self) -> bool {
        matches!(self, PreparedPrompt::Grounded { .. })
    }

    pub fn into_prompt(self) -> String {
        match self {
            PreparedPrompt::Grounded { prompt, .. } | PreparedPrompt::Fallback { prompt } => prompt,
        }
    }
}

pub struct EventsAssistant {
    source: Arc<dyn EventSource>,
    resolver: QueryResolver,
    retriever: Retriever,
    prompts: PromptBuilder,
    generator: StreamingGenerator,
}

impl EventsAssistant {
    pub fn new(
        source: Arc<dyn EventSource>,
        resolver: QueryResolver,
        retriever: Retriever,
        prompts: PromptBuilder,
        generator: StreamingGenerator,
    ) -> Self {
        Self {
            source,
            resolver,
            retriever,
            prompts,
            generator,
        }
    }

    /// Choose between the grounded and the fallback prompt for `query`.
    ///
    /// The grounded prompt is only used when retrieval produced at least one
    /// document, so its context block is never empty.
    pub async fn prepare(&self, query: &str, candidates: &[EventRecord]) -> PreparedPrompt {
        if candidates.is_empty() {
            info!("No events found, answering without context");
            return PreparedPrompt::Fallback {
                prompt: self.prompts.build_fallback(query),
            };
        }

        let documents = self.retriever.retrieve(query, candidates).await;
        if documents.is_empty() {
            info!("Retrieval returned nothing, answering without context");
            return PreparedPrompt::Fallback {
                prompt: self.prompts.build_fallback(query),
            };
        }

        debug!("Grounding prompt with {} documents", documents.len());
        let context = self.prompts.join_context(&documents);
        PreparedPrompt::Grounded {
            prompt: self.prompts.build_grounded(&context, query),
            documents,
        }
    }

    /// Answer `request`, streaming the model's reply.
    pub async fn answer(&self, request: &ChatRequest) -> Result<FragmentStream, GenerationError> {
        self.answer_at(request, Utc::now()).await
    }

    /// [`EventsAssistant::answer`] with an explicit clock for the date window.
    pub async fn answer_at(
        &self,
        request: &ChatRequest,
        now: DateTime<Utc>,
    ) -> Result<FragmentStream, GenerationError> {
        let scope = self.resolver.resolve(&request.query, now);
        info!("Question scoped to {} ({})", scope.city, scope.window);

        let candidates = self.source.fetch_events(&scope.city, &scope.window).await;
        info!("Found {} candidate events", candidates.len());

        let prepared = self.prepare(&request.query, &candidates).await;
        self.generator.generate(prepared.into_prompt()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::record;
    use crate::generator::tests::{ScriptedBackend, delta};
    use crate::generator::{GenerationParams, RetryPolicy};
    use crate::query::DateWindow;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct StaticSource {
        events: Vec<EventRecord>,
        asked: Mutex<Vec<(String, DateWindow)>>,
    }

    impl StaticSource {
        fn new(events: Vec<EventRecord>) -> Arc<Self> {
            Arc::new(Self {
                events,
                asked: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl EventSource for StaticSource {
        async fn fetch_events(&self, location: &str, window: &DateWindow) -> Vec<EventRecord> {
            self.asked.lock().unwrap().push((location.to_string(), *window));
            self.events.clone()
        }
    }

    fn assistant(source: Arc<StaticSource>, backend: Arc<ScriptedBackend>) -> EventsAssistant {
        EventsAssistant::new(
            source,
            QueryResolver::default(),
            Retriever::unindexed(2),
            PromptBuilder::default(),
            StreamingGenerator::new(backend, RetryPolicy::default(), GenerationParams::default()),
        )
    }

    fn sent_prompt(backend: &ScriptedBackend) -> String {
        backend.requests.lock().unwrap()[0].messages[0].content.clone()
    }

    #[tokio::test]
    async fn test_no_candidates_uses_fallback_prompt() {
        let backend = ScriptedBackend::new(vec![Ok(vec![delta("Try a museum.")])]);
        let assistant = assistant(StaticSource::new(vec![]), backend.clone());

        let text = assistant
            .answer(&ChatRequest::new("Anything fun?"))
            .await
            .unwrap()
            .collect_text()
            .await
            .unwrap();

        assert_eq!(text, "Try a museum.");
        assert_eq!(
            sent_prompt(&backend),
            "You are a helpful events assistant. Answer this:\n\nAnything fun?"
        );
    }

    #[tokio::test]
    async fn test_candidates_ground_the_prompt() {
        let backend = ScriptedBackend::new(vec![Ok(vec![delta("ok")])]);
        let source = StaticSource::new(vec![record("A", ""), record("B", ""), record("C", "")]);
        let assistant = assistant(source.clone(), backend.clone());

        let now = Utc.with_ymd_and_hms(2024, 5, 29, 12, 0, 0).unwrap();
        let request = ChatRequest {
            query: "Gigs in Hamburg this weekend?".into(),
            history: vec![ChatTurn {
                role: "assistant".into(),
                content: "Earlier answer".into(),
            }],
        };
        assistant.answer_at(&request, now).await.unwrap();

        let asked = source.asked.lock().unwrap();
        assert_eq!(asked[0].0, "Hamburg");
        assert_eq!(asked[0].1.start_iso(), "2024-05-31T18:00:00Z");

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(
            requests[0].messages[0].content,
            "You are an event assistant. Use this info to answer:\n\n\
             A — 2024-06-01T20:00 @ Berlin\nhttp://events.test/A\n---\n\
             B — 2024-06-01T20:00 @ Berlin\nhttp://events.test/B\n\n\
             Question: Gigs in Hamburg this weekend?"
        );
    }

    #[tokio::test]
    async fn test_prepare_reports_documents() {
        let backend = ScriptedBackend::new(vec![]);
        let assistant = assistant(StaticSource::new(vec![]), backend);

        let prepared = assistant.prepare("q", &[record("Solo", "")]).await;
        assert!(prepared.is_grounded());
        match prepared {
            PreparedPrompt::Grounded { documents, .. } => {
                assert_eq!(documents, vec![Document::Event(record("Solo", ""))]);
            }
            PreparedPrompt::Fallback { .. } => unreachable!(),
        }

        let fallback = assistant.prepare("q", &[]).await;
        assert!(!fallback.is_grounded());
        assert!(fallback.prompt().ends_with("q"));
    }

    #[tokio::test]
    async fn test_generation_errors_propagate() {
        let backend = ScriptedBackend::new(vec![]);
        let assistant = assistant(StaticSource::new(vec![]), backend);
        assert!(matches!(
            assistant.answer(&ChatRequest::new("q")).await,
            Err(GenerationError::Upstream(_))
        ));
    }

    #[test]
    fn test_chat_request_history_defaults_to_empty() {
        let request: ChatRequest = serde_json::from_str(r#"{"query":"jazz?"}"#).unwrap();
        assert_eq!(request, ChatRequest::new("jazz?"));
    }

    #[tokio::test]
    async fn test_history_with_any_role_is_accepted_and_ignored() {
        let request: ChatRequest = serde_json::from_str(
            r#"{"query":"jazz?","history":[{"role":"bot","content":"hi"},{"role":"user","content":"x"}]}"#,
        )
        .unwrap();
        assert_eq!(request.history.len(), 2);
        assert_eq!(request.history[0].role, "bot");

        let backend = ScriptedBackend::new(vec![Ok(vec![delta("ok")])]);
        let assistant = assistant(StaticSource::new(vec![]), backend.clone());
        let now = Utc.with_ymd_and_hms(2024, 5, 29, 12, 0, 0).unwrap();
        let text = assistant.answer_at(&request, now).await.unwrap().collect_text().await.unwrap();
        assert_eq!(text, "ok");

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[0].messages.len(), 1);
        assert!(requests[0].messages[0].content.ends_with("jazz?"));
    }
}
