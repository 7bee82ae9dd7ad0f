//! Pipeline Orchestrator
//!
//! Per request: rephrase -> classify -> (retrieve -> synthesize -> parse
//! citations -> dedup) or small talk -> log. The audit record is written
//! exactly once on every exit path, including errors and panics, and the
//! original error is surfaced afterwards.

use super::citations::{dedup_for_display, parse_answer, select_cited, DelimiterScanner};
use super::{
    AnswerSynthesizer, ConversationTurn, FilterExtractor, Intent, IntentClassifier,
    MetadataSchema, Rephraser, RetrievedContext, Retriever,
};
use crate::config::{AppConfig, PipelineConfig};
use crate::db::{NewQaLog, QaLogStore};
use crate::embeddings::{create_embedder, Embedder};
use crate::errors::{AppError, Result};
use crate::index::{MilvusClient, VectorIndex};
use crate::llm::{
    create_chat_model, ChatMessage, ChatModel, Completion, CompletionRequest, StreamChunk,
    TokenUsage,
};
use crate::metrics;
use crate::prompts::{PromptCatalog, PromptSet};
use futures::stream::{self, BoxStream, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Events buffered between the pipeline task and a slow client
const EVENT_BUFFER: usize = 64;

/// One chat request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatQuery {
    pub question: String,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    /// Prompt language tag; the configured default when absent or unknown
    #[serde(default)]
    pub language: Option<String>,
}

/// Whole-response result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatAnswer {
    pub answer: String,
    /// Cited contexts, one per source
    pub contexts: Vec<RetrievedContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_id: Option<i32>,
}

/// Message carried by the terminal error event of a stream
pub const STREAM_ERROR_MESSAGE: &str = "An error occurred while generating the answer.";

/// Streaming result, in emission order
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Caller-visible answer increment (never contains the source list)
    Content(String),
    /// Terminal event on success
    Final {
        contexts: Vec<RetrievedContext>,
        log_id: Option<i32>,
    },
    /// Terminal event on failure; details are only logged server-side
    Failed,
}

/// External collaborators of the pipeline
#[derive(Clone)]
pub struct PipelineServices {
    pub chat_model: Arc<dyn ChatModel>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub log_store: Arc<dyn QaLogStore>,
}

impl PipelineServices {
    /// Build the configured clients around an existing log store
    pub fn from_config(config: &AppConfig, log_store: Arc<dyn QaLogStore>) -> Result<Self> {
        Ok(Self {
            chat_model: create_chat_model(&config.llm)?,
            embedder: create_embedder(&config.embedding, config.embedding_api_key())?,
            index: Arc::new(MilvusClient::new(config.vector_index.clone())?),
            log_store,
        })
    }
}

/// What the audit record needs, filled in as the request progresses
struct RequestTrace {
    started: Instant,
    question: String,
    rephrased: String,
    intent: Option<Intent>,
    answer: String,
    contexts: Vec<RetrievedContext>,
    usage: Option<TokenUsage>,
}

impl RequestTrace {
    fn start(question: &str) -> Self {
        Self {
            started: Instant::now(),
            question: question.to_string(),
            rephrased: question.to_string(),
            intent: None,
            answer: String::new(),
            contexts: Vec::new(),
            usage: None,
        }
    }
}

/// Forwards events until the receiver goes away, then silently drops them
struct EventSink {
    tx: mpsc::Sender<PipelineEvent>,
    connected: bool,
}

impl EventSink {
    async fn emit(&mut self, event: PipelineEvent) {
        if self.connected && self.tx.send(event).await.is_err() {
            self.connected = false;
            debug!("Client disconnected, finishing without emitting");
        }
    }
}

/// The answer pipeline, shared across concurrent requests
pub struct ChatPipeline {
    prompts: PromptCatalog,
    rephraser: Rephraser,
    classifier: IntentClassifier,
    retriever: Retriever,
    synthesizer: AnswerSynthesizer,
    chat_model: Arc<dyn ChatModel>,
    log_store: Arc<dyn QaLogStore>,
    smalltalk_temperature: f32,
    stream_usage: bool,
}

impl ChatPipeline {
    pub fn new(config: &PipelineConfig, prompts: PromptCatalog, services: PipelineServices) -> Self {
        let model = services.chat_model;

        let filter = config.metadata_filtering.then(|| {
            let schema = MetadataSchema::load(config.metadata_schema_path.as_deref());
            FilterExtractor::new(model.clone(), schema)
        });

        info!(
            top_k = config.top_k,
            history_window = config.history_window,
            metadata_filtering = config.metadata_filtering,
            default_language = prompts.default_language(),
            model = model.model_name(),
            "Chat pipeline ready"
        );

        Self {
            rephraser: Rephraser::new(model.clone(), config.history_window, config.rephrase_max_tokens),
            classifier: IntentClassifier::new(model.clone()),
            retriever: Retriever::new(services.embedder, services.index, filter, config.top_k),
            synthesizer: AnswerSynthesizer::new(model.clone(), config.stream_usage),
            chat_model: model,
            log_store: services.log_store,
            smalltalk_temperature: config.smalltalk_temperature,
            stream_usage: config.stream_usage,
            prompts,
        }
    }

    /// Build prompts and clients from the application configuration
    pub fn from_config(config: &AppConfig, log_store: Arc<dyn QaLogStore>) -> Result<Self> {
        let prompts = PromptCatalog::load(&config.pipeline)?;
        let services = PipelineServices::from_config(config, log_store)?;
        Ok(Self::new(&config.pipeline, prompts, services))
    }

    /// Answer as one response.
    ///
    /// The pipeline runs in its own task, so the log is written even when the
    /// caller drops this future. A panic inside the pipeline resurfaces here
    /// after the log write.
    pub async fn answer(self: Arc<Self>, query: ChatQuery) -> Result<ChatAnswer> {
        let span = info_span!("chat", question = %query.question);
        let task = tokio::spawn(async move { self.answer_task(query).await }.instrument(span));

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
            Err(e) => Err(AppError::Internal {
                message: format!("chat task cancelled: {}", e),
            }),
        }
    }

    async fn answer_task(&self, query: ChatQuery) -> Result<ChatAnswer> {
        let prompts = self.prompts.for_language(query.language.as_deref());
        let mut trace = RequestTrace::start(&query.question);

        let outcome = AssertUnwindSafe(self.run(&prompts, &query, &mut trace))
            .catch_unwind()
            .await;

        let log_id = self
            .finalize(&trace, "json", matches!(outcome, Ok(Ok(_))))
            .await;

        match outcome {
            Ok(Ok(answer)) => Ok(ChatAnswer { log_id, ..answer }),
            Ok(Err(e)) => {
                error!(error = %e, "Chat request failed");
                Err(e)
            }
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Answer as a stream of [`PipelineEvent`]s.
    ///
    /// The pipeline runs in its own task. Dropping the returned stream stops
    /// emission, but the task still drains the completion and writes the log.
    pub fn answer_stream(self: Arc<Self>, query: ChatQuery) -> BoxStream<'static, PipelineEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let span = info_span!("chat_stream", question = %query.question);

        tokio::spawn(
            async move {
                self.stream_task(query, EventSink { tx, connected: true })
                    .await
            }
            .instrument(span),
        );

        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed()
    }

    async fn stream_task(&self, query: ChatQuery, mut sink: EventSink) {
        let prompts = self.prompts.for_language(query.language.as_deref());
        let mut trace = RequestTrace::start(&query.question);

        let outcome = AssertUnwindSafe(self.run_streaming(&prompts, &query, &mut trace, &mut sink))
            .catch_unwind()
            .await;

        let log_id = self
            .finalize(&trace, "stream", matches!(outcome, Ok(Ok(_))))
            .await;

        match outcome {
            Ok(Ok(contexts)) => sink.emit(PipelineEvent::Final { contexts, log_id }).await,
            Ok(Err(e)) => {
                error!(error = %e, "Streaming chat request failed");
                sink.emit(PipelineEvent::Failed).await;
            }
            Err(payload) => {
                sink.emit(PipelineEvent::Failed).await;
                panic::resume_unwind(payload);
            }
        }
    }

    /// Rephrase and classify; shared by both modes
    async fn route(
        &self,
        prompts: &PromptSet,
        query: &ChatQuery,
        trace: &mut RequestTrace,
    ) -> Result<(String, Intent)> {
        let question = self
            .rephraser
            .rephrase(prompts, &query.history, &query.question)
            .await
            .into_inner();
        trace.rephrased = question.clone();

        let intent = self.classifier.classify(prompts, &question).await?;
        trace.intent = Some(intent);
        info!(rephrased = %question, intent = intent.as_str(), "Request routed");

        Ok((question, intent))
    }

    async fn run(
        &self,
        prompts: &PromptSet,
        query: &ChatQuery,
        trace: &mut RequestTrace,
    ) -> Result<ChatAnswer> {
        let (question, intent) = self.route(prompts, query, trace).await?;

        if intent == Intent::Other {
            let completion = self.small_talk(prompts, &question).await?;
            trace.usage = completion.usage;
            trace.answer = completion.text.trim().to_string();
            return Ok(ChatAnswer {
                answer: trace.answer.clone(),
                contexts: Vec::new(),
                log_id: None,
            });
        }

        let contexts = self.retriever.retrieve(prompts, &question).await?;
        if contexts.is_empty() {
            trace.answer = prompts.no_result_answer.clone();
            return Ok(ChatAnswer {
                answer: trace.answer.clone(),
                contexts: Vec::new(),
                log_id: None,
            });
        }

        let completion = self.synthesizer.synthesize(prompts, &question, &contexts).await?;
        trace.usage = completion.usage;

        let parsed = parse_answer(&completion.text);
        trace.answer = parsed.answer.clone();
        trace.contexts = select_cited(&contexts, &parsed.cited_sources);

        Ok(ChatAnswer {
            answer: parsed.answer,
            contexts: dedup_for_display(&trace.contexts),
            log_id: None,
        })
    }

    /// Returns the caller-facing contexts for the terminal event
    async fn run_streaming(
        &self,
        prompts: &PromptSet,
        query: &ChatQuery,
        trace: &mut RequestTrace,
        sink: &mut EventSink,
    ) -> Result<Vec<RetrievedContext>> {
        let (question, intent) = self.route(prompts, query, trace).await?;

        if intent == Intent::Other {
            let request = self
                .small_talk_request(prompts, &question)
                .with_stream_usage(self.stream_usage);
            let mut stream = self.chat_model.stream(request).await?;

            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(StreamChunk::Delta(text)) => {
                        trace.answer.push_str(&text);
                        sink.emit(PipelineEvent::Content(text)).await;
                    }
                    Ok(StreamChunk::Usage(usage)) => trace.usage = Some(usage),
                    Err(e) => return Err(e),
                }
            }
            trace.answer = trace.answer.trim().to_string();
            return Ok(Vec::new());
        }

        let contexts = self.retriever.retrieve(prompts, &question).await?;
        if contexts.is_empty() {
            trace.answer = prompts.no_result_answer.clone();
            sink.emit(PipelineEvent::Content(trace.answer.clone())).await;
            return Ok(Vec::new());
        }

        let mut stream = self
            .synthesizer
            .synthesize_stream(prompts, &question, &contexts)
            .await?;
        let mut scanner = DelimiterScanner::new();

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(StreamChunk::Delta(text)) => {
                    if let Some(visible) = scanner.push(&text) {
                        sink.emit(PipelineEvent::Content(visible)).await;
                    }
                }
                Ok(StreamChunk::Usage(usage)) => trace.usage = Some(usage),
                Err(e) => {
                    // Keep what was generated so far for the audit record
                    trace.answer = parse_answer(scanner.full_text()).answer;
                    return Err(e);
                }
            }
        }
        if let Some(rest) = scanner.finish() {
            sink.emit(PipelineEvent::Content(rest)).await;
        }

        let parsed = parse_answer(scanner.full_text());
        trace.answer = parsed.answer;
        trace.contexts = select_cited(&contexts, &parsed.cited_sources);

        Ok(dedup_for_display(&trace.contexts))
    }

    fn small_talk_request(&self, prompts: &PromptSet, question: &str) -> CompletionRequest {
        CompletionRequest::new(
            vec![
                ChatMessage::system(prompts.small_talk_system.as_str()),
                ChatMessage::user(question),
            ],
            self.smalltalk_temperature,
        )
    }

    async fn small_talk(&self, prompts: &PromptSet, question: &str) -> Result<Completion> {
        self.chat_model
            .complete(self.small_talk_request(prompts, question))
            .await
    }

    /// Record metrics and write the audit record; a failed write only loses the id
    async fn finalize(&self, trace: &RequestTrace, mode: &str, success: bool) -> Option<i32> {
        let elapsed = trace.started.elapsed();
        let latency_ms = elapsed.as_secs_f64() * 1000.0;
        let intent = trace.intent.map_or("unrouted", |i| i.as_str());

        metrics::record_chat(elapsed.as_secs_f64(), mode, intent, success);
        if let Some(usage) = trace.usage {
            metrics::record_tokens(usage.prompt_tokens, usage.completion_tokens);
        }

        let contexts = serde_json::to_value(&trace.contexts).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to serialize contexts for the audit record");
            serde_json::Value::Array(Vec::new())
        });

        let record = NewQaLog {
            question: trace.question.clone(),
            rephrased_question: trace.rephrased.clone(),
            answer: trace.answer.clone(),
            contexts,
            latency_ms,
            usage: trace.usage,
        };

        match self.log_store.insert(record).await {
            Ok(id) => {
                metrics::record_log_write(true);
                info!(log_id = id, latency_ms, intent, success, "QA record stored");
                Some(id)
            }
            Err(e) => {
                metrics::record_log_write(false);
                error!(error = %e, latency_ms, "Failed to store QA record");
                None
            }
        }
    }
}

impl std::fmt::Debug for ChatPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatPipeline")
            .field("model", &self.chat_model.model_name())
            .field("default_language", &self.prompts.default_language())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{
        hit, FakeEmbedder, FakeIndex, MemoryLogStore, Reply, ScriptedChatModel, USAGE,
    };
    use crate::context::ContextId;
    use crate::index::SearchHit;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        model: Arc<ScriptedChatModel>,
        index: Arc<FakeIndex>,
        logs: Arc<MemoryLogStore>,
        pipeline: Arc<ChatPipeline>,
    }

    fn harness(replies: Vec<Reply>, index: FakeIndex, logs: MemoryLogStore) -> Harness {
        let config = PipelineConfig {
            metadata_filtering: false,
            ..PipelineConfig::default()
        };
        harness_with(config, replies, index, logs)
    }

    fn harness_with(
        config: PipelineConfig,
        replies: Vec<Reply>,
        index: FakeIndex,
        logs: MemoryLogStore,
    ) -> Harness {
        let model = Arc::new(ScriptedChatModel::new(replies));
        let index = Arc::new(index);
        let logs = Arc::new(logs);
        let services = PipelineServices {
            chat_model: model.clone(),
            embedder: Arc::new(FakeEmbedder { fail: false }),
            index: index.clone(),
            log_store: logs.clone(),
        };
        let prompts = PromptCatalog::builtin(&config.default_language).unwrap();
        Harness {
            model,
            index,
            logs,
            pipeline: Arc::new(ChatPipeline::new(&config, prompts, services)),
        }
    }

    fn scholarship_hits() -> Vec<SearchHit> {
        vec![
            hit(1, "清寒助學金.md", Some("https://example.edu/a"), "第一段"),
            hit(2, "工讀金.md", None, "工讀"),
            hit(3, "清寒助學金.md", Some("https://example.edu/a"), "第二段"),
        ]
    }

    fn query(question: &str) -> ChatQuery {
        ChatQuery {
            question: question.to_string(),
            ..Default::default()
        }
    }

    async fn collect(stream: BoxStream<'static, PipelineEvent>) -> Vec<PipelineEvent> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_scholarship_answer_with_citations() {
        let h = harness(
            vec![
                Reply::text("scholarship"),
                Reply::text("**清寒助學金** 說明|||SOURCES|||清寒助學金"),
            ],
            FakeIndex::with_hits(scholarship_hits()),
            MemoryLogStore::default(),
        );

        let answer = assert_ok!(h.pipeline.clone().answer(query("清寒助學金怎麼申請？")).await);
        assert_eq!(answer.answer, "**清寒助學金** 說明");
        assert_eq!(answer.log_id, Some(1));
        assert_eq!(answer.contexts.len(), 1);
        assert_eq!(answer.contexts[0].source_file, "清寒助學金");

        let records = h.logs.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.question, "清寒助學金怎麼申請？");
        assert_eq!(record.answer, "**清寒助學金** 說明");
        assert_eq!(record.usage, Some(USAGE));
        // Log keeps both cited chunks, the response only one per source
        assert_eq!(record.contexts.as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn test_empty_retrieval_short_circuits() {
        let h = harness(
            vec![Reply::text("scholarship")],
            FakeIndex::with_hits(vec![]),
            MemoryLogStore::default(),
        );

        let answer = assert_ok!(h.pipeline.clone().answer(query("博士班有交換獎學金嗎")).await);
        assert_eq!(answer.answer, "抱歉，我沒有找到相關的補助或獎學金資訊。");
        assert!(answer.contexts.is_empty());
        // Intent only, no synthesis call
        assert_eq!(h.model.call_count(), 1);
        assert_eq!(h.logs.records().len(), 1);
    }

    #[tokio::test]
    async fn test_english_no_result_answer() {
        let h = harness(
            vec![Reply::text("scholarship")],
            FakeIndex::with_hits(vec![]),
            MemoryLogStore::default(),
        );
        let answer = h
            .pipeline
            .clone()
            .answer(ChatQuery {
                language: Some("en".into()),
                ..query("Any grants for PhD students?")
            })
            .await
            .unwrap();
        assert!(answer.answer.starts_with("I'm sorry"));
    }

    #[tokio::test]
    async fn test_small_talk_skips_retrieval() {
        let h = harness(
            vec![Reply::text("other"), Reply::text(" 你好！有什麼獎學金問題嗎？ ")],
            FakeIndex::with_hits(scholarship_hits()),
            MemoryLogStore::default(),
        );

        let answer = assert_ok!(h.pipeline.clone().answer(query("你好")).await);
        assert_eq!(answer.answer, "你好！有什麼獎學金問題嗎？");
        assert!(answer.contexts.is_empty());
        assert_eq!(h.index.search_count(), 0);

        let requests = h.model.requests();
        assert_eq!(requests[1].temperature, 0.7);
        assert_eq!(h.logs.records().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_logged_then_propagated() {
        let h = harness(
            vec![Reply::text("scholarship")],
            FakeIndex::failing(),
            MemoryLogStore::default(),
        );

        assert_err!(h.pipeline.clone().answer(query("清寒獎學金")).await);
        let records = h.logs.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].answer, "");
    }

    #[tokio::test]
    async fn test_dropped_caller_still_writes_log() {
        let h = harness(
            vec![
                Reply::Delayed(Duration::from_millis(100), "other".into()),
                Reply::text("hi"),
            ],
            FakeIndex::default(),
            MemoryLogStore::default(),
        );

        let early = tokio::time::timeout(
            Duration::from_millis(10),
            h.pipeline.clone().answer(query("hello")),
        )
        .await;
        assert!(early.is_err());

        for _ in 0..100 {
            if !h.logs.records().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let records = h.logs.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].answer, "hi");
    }

    #[tokio::test]
    async fn test_panic_is_logged_then_resumed() {
        let h = harness(
            vec![Reply::text("scholarship")],
            FakeIndex::panicking(),
            MemoryLogStore::default(),
        );

        let outcome = AssertUnwindSafe(h.pipeline.clone().answer(query("清寒獎學金")))
            .catch_unwind()
            .await;
        assert!(outcome.is_err());

        let records = h.logs.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].question, "清寒獎學金");
        assert_eq!(records[0].answer, "");
    }

    #[tokio::test]
    async fn test_stream_panic_emits_error_after_logging() {
        let h = harness(
            vec![Reply::text("scholarship")],
            FakeIndex::panicking(),
            MemoryLogStore::default(),
        );

        let events = collect(h.pipeline.clone().answer_stream(query("清寒獎學金"))).await;
        assert_eq!(events, vec![PipelineEvent::Failed]);
        assert_eq!(h.logs.records().len(), 1);
    }

    #[tokio::test]
    async fn test_log_write_failure_is_swallowed() {
        let h = harness(
            vec![Reply::text("other"), Reply::text("hi")],
            FakeIndex::default(),
            MemoryLogStore::failing(),
        );

        let answer = assert_ok!(h.pipeline.clone().answer(query("hello")).await);
        assert_eq!(answer.answer, "hi");
        assert_eq!(answer.log_id, None);
    }

    #[tokio::test]
    async fn test_history_is_rephrased_before_routing() {
        let h = harness(
            vec![
                Reply::text("申請 B 清寒獎學金需要什麼資格？"),
                Reply::text("scholarship"),
            ],
            FakeIndex::with_hits(vec![]),
            MemoryLogStore::default(),
        );

        let answer = h
            .pipeline
            .clone()
            .answer(ChatQuery {
                history: vec![
                    ConversationTurn::user("我想找清寒獎學金"),
                    ConversationTurn::assistant("有 A 和 B。"),
                ],
                ..query("它需要什麼資格?")
            })
            .await;
        assert_ok!(answer);

        let record = &h.logs.records()[0];
        assert_eq!(record.question, "它需要什麼資格?");
        assert_eq!(record.rephrased_question, "申請 B 清寒獎學金需要什麼資格？");
        assert!(h.model.requests()[1].messages[0]
            .content
            .contains("申請 B 清寒獎學金需要什麼資格？"));
    }

    #[tokio::test]
    async fn test_metadata_filter_reaches_the_index() {
        let h = harness_with(
            PipelineConfig::default(),
            vec![
                Reply::text("scholarship"),
                Reply::text(r#"{"status": ["低收入戶"], "edu_system": ["大學部"]}"#),
            ],
            FakeIndex::with_hits(vec![]),
            MemoryLogStore::default(),
        );

        assert_ok!(h.pipeline.clone().answer(query("有哪些補助適合低收入戶的大學生？")).await);
        assert_eq!(
            h.index.filters(),
            vec![Some(
                r#"ARRAY_CONTAINS_ANY(edu_system, ["大學部"]) and ARRAY_CONTAINS_ANY(status, ["低收入戶"])"#
                    .to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_stream_hides_delimiter_and_source_list() {
        let h = harness(
            vec![
                Reply::text("scholarship"),
                Reply::chunks(&["foo|||SOUR", "CES|||工讀金"]),
            ],
            FakeIndex::with_hits(scholarship_hits()),
            MemoryLogStore::default(),
        );

        let events = collect(h.pipeline.clone().answer_stream(query("工讀"))).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], PipelineEvent::Content("foo".into()));
        match &events[1] {
            PipelineEvent::Final { contexts, log_id } => {
                assert_eq!(*log_id, Some(1));
                assert_eq!(contexts.len(), 1);
                assert_eq!(contexts[0].id, ContextId::Int(2));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let record = &h.logs.records()[0];
        assert_eq!(record.answer, "foo");
        // Usage arrives on the final chunk
        assert_eq!(record.usage, Some(USAGE));
    }

    #[tokio::test]
    async fn test_stream_empty_retrieval() {
        let h = harness(
            vec![Reply::text("scholarship")],
            FakeIndex::with_hits(vec![]),
            MemoryLogStore::default(),
        );

        let events = collect(h.pipeline.clone().answer_stream(query("q"))).await;
        assert_eq!(
            events,
            vec![
                PipelineEvent::Content("抱歉，我沒有找到相關的補助或獎學金資訊。".into()),
                PipelineEvent::Final {
                    contexts: vec![],
                    log_id: Some(1)
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_small_talk() {
        let h = harness(
            vec![Reply::text("other"), Reply::chunks(&["哈囉", "！"])],
            FakeIndex::default(),
            MemoryLogStore::default(),
        );

        let events = collect(h.pipeline.clone().answer_stream(query("嗨"))).await;
        assert_eq!(events.len(), 3);
        assert_eq!(h.logs.records()[0].answer, "哈囉！");
    }

    #[tokio::test]
    async fn test_stream_failure_emits_error_after_logging() {
        let h = harness(
            vec![
                Reply::text("scholarship"),
                Reply::Broken(vec!["partial answer text that is long enough".into()]),
            ],
            FakeIndex::with_hits(scholarship_hits()),
            MemoryLogStore::default(),
        );

        let events = collect(h.pipeline.clone().answer_stream(query("q"))).await;
        assert_eq!(events.last(), Some(&PipelineEvent::Failed));
        assert!(!events.contains(&PipelineEvent::Final {
            contexts: vec![],
            log_id: Some(1)
        }));

        let records = h.logs.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].answer, "partial answer text that is long enough");
    }

    #[tokio::test]
    async fn test_disconnect_still_writes_log() {
        let h = harness(
            vec![
                Reply::text("scholarship"),
                Reply::chunks(&["a long enough first increment", " more", "|||SOURCES|||工讀金"]),
            ],
            FakeIndex::with_hits(scholarship_hits()),
            MemoryLogStore::default(),
        );

        let mut stream = h.pipeline.clone().answer_stream(query("q"));
        let first = stream.next().await;
        assert!(matches!(first, Some(PipelineEvent::Content(_))));
        drop(stream);

        for _ in 0..50 {
            if !h.logs.records().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let records = h.logs.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].answer, "a long enough first increment more");
    }
}
