//! Scripted fakes for the pipeline's external collaborators

use super::{ContextId, RetrievedContext};
use crate::db::{Feedback, NewQaLog, QaLogStore};
use crate::embeddings::Embedder;
use crate::errors::{AppError, Result};
use crate::index::{FilterExpression, SearchHit, VectorIndex};
use crate::llm::{ChatModel, Completion, CompletionRequest, CompletionStream, StreamChunk, TokenUsage};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

pub const USAGE: TokenUsage = TokenUsage {
    prompt_tokens: 100,
    completion_tokens: 20,
    total_tokens: 120,
};

/// Next answer of the scripted model
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Chunks(Vec<String>),
    /// Streams the chunks, then fails
    Broken(Vec<String>),
    /// Whole text after a pause
    Delayed(Duration, String),
    Fail,
}

impl Reply {
    pub fn text(text: &str) -> Self {
        Reply::Text(text.to_string())
    }

    pub fn chunks(chunks: &[&str]) -> Self {
        Reply::Chunks(chunks.iter().map(|c| c.to_string()).collect())
    }
}

/// Model that answers calls in order from a script and records requests
#[derive(Default)]
pub struct ScriptedChatModel {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedChatModel {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next(&self, request: CompletionRequest) -> Reply {
        self.requests.lock().unwrap().push(request);
        self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Fail)
    }
}

fn scripted_failure() -> AppError {
    AppError::CompletionError {
        message: "scripted failure".to_string(),
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        match self.next(request) {
            Reply::Text(text) => Ok(Completion {
                text,
                usage: Some(USAGE),
            }),
            Reply::Chunks(chunks) => Ok(Completion {
                text: chunks.concat(),
                usage: Some(USAGE),
            }),
            Reply::Delayed(pause, text) => {
                tokio::time::sleep(pause).await;
                Ok(Completion {
                    text,
                    usage: Some(USAGE),
                })
            }
            Reply::Broken(_) | Reply::Fail => Err(scripted_failure()),
        }
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let include_usage = request.include_usage;
        let (chunks, broken) = match self.next(request) {
            Reply::Text(text) | Reply::Delayed(_, text) => (vec![text], false),
            Reply::Chunks(chunks) => (chunks, false),
            Reply::Broken(chunks) => (chunks, true),
            Reply::Fail => return Err(scripted_failure()),
        };

        let mut items: Vec<Result<StreamChunk>> =
            chunks.into_iter().map(|c| Ok(StreamChunk::Delta(c))).collect();
        if broken {
            items.push(Err(scripted_failure()));
        } else if include_usage {
            items.push(Ok(StreamChunk::Usage(USAGE)));
        }
        Ok(stream::iter(items).boxed())
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Fixed-vector embedder
pub struct FakeEmbedder {
    pub fail: bool,
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        if self.fail {
            return Err(AppError::EmbeddingError {
                message: "scripted failure".to_string(),
            });
        }
        Ok(vec![0.1, 0.2, 0.3, 0.4])
    }

    fn model_name(&self) -> &str {
        "fake-embedding"
    }

    fn dimension(&self) -> usize {
        4
    }
}

/// Index returning canned hits and recording the filters it was given
#[derive(Default)]
pub struct FakeIndex {
    hits: Vec<SearchHit>,
    fail: bool,
    panic: bool,
    filters: Mutex<Vec<Option<String>>>,
}

impl FakeIndex {
    pub fn with_hits(hits: Vec<SearchHit>) -> Self {
        Self {
            hits,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn panicking() -> Self {
        Self {
            panic: true,
            ..Default::default()
        }
    }

    pub fn filters(&self) -> Vec<Option<String>> {
        self.filters.lock().unwrap().clone()
    }

    pub fn search_count(&self) -> usize {
        self.filters.lock().unwrap().len()
    }
}

#[async_trait]
impl VectorIndex for FakeIndex {
    async fn search(
        &self,
        _vector: &[f32],
        limit: usize,
        filter: Option<&FilterExpression>,
    ) -> Result<Vec<SearchHit>> {
        self.filters
            .lock()
            .unwrap()
            .push(filter.map(|f| f.as_str().to_string()));
        if self.panic {
            panic!("index client bug");
        }
        if self.fail {
            return Err(AppError::VectorIndexError {
                message: "scripted failure".to_string(),
            });
        }
        Ok(self.hits.iter().take(limit).cloned().collect())
    }
}

/// Raw index hit shaped like the REST response
pub fn hit(id: i64, source_file: &str, source_url: Option<&str>, text: &str) -> SearchHit {
    let mut entity = Map::new();
    entity.insert("id".into(), json!(id));
    entity.insert("text".into(), json!(text));
    entity.insert("source_file".into(), json!(source_file));
    entity.insert(
        "source_url".into(),
        source_url.map_or(Value::Null, |u| json!(u)),
    );
    entity.insert("status".into(), json!(["低收入戶"]));
    entity.insert("subsidy_type".into(), json!(["助學金"]));
    entity.insert("edu_system".into(), json!(["大學部"]));
    SearchHit {
        id: json!(id),
        distance: 0.8,
        entity,
    }
}

/// Already-normalized context
pub fn context(id: i64, source_file: &str, source_url: Option<&str>) -> RetrievedContext {
    RetrievedContext {
        id: ContextId::Int(id),
        text: format!("chunk {}", id),
        source_file: source_file.to_string(),
        source_url: source_url.map(str::to_string),
        status: Vec::new(),
        subsidy_type: Vec::new(),
        edu_system: Vec::new(),
        distance: 0.8,
    }
}

/// In-memory audit log
#[derive(Default)]
pub struct MemoryLogStore {
    pub fail: bool,
    records: Mutex<Vec<NewQaLog>>,
}

impl MemoryLogStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn records(&self) -> Vec<NewQaLog> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl QaLogStore for MemoryLogStore {
    async fn insert(&self, record: NewQaLog) -> Result<i32> {
        if self.fail {
            return Err(AppError::DatabaseConnection {
                message: "scripted failure".to_string(),
            });
        }
        let mut records = self.records.lock().unwrap();
        records.push(record);
        Ok(records.len() as i32)
    }

    async fn record_feedback(&self, id: i32, _feedback: Feedback) -> Result<bool> {
        Ok(id >= 1 && (id as usize) <= self.records.lock().unwrap().len())
    }

    async fn ping(&self) -> Result<()> {
        if self.fail {
            return Err(AppError::DatabaseConnection {
                message: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}
