//! Completion service abstraction
//!
//! Chat-style completion models consumed as a black box:
//! - whole-response calls returning text plus optional token usage
//! - streaming calls returning a lazy, finite sequence of text increments

mod openai;

pub use openai::OpenAIChatClient;

use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Role of a message sent to the completion service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One message of a completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Completion request
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Request usage accounting on the final stream chunk
    pub include_usage: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>, temperature: f32) -> Self {
        Self {
            messages,
            temperature,
            max_tokens: None,
            include_usage: false,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_stream_usage(mut self, include_usage: bool) -> Self {
        self.include_usage = include_usage;
        self
    }
}

/// Token accounting reported by the completion service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Whole-response completion
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// Item of a streaming completion
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Next text increment
    Delta(String),
    /// Usage accounting, delivered after the last increment when requested
    Usage(TokenUsage),
}

/// Lazy, finite, non-restartable sequence of completion increments
pub type CompletionStream = BoxStream<'static, Result<StreamChunk>>;

/// Trait for chat completion models
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Issue one completion call and return the full text
    async fn complete(&self, request: CompletionRequest) -> Result<Completion>;

    /// Issue a streaming completion call
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream>;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Echo model for local development without an API key
pub struct MockChatModel;

impl MockChatModel {
    fn reply(request: &CompletionRequest) -> String {
        let question = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        format!("[mock] {}", question.trim())
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        Ok(Completion {
            text: Self::reply(&request),
            usage: None,
        })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let reply = Self::reply(&request);
        let words: Vec<Result<StreamChunk>> = reply
            .split_inclusive(' ')
            .map(|w| Ok(StreamChunk::Delta(w.to_string())))
            .collect();
        Ok(stream::iter(words).boxed())
    }

    fn model_name(&self) -> &str {
        "mock-chat"
    }
}

/// Create a chat model based on configuration
pub fn create_chat_model(config: &LlmConfig) -> Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "openai" => {
            let key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
                message: "llm.api_key is required for the openai provider".to_string(),
            })?;
            Ok(Arc::new(OpenAIChatClient::new(key, config)?))
        }
        "mock" => Ok(Arc::new(MockChatModel)),
        other => {
            tracing::warn!(provider = other, "Unknown completion provider, using mock");
            Ok(Arc::new(MockChatModel))
        }
    }
}
