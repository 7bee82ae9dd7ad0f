//! OpenAI-compatible `/chat/completions` client

use super::{ChatMessage, ChatModel, Completion, CompletionRequest, CompletionStream, StreamChunk, TokenUsage};
use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Chat completion client
pub struct OpenAIChatClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

impl OpenAIChatClient {
    /// Create a new chat client
    pub fn new(api_key: String, config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
        })
    }

    async fn send(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::CompletionError {
                message: format!("LLM API request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::CompletionError {
                message: format!("LLM API error {}: {}", status, body),
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAIChatClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let body = ChatRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
            stream_options: None,
        };

        let response: ChatResponse = self
            .send(&body)
            .await?
            .json()
            .await
            .map_err(|e| AppError::CompletionError {
                message: format!("Failed to parse LLM response: {}", e),
            })?;

        let text = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| AppError::CompletionError {
                message: "Empty response from LLM".to_string(),
            })?;

        Ok(Completion {
            text,
            usage: response.usage,
        })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let body = ChatRequest {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: true,
            stream_options: request
                .include_usage
                .then_some(StreamOptions { include_usage: true }),
        };

        let bytes = self
            .send(&body)
            .await?
            .bytes_stream()
            .map(|r| r.map(|b| b.to_vec()))
            .boxed();

        Ok(decode_event_stream(bytes))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Splits a server-sent-event byte stream into `data:` payloads.
///
/// Bytes are buffered until a full line is available so multi-byte
/// characters split across network reads are reassembled intact.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

fn parse_chunk(payload: &str) -> Result<Vec<StreamChunk>> {
    let chunk: ChatChunk = serde_json::from_str(payload).map_err(|e| AppError::CompletionError {
        message: format!("Malformed stream chunk: {}", e),
    })?;

    let mut items: Vec<StreamChunk> = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .filter(|t| !t.is_empty())
        .map(StreamChunk::Delta)
        .collect();

    if let Some(usage) = chunk.usage {
        items.push(StreamChunk::Usage(usage));
    }
    Ok(items)
}

struct DecodeState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    pending: VecDeque<Result<StreamChunk>>,
    finished: bool,
}

pub(crate) fn decode_event_stream(
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
) -> CompletionStream {
    let state = DecodeState {
        bytes,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    for payload in state.decoder.push(&bytes) {
                        if payload == "[DONE]" {
                            state.finished = true;
                            break;
                        }
                        match parse_chunk(&payload) {
                            Ok(chunks) => state.pending.extend(chunks.into_iter().map(Ok)),
                            Err(e) => {
                                state.pending.push_back(Err(e));
                                state.finished = true;
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    state.pending.push_back(Err(AppError::CompletionError {
                        message: format!("Stream interrupted: {}", e),
                    }));
                    state.finished = true;
                }
                None => state.finished = true,
            }
        }
    })
    .boxed()
}
