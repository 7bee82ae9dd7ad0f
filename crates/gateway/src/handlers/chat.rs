//! Chat handlers

use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tracing::{info, warn};
use validator::Validate;

use crate::AppState;
use scholarbot_common::{
    context::{ConversationTurn, RetrievedContext, STREAM_ERROR_MESSAGE},
    errors::{AppError, Result},
    ChatQuery, PipelineEvent,
};

/// Chat request
#[derive(Debug, Deserialize, Validate)]
pub struct ChatRequest {
    #[validate(length(min = 1, max = 2000))]
    pub query: String,

    /// Earlier turns, oldest first
    #[serde(default)]
    pub history: Vec<ConversationTurn>,

    /// Prompt language (`zh`, `en`)
    #[serde(default)]
    pub lang: Option<String>,

    /// Server-sent events when true, one JSON body otherwise
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool { true }

impl ChatRequest {
    fn into_query(self) -> ChatQuery {
        ChatQuery {
            question: self.query,
            history: self.history,
            language: self.lang,
        }
    }
}

/// `data` payload of every stream event
#[derive(Serialize)]
struct StreamMessage<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: T,
}

#[derive(Serialize)]
struct FinalData<'a> {
    contexts: &'a [RetrievedContext],
    log_id: Option<i32>,
}

/// Answer a question, streamed or whole
pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response> {
    // Validate request
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("query".to_string()),
    })?;
    if request.query.trim().is_empty() {
        return Err(AppError::Validation {
            message: "query must not be blank".to_string(),
            field: Some("query".to_string()),
        });
    }

    info!(
        stream = request.stream,
        history_turns = request.history.len(),
        lang = ?request.lang,
        "Chat request"
    );

    let stream = request.stream;
    let query = request.into_query();

    if !stream {
        let answer = state.pipeline.clone().answer(query).await?;
        return Ok(Json(answer).into_response());
    }

    let events = state
        .pipeline
        .clone()
        .answer_stream(query)
        .map(|event| Ok::<_, Infallible>(to_sse(event)));

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Wire framing of a pipeline event
fn to_sse(event: PipelineEvent) -> Event {
    match event {
        PipelineEvent::Content(text) => frame(Event::default(), "content", text),
        PipelineEvent::Final { contexts, log_id } => frame(
            Event::default().event("end_stream"),
            "final_data",
            FinalData {
                contexts: &contexts,
                log_id,
            },
        ),
        PipelineEvent::Failed => error_event(),
    }
}

fn frame<T: Serialize>(event: Event, kind: &str, data: T) -> Event {
    match serde_json::to_string(&StreamMessage { kind, data }) {
        Ok(json) => event.data(json),
        Err(e) => {
            warn!(error = %e, kind, "Failed to encode stream event");
            error_event()
        }
    }
}

fn error_event() -> Event {
    Event::default().event("error").data(format!(
        r#"{{"type":"error","data":"{}"}}"#,
        STREAM_ERROR_MESSAGE
    ))
}
