//! Retrieval-augmented answer pipeline
//!
//! question (+history) -> [`Rephraser`] -> [`IntentClassifier`] ->
//! either [`Retriever`] (with [`FilterExtractor`]) and [`AnswerSynthesizer`],
//! or a direct small-talk completion. [`ChatPipeline`] then parses
//! citations, de-duplicates contexts and writes one audit record per request.

mod citations;
mod filter;
mod intent;
mod pipeline;
mod rephraser;
mod retriever;
mod synthesizer;

#[cfg(test)]
pub(crate) mod testing;

pub use citations::{
    dedup_for_display, parse_answer, select_cited, DelimiterScanner, ParsedAnswer,
    SOURCES_DELIMITER,
};
pub use filter::{FilterExtractor, MetadataFilter, MetadataSchema};
pub use intent::{Intent, IntentClassifier};
pub use pipeline::{
    ChatAnswer, ChatPipeline, ChatQuery, PipelineEvent, PipelineServices, STREAM_ERROR_MESSAGE,
};
pub use rephraser::Rephraser;
pub use retriever::Retriever;
pub use synthesizer::AnswerSynthesizer;

use serde::{Deserialize, Serialize};

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

/// One prior message of the conversation, oldest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// Primary key of an indexed chunk (Milvus allows integer or string keys)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextId {
    Int(i64),
    Text(String),
}

/// A retrieved chunk with its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub id: ContextId,
    pub text: String,
    /// Source document name without its `.md` extension
    pub source_file: String,
    pub source_url: Option<String>,
    pub status: Vec<String>,
    pub subsidy_type: Vec<String>,
    pub edu_system: Vec<String>,
    /// Similarity score as reported by the index
    pub distance: f32,
}

/// Result of a best-effort step: either what was computed, or the safe
/// default the caller continues with after a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum BestEffort<T> {
    Computed(T),
    Degraded(T),
}

impl<T> BestEffort<T> {
    pub fn into_inner(self) -> T {
        match self {
            BestEffort::Computed(value) | BestEffort::Degraded(value) => value,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, BestEffort::Degraded(_))
    }
}
