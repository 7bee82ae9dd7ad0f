//! Intent Classifier - decides whether a question needs retrieval

use crate::errors::Result;
use crate::llm::{ChatMessage, ChatModel, CompletionRequest};
use crate::prompts::{render, PromptSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Closed set of routing intents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    /// Scholarship, grant or subsidy question: retrieve and ground
    Scholarship,
    /// Greeting, small talk or anything else
    Other,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Scholarship => "scholarship",
            Intent::Other => "other",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "scholarship" => Some(Intent::Scholarship),
            "other" => Some(Intent::Other),
            _ => None,
        }
    }
}

/// Single-shot classifier driven by the prompt set's definition table
pub struct IntentClassifier {
    model: Arc<dyn ChatModel>,
}

impl IntentClassifier {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Anything that is not a defined label maps to [`Intent::Other`]
    #[instrument(skip_all)]
    pub async fn classify(&self, prompts: &PromptSet, question: &str) -> Result<Intent> {
        let options = prompts.intent_options();
        let prompt = render(
            &prompts.intent_prompt,
            &[("intent_options", options.as_str()), ("question", question)],
        );

        let completion = self
            .model
            .complete(CompletionRequest::new(vec![ChatMessage::user(prompt)], 0.0))
            .await?;

        let intent = parse_intent(&completion.text, prompts);
        debug!(raw = %completion.text.trim(), intent = intent.as_str(), "Intent classified");
        Ok(intent)
    }
}

fn parse_intent(raw: &str, prompts: &PromptSet) -> Intent {
    let label = raw
        .trim()
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace() || "「」“”。".contains(c))
        .to_lowercase();

    match Intent::from_label(&label) {
        Some(intent) if prompts.intent_definitions.contains_key(&label) => intent,
        _ => {
            if !label.is_empty() && label != Intent::Other.as_str() {
                warn!(label = %label, "Unrecognized intent label, treating as other");
            }
            Intent::Other
        }
    }
}
