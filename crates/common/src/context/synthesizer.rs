//! Answer Synthesizer - grounded answer generation from retrieved contexts
//!
//! The model is asked for `<answer>|||SOURCES|||<source names>`. Splitting
//! at the delimiter is left to the caller, since in streaming mode the
//! delimiter may arrive split across increments.

use super::RetrievedContext;
use crate::errors::Result;
use crate::llm::{ChatMessage, ChatModel, Completion, CompletionRequest, CompletionStream};
use crate::prompts::{render, ContextLabels, PromptSet};
use std::sync::Arc;
use tracing::instrument;

/// Generates the two-part answer, whole or streamed
pub struct AnswerSynthesizer {
    model: Arc<dyn ChatModel>,
    stream_usage: bool,
}

impl AnswerSynthesizer {
    /// `stream_usage` asks the provider for token usage on the final stream chunk
    pub fn new(model: Arc<dyn ChatModel>, stream_usage: bool) -> Self {
        Self {
            model,
            stream_usage,
        }
    }

    /// One completion call, full raw text
    #[instrument(skip_all, fields(contexts = contexts.len()))]
    pub async fn synthesize(
        &self,
        prompts: &PromptSet,
        question: &str,
        contexts: &[RetrievedContext],
    ) -> Result<Completion> {
        self.model
            .complete(build_request(prompts, question, contexts))
            .await
    }

    /// Streaming call; increments arrive unsplit
    #[instrument(skip_all, fields(contexts = contexts.len()))]
    pub async fn synthesize_stream(
        &self,
        prompts: &PromptSet,
        question: &str,
        contexts: &[RetrievedContext],
    ) -> Result<CompletionStream> {
        let request = build_request(prompts, question, contexts).with_stream_usage(self.stream_usage);
        self.model.stream(request).await
    }
}

fn build_request(
    prompts: &PromptSet,
    question: &str,
    contexts: &[RetrievedContext],
) -> CompletionRequest {
    let context = format_contexts(&prompts.context_labels, contexts);
    CompletionRequest::new(
        vec![
            ChatMessage::system(prompts.rag_system.as_str()),
            ChatMessage::user(render(
                &prompts.rag_user,
                &[("question", question), ("context", context.as_str())],
            )),
        ],
        0.0,
    )
}

/// Display title of a source: file name without `.md` / `.txt`
fn source_title(source_file: &str) -> String {
    source_file.replace(".md", "").replace(".txt", "")
}

/// One labeled block per source file, in first-seen order.
///
/// Chunks of the same source are joined with newlines; the URL is the first
/// non-empty one seen for that source.
pub(crate) fn format_contexts(labels: &ContextLabels, contexts: &[RetrievedContext]) -> String {
    struct Group<'a> {
        source_file: &'a str,
        url: Option<&'a str>,
        texts: Vec<&'a str>,
    }

    let mut groups: Vec<Group<'_>> = Vec::new();
    for ctx in contexts {
        let url = ctx.source_url.as_deref().filter(|u| !u.is_empty());
        match groups.iter_mut().find(|g| g.source_file == ctx.source_file) {
            Some(group) => {
                group.texts.push(&ctx.text);
                if group.url.is_none() {
                    group.url = url;
                }
            }
            None => groups.push(Group {
                source_file: &ctx.source_file,
                url,
                texts: vec![&ctx.text],
            }),
        }
    }

    let mut block = String::new();
    for group in groups {
        block.push_str(&format!(
            "\n---\n{}: {}\n",
            labels.source,
            source_title(group.source_file)
        ));
        if let Some(url) = group.url {
            block.push_str(&format!("{}: {}\n", labels.url, url));
        }
        block.push_str(&format!("{}: {}\n", labels.content, group.texts.join("\n")));
    }
    block
}
