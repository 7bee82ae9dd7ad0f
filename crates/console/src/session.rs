//! One interactive conversation

use futures::StreamExt;
use scholarbot_common::{
    context::{ConversationTurn, RetrievedContext, STREAM_ERROR_MESSAGE},
    ChatPipeline, ChatQuery, PipelineEvent,
};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Inputs that end the session
const EXIT_COMMANDS: &[&str] = &["exit", "quit", "bye"];

pub fn is_exit_command(line: &str) -> bool {
    let line = line.trim();
    EXIT_COMMANDS.iter().any(|cmd| line.eq_ignore_ascii_case(cmd))
}

/// Keeps the turns of the conversation and streams answers to `out`
pub struct Session {
    pipeline: Arc<ChatPipeline>,
    language: Option<String>,
    history: Vec<ConversationTurn>,
}

impl Session {
    pub fn new(pipeline: Arc<ChatPipeline>, language: Option<String>) -> Self {
        Self {
            pipeline,
            language,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    /// Stream one answer. Failed turns are not kept in the history.
    pub async fn ask<W>(&mut self, question: &str, out: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let query = ChatQuery {
            question: question.to_string(),
            history: self.history.clone(),
            language: self.language.clone(),
        };

        let mut events = self.pipeline.clone().answer_stream(query);
        let mut answer = String::new();
        let mut failed = false;

        out.write_all(b"AI: ").await?;
        while let Some(event) = events.next().await {
            match event {
                PipelineEvent::Content(text) => {
                    out.write_all(text.as_bytes()).await?;
                    out.flush().await?;
                    answer.push_str(&text);
                }
                PipelineEvent::Final { contexts, log_id } => {
                    out.write_all(b"\n").await?;
                    write_sources(out, &contexts).await?;
                    if let Some(id) = log_id {
                        tracing::debug!(log_id = id, "Answer logged");
                    }
                }
                PipelineEvent::Failed => {
                    failed = true;
                    out.write_all(format!("\n{}\n", STREAM_ERROR_MESSAGE).as_bytes())
                        .await?;
                }
            }
        }
        out.flush().await?;

        if !failed {
            self.history.push(ConversationTurn::user(question));
            self.history.push(ConversationTurn::assistant(answer.trim()));
        }
        Ok(())
    }
}

async fn write_sources<W>(out: &mut W, contexts: &[RetrievedContext]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if contexts.is_empty() {
        return Ok(());
    }

    let mut listing = String::from("Sources:\n");
    for ctx in contexts {
        match &ctx.source_url {
            Some(url) => listing.push_str(&format!("  - {} ({})\n", ctx.source_file, url)),
            None => listing.push_str(&format!("  - {}\n", ctx.source_file)),
        }
    }
    out.write_all(listing.as_bytes()).await
}
