//! Question Rephraser - folds conversation history into a standalone question

use super::{BestEffort, ConversationTurn};
use crate::llm::{ChatMessage, ChatModel, CompletionRequest};
use crate::prompts::{render, PromptSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Rewrites follow-up utterances using the most recent turns
pub struct Rephraser {
    model: Arc<dyn ChatModel>,
    history_window: usize,
    max_tokens: u32,
}

impl Rephraser {
    pub fn new(model: Arc<dyn ChatModel>, history_window: usize, max_tokens: u32) -> Self {
        Self {
            model,
            history_window,
            max_tokens,
        }
    }

    /// Never fails: a failed or empty rewrite degrades to the original utterance
    #[instrument(skip_all, fields(turns = history.len()))]
    pub async fn rephrase(
        &self,
        prompts: &PromptSet,
        history: &[ConversationTurn],
        question: &str,
    ) -> BestEffort<String> {
        if history.is_empty() {
            return BestEffort::Computed(question.to_string());
        }

        if prompts.is_passthrough(question) {
            debug!("Acknowledgement passed through without rewriting");
            return BestEffort::Computed(question.to_string());
        }

        let history_text = self.format_history(history);
        let request = CompletionRequest::new(
            vec![
                ChatMessage::system(prompts.rephrase_system.as_str()),
                ChatMessage::user(render(
                    &prompts.rephrase_user,
                    &[("history", history_text.as_str()), ("question", question)],
                )),
            ],
            0.0,
        )
        .with_max_tokens(self.max_tokens);

        match self.model.complete(request).await {
            Ok(completion) => {
                let rephrased = completion.text.trim();
                if rephrased.is_empty() {
                    warn!("Rephraser returned nothing, using original question");
                    BestEffort::Degraded(question.to_string())
                } else {
                    info!(rephrased, "Question rephrased");
                    BestEffort::Computed(rephrased.to_string())
                }
            }
            Err(e) => {
                warn!(error = %e, "Question rephrasing failed, using original question");
                BestEffort::Degraded(question.to_string())
            }
        }
    }

    /// `role: content` lines for the last `history_window` turns
    fn format_history(&self, history: &[ConversationTurn]) -> String {
        let start = history.len().saturating_sub(self.history_window);
        history[start..]
            .iter()
            .map(|turn| format!("{}: {}", turn.role.as_str(), turn.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{Reply, ScriptedChatModel};
    use crate::prompts::PromptCatalog;

    fn setup(replies: Vec<Reply>) -> (Arc<ScriptedChatModel>, Rephraser, Arc<PromptSet>) {
        let model = Arc::new(ScriptedChatModel::new(replies));
        let rephraser = Rephraser::new(model.clone(), 8, 150);
        let prompts = PromptCatalog::builtin("zh").unwrap().for_language(None);
        (model, rephraser, prompts)
    }

    fn history() -> Vec<ConversationTurn> {
        vec![
            ConversationTurn::user("我想找清寒獎學金"),
            ConversationTurn::assistant("我們有幾種清寒獎學金，例如 A 和 B。"),
        ]
    }

    #[tokio::test]
    async fn test_empty_history_is_identity_without_model_call() {
        let (model, rephraser, prompts) = setup(vec![]);
        let result = rephraser.rephrase(&prompts, &[], "它需要什麼資格?").await;
        assert_eq!(result, BestEffort::Computed("它需要什麼資格?".to_string()));
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_acknowledgement_passes_through() {
        let (model, rephraser, prompts) = setup(vec![]);
        for utterance in ["謝謝", "謝謝！", "你好"] {
            let result = rephraser.rephrase(&prompts, &history(), utterance).await;
            assert_eq!(result.into_inner(), utterance);
        }
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_follow_up_is_rewritten() {
        let (model, rephraser, prompts) =
            setup(vec![Reply::text("  申請 B 清寒獎學金需要什麼資格？\n")]);
        let result = rephraser.rephrase(&prompts, &history(), "它需要什麼資格?").await;
        assert_eq!(
            result,
            BestEffort::Computed("申請 B 清寒獎學金需要什麼資格？".to_string())
        );

        let request = &model.requests()[0];
        assert_eq!(request.temperature, 0.0);
        assert_eq!(request.max_tokens, Some(150));
        assert!(request.messages[1].content.contains("user: 我想找清寒獎學金"));
        assert!(request.messages[1].content.contains("它需要什麼資格?"));
    }

    #[tokio::test]
    async fn test_failure_and_blank_output_fall_back() {
        let (_, rephraser, prompts) = setup(vec![Reply::Fail, Reply::text("   ")]);

        let failed = rephraser.rephrase(&prompts, &history(), "那碩士班呢").await;
        assert!(failed.is_degraded());
        assert_eq!(failed.into_inner(), "那碩士班呢");

        let blank = rephraser.rephrase(&prompts, &history(), "那碩士班呢").await;
        assert!(blank.is_degraded());
        assert_eq!(blank.into_inner(), "那碩士班呢");
    }

    #[tokio::test]
    async fn test_history_is_truncated_to_window() {
        let (model, rephraser, prompts) = setup(vec![Reply::text("rewritten")]);
        let turns: Vec<_> = (0..12)
            .map(|i| ConversationTurn::user(format!("turn-{:02}", i)))
            .collect();

        rephraser.rephrase(&prompts, &turns, "and then?").await;

        let prompt = &model.requests()[0].messages[1].content;
        assert!(!prompt.contains("turn-03"));
        assert!(prompt.contains("turn-04"));
        assert!(prompt.contains("turn-11"));
    }
}
