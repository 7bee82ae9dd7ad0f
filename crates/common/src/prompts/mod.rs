//! Locale-keyed prompt catalog
//!
//! Every piece of model-facing text lives here as data: templates with
//! named `{placeholders}`, the intent definition table, the context block
//! labels and the acknowledgement phrases the rephraser passes through.
//! The pipeline picks a [`PromptSet`] per request by language tag.

use crate::config::PipelineConfig;
use crate::errors::{AppError, Result};
use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const BUILTIN_PROMPTS: &str = include_str!("../../prompts/builtin.toml");

/// Labels used when formatting retrieved contexts for the answer prompt
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContextLabels {
    pub source: String,
    pub url: String,
    pub content: String,
}

/// All prompts for one language
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PromptSet {
    /// Rewrite instructions; user template uses `{history}` and `{question}`
    pub rephrase_system: String,
    pub rephrase_user: String,

    /// Grounded answer; user template uses `{question}` and `{context}`
    pub rag_system: String,
    pub rag_user: String,

    /// Canned answer when retrieval finds nothing
    pub no_result_answer: String,

    pub small_talk_system: String,

    /// Uses `{intent_options}` and `{question}`
    pub intent_prompt: String,

    /// Intent label -> natural-language definition
    pub intent_definitions: BTreeMap<String, String>,

    /// Uses `{metadata_schema}` and `{question}`
    pub filter_extraction: String,

    pub context_labels: ContextLabels,

    /// Utterances returned verbatim by the rephraser without a model call
    #[serde(default)]
    pub passthrough_phrases: Vec<String>,
}

impl PromptSet {
    /// One `- label: definition` line per intent
    pub fn intent_options(&self) -> String {
        self.intent_definitions
            .iter()
            .map(|(label, definition)| format!("- {}: {}", label, definition))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Whether the utterance is a bare acknowledgement or greeting
    pub fn is_passthrough(&self, utterance: &str) -> bool {
        let normalized = normalize_utterance(utterance);
        if normalized.is_empty() {
            return false;
        }
        self.passthrough_phrases
            .iter()
            .any(|phrase| normalize_utterance(phrase) == normalized)
    }
}

/// Trim, case-fold and drop trailing punctuation ("Thanks!" == "thanks")
fn normalize_utterance(text: &str) -> String {
    text.trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || "！。～，、？；…~".contains(c))
        .trim()
        .to_lowercase()
}

/// Substitute `{name}` placeholders in a single pass.
///
/// Unknown placeholders are left untouched and substituted values are
/// never re-scanned, so a question containing `{context}` stays literal.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match vars.iter().find(|(key, _)| *key == name) {
                    Some((_, value)) => {
                        out.push_str(value);
                        rest = &after[close + 1..];
                    }
                    None => {
                        out.push('{');
                        rest = after;
                    }
                }
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// Prompt sets keyed by language tag
#[derive(Debug, Clone)]
pub struct PromptCatalog {
    default_language: String,
    default_set: Arc<PromptSet>,
    sets: BTreeMap<String, Arc<PromptSet>>,
}

impl PromptCatalog {
    /// Built-in `zh` and `en` sets
    pub fn builtin(default_language: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(BUILTIN_PROMPTS, FileFormat::Toml))
            .build()?;
        Self::from_config(config, default_language)
    }

    /// Built-ins layered with the optional override file from the pipeline config.
    ///
    /// The override is merged key by key, so it may replace a single template
    /// of an existing language or add a complete new language.
    pub fn load(config: &PipelineConfig) -> Result<Self> {
        let mut builder =
            Config::builder().add_source(File::from_str(BUILTIN_PROMPTS, FileFormat::Toml));

        if let Some(path) = &config.prompts_path {
            info!(path = %path.display(), "Loading prompt overrides");
            builder = builder.add_source(File::from(path.as_path()).format(FileFormat::Toml));
        }

        Self::from_config(builder.build()?, &config.default_language)
    }

    fn from_config(config: Config, default_language: &str) -> Result<Self> {
        let sets: BTreeMap<String, PromptSet> = config.try_deserialize()?;
        let default_language = normalize_language(default_language);

        let sets: BTreeMap<String, Arc<PromptSet>> = sets
            .into_iter()
            .map(|(lang, set)| (lang, Arc::new(set)))
            .collect();

        let default_set = sets.get(&default_language).cloned().ok_or_else(|| {
            AppError::Configuration {
                message: format!(
                    "Default language '{}' has no prompt set (available: {})",
                    default_language,
                    sets.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
            }
        })?;

        Ok(Self {
            default_language,
            default_set,
            sets,
        })
    }

    /// Prompt set for a request language; unknown or missing tags use the default
    pub fn for_language(&self, lang: Option<&str>) -> Arc<PromptSet> {
        lang.map(normalize_language)
            .and_then(|lang| self.sets.get(&lang))
            .unwrap_or(&self.default_set)
            .clone()
    }

    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }
}

/// `zh-TW` -> `zh`, `EN_us` -> `en`
fn normalize_language(tag: &str) -> String {
    tag.trim()
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_has_both_languages() {
        let catalog = PromptCatalog::builtin("zh").unwrap();
        let langs: Vec<_> = catalog.languages().collect();
        assert_eq!(langs, vec!["en", "zh"]);

        let zh = catalog.for_language(Some("zh"));
        assert_eq!(zh.no_result_answer, "抱歉，我沒有找到相關的補助或獎學金資訊。");
        assert!(zh.rag_system.contains("|||SOURCES|||"));
        assert!(zh.intent_definitions.contains_key("scholarship"));
        assert!(zh.intent_definitions.contains_key("other"));

        let en = catalog.for_language(Some("en"));
        assert!(en.no_result_answer.starts_with("I'm sorry"));
        assert_eq!(en.context_labels.source, "Source Name");
    }

    #[test]
    fn test_language_fallback() {
        let catalog = PromptCatalog::builtin("zh").unwrap();
        let zh = catalog.for_language(None);
        assert_eq!(zh.context_labels.source, "來源名稱");

        let unknown = catalog.for_language(Some("fr"));
        assert_eq!(unknown.context_labels.source, "來源名稱");

        let regional = catalog.for_language(Some("en-US"));
        assert_eq!(regional.context_labels.source, "Source Name");
    }

    #[test]
    fn test_override_file_merges_key_by_key() {
        let path = std::env::temp_dir().join(format!("scholarbot-prompts-{}.toml", std::process::id()));
        std::fs::write(&path, "[en]\nno_result_answer = \"Nothing found.\"\n").unwrap();

        let config = PipelineConfig {
            prompts_path: Some(path.clone()),
            ..PipelineConfig::default()
        };
        let catalog = PromptCatalog::load(&config);
        std::fs::remove_file(&path).ok();
        let catalog = catalog.unwrap();

        let en = catalog.for_language(Some("en"));
        assert_eq!(en.no_result_answer, "Nothing found.");
        // Untouched keys of the same language keep their built-in text
        assert_eq!(en.context_labels.source, "Source Name");
        assert!(en.rag_system.contains("|||SOURCES|||"));

        let zh = catalog.for_language(Some("zh"));
        assert_eq!(zh.no_result_answer, "抱歉，我沒有找到相關的補助或獎學金資訊。");
    }

    #[test]
    fn test_unknown_default_language_rejected() {
        let result = PromptCatalog::builtin("fr");
        assert!(matches!(result, Err(AppError::Configuration { .. })));
    }

    #[test]
    fn test_render_substitutes_once() {
        let out = render(
            "Q: {question}\nC: {context}\nKeep {unknown}",
            &[("question", "what is {context}?"), ("context", "chunk")],
        );
        assert_eq!(out, "Q: what is {context}?\nC: chunk\nKeep {unknown}");
    }

    #[test]
    fn test_render_unclosed_brace() {
        assert_eq!(render("a {b", &[("b", "x")]), "a {b");
        assert_eq!(render("{\"status\": [..]}", &[]), "{\"status\": [..]}");
    }

    #[test]
    fn test_intent_options_lists_every_label() {
        let catalog = PromptCatalog::builtin("en").unwrap();
        let options = catalog.for_language(None).intent_options();
        assert!(options.contains("- scholarship: "));
        assert!(options.contains("- other: "));
    }

    #[test]
    fn test_passthrough_matching() {
        let catalog = PromptCatalog::builtin("zh").unwrap();
        let zh = catalog.for_language(Some("zh"));
        assert!(zh.is_passthrough("謝謝！"));
        assert!(zh.is_passthrough("  你好 "));
        assert!(!zh.is_passthrough("它需要什麼資格?"));

        let en = catalog.for_language(Some("en"));
        assert!(en.is_passthrough("Thanks!"));
        assert!(en.is_passthrough("OK."));
        assert!(!en.is_passthrough(""));
        assert!(!en.is_passthrough("What about it?"));
    }
}
