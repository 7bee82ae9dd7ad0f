//! Filter Extractor - maps free text onto the controlled metadata vocabulary

use super::BestEffort;
use crate::errors::{AppError, Result};
use crate::index::FilterExpression;
use crate::llm::{ChatMessage, ChatModel, CompletionRequest};
use crate::metrics;
use crate::prompts::{render, PromptSet};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, instrument, warn};

/// Allowed tag values per categorical field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataSchema {
    fields: BTreeMap<String, Vec<String>>,
}

impl MetadataSchema {
    /// Vocabulary the scholarship index is tagged with
    pub fn builtin() -> Self {
        let field = |name: &str, values: &[&str]| {
            (
                name.to_string(),
                values.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
            )
        };

        Self {
            fields: BTreeMap::from([
                field(
                    "status",
                    &[
                        "一般生", "原住民", "中低收入戶", "清寒", "低收入戶", "弱勢學生", "境外生",
                        "國際生", "僑生", "港澳生", "身心障礙", "交換生", "畢業生",
                    ],
                ),
                field(
                    "subsidy_type",
                    &[
                        "海外交流", "獎學金", "獎勵金", "助學金", "工讀", "就學貸款", "生活津貼",
                        "急難救助", "志工服務", "社團交流", "住宿補助",
                    ],
                ),
                field(
                    "edu_system",
                    &["五專", "二技", "專科", "大學部", "碩士班", "博士班"],
                ),
            ]),
        }
    }

    /// Parse a `{"field": ["value", ...]}` JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let schema: Self = serde_json::from_str(json)?;
        if schema.fields.is_empty() {
            return Err(AppError::Configuration {
                message: "Metadata schema declares no fields".to_string(),
            });
        }
        Ok(schema)
    }

    /// Built-in schema, or the file at `path`.
    ///
    /// An unreadable or malformed file yields `None`: filtering is then
    /// skipped rather than failing start-up.
    pub fn load(path: Option<&Path>) -> Option<Self> {
        let Some(path) = path else {
            return Some(Self::builtin());
        };

        let loaded = std::fs::read_to_string(path)
            .map_err(AppError::from)
            .and_then(|json| Self::from_json(&json));

        match loaded {
            Ok(schema) => {
                info!(path = %path.display(), fields = schema.fields.len(), "Metadata schema loaded");
                Some(schema)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Metadata schema unavailable, searching unfiltered");
                None
            }
        }
    }

    pub fn allows(&self, field: &str, value: &str) -> bool {
        self.fields
            .get(field)
            .is_some_and(|values| values.iter().any(|v| v == value))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_default()
    }
}

/// Field -> non-empty set of schema-approved values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MetadataFilter {
    fields: BTreeMap<String, Vec<String>>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.fields.get(field).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// `ARRAY_CONTAINS_ANY` per field joined with `and`; `None` when unconstrained
    pub fn to_expression(&self) -> Option<FilterExpression> {
        FilterExpression::contains_any(
            self.fields
                .iter()
                .map(|(field, values)| (field.as_str(), values.iter().map(String::as_str))),
        )
    }

    /// Keep only schema fields and values, de-duplicated, dropping empty fields.
    /// A bare string value is accepted as a one-element array.
    fn from_model_output(value: Value, schema: &MetadataSchema) -> Option<Self> {
        let Value::Object(map) = value else {
            return None;
        };

        let mut fields = BTreeMap::new();
        for (field, raw) in map {
            let candidates: Vec<String> = match raw {
                Value::String(s) => vec![s],
                Value::Array(items) => items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };

            let mut values: Vec<String> = Vec::new();
            for candidate in candidates {
                let candidate = candidate.trim().to_string();
                if !schema.allows(&field, &candidate) {
                    debug!(field = %field, value = %candidate, "Dropping value outside the schema");
                    continue;
                }
                if !values.contains(&candidate) {
                    values.push(candidate);
                }
            }

            if !values.is_empty() {
                fields.insert(field, values);
            }
        }

        Some(Self { fields })
    }
}

/// Markdown code fences some models wrap JSON in despite instructions
fn code_fence() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)^```[A-Za-z]*\s*(.*?)\s*```$").ok())
        .as_ref()
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    code_fence()
        .and_then(|fence| fence.captures(trimmed))
        .and_then(|caps| caps.get(1))
        .map_or(trimmed, |m| m.as_str())
}

/// Parse model output into a filter; `None` when it is not a JSON object
pub(crate) fn parse_filter(raw: &str, schema: &MetadataSchema) -> Option<MetadataFilter> {
    let value: Value = serde_json::from_str(strip_code_fence(raw)).ok()?;
    MetadataFilter::from_model_output(value, schema)
}

/// Extracts a [`MetadataFilter`] for a question
pub struct FilterExtractor {
    model: Arc<dyn ChatModel>,
    schema: Option<MetadataSchema>,
}

impl FilterExtractor {
    pub fn new(model: Arc<dyn ChatModel>, schema: Option<MetadataSchema>) -> Self {
        Self { model, schema }
    }

    /// Never fails: any problem degrades to an empty (unconstraining) filter
    #[instrument(skip_all)]
    pub async fn extract(&self, prompts: &PromptSet, question: &str) -> BestEffort<MetadataFilter> {
        let Some(schema) = &self.schema else {
            metrics::record_filter_extraction("failed");
            return BestEffort::Degraded(MetadataFilter::default());
        };

        let schema_json = schema.to_json();
        let prompt = render(
            &prompts.filter_extraction,
            &[("metadata_schema", schema_json.as_str()), ("question", question)],
        );

        let raw = match self
            .model
            .complete(CompletionRequest::new(vec![ChatMessage::user(prompt)], 0.0))
            .await
        {
            Ok(completion) => completion.text,
            Err(e) => {
                warn!(error = %e, "Filter extraction call failed, searching unfiltered");
                metrics::record_filter_extraction("failed");
                return BestEffort::Degraded(MetadataFilter::default());
            }
        };

        match parse_filter(&raw, schema) {
            Some(filter) => {
                debug!(raw = %raw.trim(), fields = filter.len(), "Metadata filter extracted");
                metrics::record_filter_extraction(if filter.is_empty() { "empty" } else { "applied" });
                BestEffort::Computed(filter)
            }
            None => {
                warn!(raw = %raw.trim(), "Filter output is not a JSON object, searching unfiltered");
                metrics::record_filter_extraction("failed");
                BestEffort::Degraded(MetadataFilter::default())
            }
        }
    }
}
