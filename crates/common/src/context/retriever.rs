//! Retriever - filtered top-K similarity search with hit normalization

use super::{ContextId, FilterExtractor, RetrievedContext};
use crate::embeddings::Embedder;
use crate::errors::Result;
use crate::index::{SearchHit, VectorIndex};
use crate::metrics;
use crate::prompts::PromptSet;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// Embeds the question and searches the index
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    filter: Option<FilterExtractor>,
    top_k: usize,
}

impl Retriever {
    /// `filter` is `None` when metadata filtering is switched off
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        filter: Option<FilterExtractor>,
        top_k: usize,
    ) -> Self {
        Self {
            embedder,
            index,
            filter,
            top_k,
        }
    }

    /// Up to `top_k` contexts in the index's relevance order.
    ///
    /// Zero hits is an empty vector, not an error. Embedding and search
    /// failures propagate.
    #[instrument(skip_all)]
    pub async fn retrieve(&self, prompts: &PromptSet, question: &str) -> Result<Vec<RetrievedContext>> {
        let start = Instant::now();

        let expression = match &self.filter {
            Some(extractor) => extractor
                .extract(prompts, question)
                .await
                .into_inner()
                .to_expression(),
            None => None,
        };
        if let Some(expr) = &expression {
            info!(filter = %expr, "Searching with metadata filter");
        }

        let vector = self.embedder.embed(question).await?;
        let hits = self
            .index
            .search(&vector, self.top_k, expression.as_ref())
            .await?;

        let contexts: Vec<RetrievedContext> = hits.into_iter().map(normalize_hit).collect();

        for (rank, ctx) in contexts.iter().enumerate() {
            let preview: String = ctx.text.chars().take(100).collect();
            debug!(
                rank = rank + 1,
                source = %ctx.source_file,
                distance = ctx.distance,
                text = %preview,
                "Retrieved chunk"
            );
        }
        info!(hits = contexts.len(), "Retrieval finished");

        metrics::record_retrieval(
            start.elapsed().as_secs_f64(),
            contexts.len(),
            expression.is_some(),
        );

        Ok(contexts)
    }
}

/// Coerce an index hit into a [`RetrievedContext`]
pub(crate) fn normalize_hit(hit: SearchHit) -> RetrievedContext {
    let SearchHit {
        id,
        distance,
        mut entity,
    } = hit;

    let id = parse_id(&id)
        .or_else(|| entity.get("id").and_then(parse_id))
        .unwrap_or_else(|| ContextId::Text(String::new()));

    let source_file = take_string(&mut entity, "source_file").unwrap_or_default();
    let source_file = source_file
        .strip_suffix(".md")
        .map(str::to_string)
        .unwrap_or(source_file);

    RetrievedContext {
        id,
        text: take_string(&mut entity, "text").unwrap_or_default(),
        source_file,
        source_url: take_string(&mut entity, "source_url").filter(|url| !url.is_empty()),
        status: take_tags(&mut entity, "status"),
        subsidy_type: take_tags(&mut entity, "subsidy_type"),
        edu_system: take_tags(&mut entity, "edu_system"),
        distance,
    }
}

fn parse_id(value: &Value) -> Option<ContextId> {
    match value {
        Value::Number(n) => n.as_i64().map(ContextId::Int),
        Value::String(s) => Some(
            s.parse::<i64>()
                .map(ContextId::Int)
                .unwrap_or_else(|_| ContextId::Text(s.clone())),
        ),
        _ => None,
    }
}

fn take_string(entity: &mut Map<String, Value>, field: &str) -> Option<String> {
    match entity.remove(field)? {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Array fields may come back as arrays, a single string, or null
fn take_tags(entity: &mut Map<String, Value>, field: &str) -> Vec<String> {
    match entity.remove(field) {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s],
        _ => Vec::new(),
    }
}
