//! Vector index client
//!
//! Filtered top-K similarity search against a Milvus / Zilliz collection
//! through its REST API. Hits come back as opaque entity maps that the
//! retriever normalizes.

use crate::config::VectorIndexConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Duration;

/// Scalar fields requested with every hit
pub const OUTPUT_FIELDS: &[&str] = &[
    "id",
    "text",
    "source_file",
    "source_url",
    "status",
    "subsidy_type",
    "edu_system",
];

/// Boolean filter over array fields, `ARRAY_CONTAINS_ANY` predicates joined by `and`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterExpression(String);

impl FilterExpression {
    /// Build `ARRAY_CONTAINS_ANY(field, [..])` predicates for every non-empty
    /// value set. Returns `None` when nothing constrains the search.
    pub fn contains_any<'a, I, V>(predicates: I) -> Option<Self>
    where
        I: IntoIterator<Item = (&'a str, V)>,
        V: IntoIterator<Item = &'a str>,
    {
        let parts: Vec<String> = predicates
            .into_iter()
            .filter_map(|(field, values)| {
                let quoted: Vec<String> = values.into_iter().map(quote).collect();
                if quoted.is_empty() {
                    None
                } else {
                    Some(format!("ARRAY_CONTAINS_ANY({}, [{}])", field, quoted.join(", ")))
                }
            })
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(Self(parts.join(" and ")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// One similarity hit
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Primary key as returned by the index
    pub id: Value,
    /// Similarity score (cosine: higher is closer)
    pub distance: f32,
    /// Remaining output fields
    pub entity: Map<String, Value>,
}

/// Trait for similarity search
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Search the top `limit` neighbours of `vector`, ordered by relevance
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&FilterExpression>,
    ) -> Result<Vec<SearchHit>>;
}

/// Milvus REST (v2) client
pub struct MilvusClient {
    client: reqwest::Client,
    config: VectorIndexConfig,
    search_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequest<'a> {
    collection_name: &'a str,
    data: [&'a [f32]; 1],
    anns_field: &'a str,
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<&'a str>,
    output_fields: &'a [&'a str],
    search_params: Value,
}

#[derive(Deserialize)]
struct SearchResponse {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Vec<Map<String, Value>>,
}

impl MilvusClient {
    /// Create a new index client
    pub fn new(config: VectorIndexConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let search_url = format!(
            "{}/v2/vectordb/entities/search",
            config.endpoint.trim_end_matches('/')
        );

        Ok(Self {
            client,
            config,
            search_url,
        })
    }
}

#[async_trait]
impl VectorIndex for MilvusClient {
    async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&FilterExpression>,
    ) -> Result<Vec<SearchHit>> {
        let request = SearchRequest {
            collection_name: &self.config.collection,
            data: [vector],
            anns_field: &self.config.vector_field,
            limit,
            filter: filter.map(FilterExpression::as_str),
            output_fields: OUTPUT_FIELDS,
            search_params: json!({
                "metricType": self.config.metric_type,
                "params": { "nprobe": self.config.nprobe },
            }),
        };

        let mut builder = self.client.post(&self.search_url).json(&request);
        if let Some(token) = &self.config.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| AppError::VectorIndexError {
            message: format!("Search request failed: {}", e),
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::VectorIndexError {
                message: format!("Index API error {}: {}", status, body),
            });
        }

        let body: SearchResponse = response.json().await.map_err(|e| AppError::VectorIndexError {
            message: format!("Failed to parse search response: {}", e),
        })?;

        if body.code != 0 {
            return Err(AppError::VectorIndexError {
                message: format!(
                    "Search rejected (code {}): {}",
                    body.code,
                    body.message.unwrap_or_default()
                ),
            });
        }

        Ok(body.data.into_iter().map(into_hit).collect())
    }
}

/// Split a flat REST hit into id, distance and the remaining entity fields
fn into_hit(mut row: Map<String, Value>) -> SearchHit {
    let distance = row
        .remove("distance")
        .and_then(|d| d.as_f64())
        .unwrap_or_default() as f32;
    let id = row.get("id").cloned().unwrap_or(Value::Null);

    // Some deployments nest output fields under "entity"
    let entity = match row.remove("entity") {
        Some(Value::Object(nested)) => nested,
        _ => row,
    };

    SearchHit { id, distance, entity }
}
