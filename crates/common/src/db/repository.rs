//! Repository pattern for database operations
//!
//! The pipeline only appends QA records and the feedback endpoint only
//! touches the two feedback columns of an existing record.

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::Result;
use crate::llm::TokenUsage;
use async_trait::async_trait;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, NotSet, QueryFilter, Set};
use serde::{Deserialize, Serialize};

/// Audit record written once per chat request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQaLog {
    pub question: String,
    pub rephrased_question: String,
    pub answer: String,
    /// Cited contexts serialized as JSON
    pub contexts: serde_json::Value,
    pub latency_ms: f64,
    pub usage: Option<TokenUsage>,
}

/// Feedback fields of an existing record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Feedback {
    pub feedback_type: Option<FeedbackType>,
    pub feedback_text: Option<String>,
}

/// Append/update log store used by the pipeline and the feedback endpoint
#[async_trait]
pub trait QaLogStore: Send + Sync {
    /// Insert a record and return its generated id
    async fn insert(&self, record: NewQaLog) -> Result<i32>;

    /// Set the feedback columns of record `id`; `false` when no such record exists
    async fn record_feedback(&self, id: i32, feedback: Feedback) -> Result<bool>;

    /// Round-trip to the backing store
    async fn ping(&self) -> Result<()>;
}

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> &DatabaseConnection {
        self.pool.connection()
    }
}

#[async_trait]
impl QaLogStore for Repository {
    async fn insert(&self, record: NewQaLog) -> Result<i32> {
        let usage = record.usage;
        let tokens = |pick: fn(&TokenUsage) -> u32| usage.as_ref().and_then(|u| i32::try_from(pick(u)).ok());

        let row = QaLogActiveModel {
            id: NotSet,
            question: Set(Some(record.question)),
            rephrased_question: Set(Some(record.rephrased_question)),
            answer: Set(Some(record.answer)),
            retrieved_contexts: Set(Some(record.contexts)),
            latency_ms: Set(Some(record.latency_ms as f32)),
            prompt_tokens: Set(tokens(|u| u.prompt_tokens)),
            completion_tokens: Set(tokens(|u| u.completion_tokens)),
            total_tokens: Set(tokens(|u| u.total_tokens)),
            feedback_type: Set(None),
            feedback_text: Set(None),
            created_at: NotSet,
        };

        let result = QaLogEntity::insert(row).exec(self.conn()).await?;
        Ok(result.last_insert_id)
    }

    async fn record_feedback(&self, id: i32, feedback: Feedback) -> Result<bool> {
        let mut update = QaLogEntity::update_many().filter(QaLogColumn::Id.eq(id));

        if let Some(kind) = feedback.feedback_type {
            update = update.col_expr(QaLogColumn::FeedbackType, Expr::value(kind.as_str()));
        }
        if let Some(text) = feedback.feedback_text {
            update = update.col_expr(QaLogColumn::FeedbackText, Expr::value(text));
        }

        let result = update.exec(self.conn()).await?;
        Ok(result.rows_affected > 0)
    }

    async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }
}
