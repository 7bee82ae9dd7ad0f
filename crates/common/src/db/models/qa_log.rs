//! QA audit log entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "qa_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Question exactly as the user typed it
    pub question: Option<String>,

    /// Self-contained question the pipeline actually answered
    pub rephrased_question: Option<String>,

    pub answer: Option<String>,

    /// Cited contexts (all chunks, before display de-duplication)
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub retrieved_contexts: Option<Json>,

    pub latency_ms: Option<f32>,

    pub prompt_tokens: Option<i32>,

    pub completion_tokens: Option<i32>,

    pub total_tokens: Option<i32>,

    pub feedback_type: Option<String>,

    pub feedback_text: Option<String>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// User verdict on an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackType {
    Like,
    Dislike,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackType::Like => "like",
            FeedbackType::Dislike => "dislike",
        }
    }

    /// Case-insensitive parse of `like` / `dislike`
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "like" => Some(FeedbackType::Like),
            "dislike" => Some(FeedbackType::Dislike),
            _ => None,
        }
    }
}
