//! Feedback handlers

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;

use crate::AppState;
use scholarbot_common::{
    db::{models::FeedbackType, Feedback},
    errors::{AppError, Result},
    metrics,
};

/// Feedback on a logged answer
#[derive(Debug, Deserialize, Validate)]
pub struct FeedbackRequest {
    /// `log_id` returned with the answer
    pub log_id: i32,

    /// `like` or `dislike`
    #[serde(default)]
    pub feedback_type: Option<String>,

    #[serde(default)]
    #[validate(length(max = 2000))]
    pub feedback_text: Option<String>,
}

impl FeedbackRequest {
    /// Blank fields count as absent; at least one must remain
    fn to_feedback(&self) -> Result<Feedback> {
        let feedback_type = match self.feedback_type.as_deref().map(str::trim) {
            Some(label) if !label.is_empty() => {
                Some(FeedbackType::from_label(label).ok_or_else(|| AppError::Validation {
                    message: format!("feedback_type must be 'like' or 'dislike', got '{}'", label),
                    field: Some("feedback_type".to_string()),
                })?)
            }
            _ => None,
        };

        let feedback_text = self
            .feedback_text
            .clone()
            .filter(|text| !text.trim().is_empty());

        if feedback_type.is_none() && feedback_text.is_none() {
            return Err(AppError::Validation {
                message: "feedback_type or feedback_text is required".to_string(),
                field: None,
            });
        }

        Ok(Feedback {
            feedback_type,
            feedback_text,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub status: &'static str,
}

/// Attach feedback to an existing QA record
pub async fn submit_feedback(
    State(state): State<AppState>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<FeedbackResponse>> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("feedback_text".to_string()),
    })?;
    let feedback = request.to_feedback()?;
    let kind = feedback.feedback_type.map_or("text", |t| t.as_str());

    if !state.logs.record_feedback(request.log_id, feedback).await? {
        return Err(AppError::LogNotFound { id: request.log_id });
    }

    metrics::record_feedback(kind);
    info!(log_id = request.log_id, feedback_type = kind, "Feedback recorded");

    Ok(Json(FeedbackResponse { status: "success" }))
}
