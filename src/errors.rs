use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Broken entropy source or repeated collisions. Never retried.
    #[error("token generation failed: {0}")]
    TokenGeneration(String),

    #[error("corrupted record: channel_name={channel_name}, version={version}, created_at={created_at}")]
    CorruptedRecord {
        channel_name: String,
        version: i32,
        created_at: String,
    },

    #[error("slack error: {0}")]
    Slack(String),

    #[error("invalid request signature")]
    InvalidSignature,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// A concurrent writer won the conditional insert for the same key.
    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::Store(StoreError::Conflict { .. }))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "invalid_signature",
                "invalid request signature".to_string(),
            ),
            AppError::Slack(e) => {
                tracing::warn!(error = %e, "slack call failed");
                (
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    "slack_failed",
                    e.clone(),
                )
            }
            AppError::Store(_)
            | AppError::TokenGeneration(_)
            | AppError::CorruptedRecord { .. }
            | AppError::Internal(_) => {
                tracing::error!(error = %self, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}
