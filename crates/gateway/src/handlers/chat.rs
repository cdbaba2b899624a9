//! Chat and reset handlers

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{body_limit, AppState};
use propbot_common::{
    chat::{decode_image_payload, ChatFailure},
    errors::{AppError, Result},
};

/// Chat request
#[derive(Debug, Deserialize, Validate)]
pub struct ChatRequest {
    #[validate(length(min = 1, message = "message must not be empty"))]
    pub message: Option<String>,

    /// Session to continue; absent or unknown starts a new one
    #[serde(default)]
    pub session_id: Option<String>,

    /// Base64 image, optionally as a data URL
    #[serde(default)]
    pub image: Option<String>,
}

/// Chat response
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub session_id: String,
}

/// Reset request
#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub session_id: Option<String>,
}

/// Reset response
#[derive(Debug, Serialize, Deserialize)]
pub struct ResetResponse {
    pub session_id: String,
    /// Whether a stored session was discarded
    pub reset: bool,
}

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>, limit: usize) -> Result<T> {
    payload.map(|Json(body)| body).map_err(|rejection| match rejection {
        JsonRejection::BytesRejection(inner) if inner.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            AppError::BodyTooLarge { limit }
        }
        other => AppError::InvalidFormat {
            message: other.body_text(),
        },
    })
}

/// Blank ids are treated as absent
fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Process one chat message
pub async fn chat(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> std::result::Result<Json<ChatResponse>, ChatFailure> {
    let request = json_body(payload, body_limit(&state.config))?;

    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("message".to_string()),
    })?;

    let message = request.message.ok_or_else(|| AppError::MissingField {
        field: "message".to_string(),
    })?;

    let max_chars = state.config.server.max_message_chars;
    if message.chars().count() as u64 > max_chars {
        return Err(AppError::Validation {
            message: format!("message exceeds {} characters", max_chars),
            field: Some("message".to_string()),
        }
        .into());
    }

    let image = match request.image.as_deref() {
        Some(payload) => decode_image_payload(payload, state.config.server.max_image_bytes)?,
        None => None,
    };

    let session_id = non_blank(request.session_id);

    tracing::debug!(
        session_id = session_id.as_deref().unwrap_or("-"),
        has_image = image.is_some(),
        message_len = message.len(),
        "Chat request received"
    );

    // The turn runs to completion and is stored even if the client goes away
    let registry = state.registry.clone();
    let router = state.router.clone();
    let requested = session_id.clone();
    let turn = tokio::spawn(async move {
        registry
            .handle(&router, session_id.as_deref(), &message, image)
            .await
    });

    let reply = match turn.await {
        Ok(outcome) => outcome?,
        Err(e) => {
            return Err(ChatFailure {
                session_id: requested,
                error: AppError::Internal {
                    message: format!("chat turn aborted: {}", e),
                },
            })
        }
    };

    Ok(Json(ChatResponse {
        response: reply.reply,
        session_id: reply.session_id,
    }))
}

/// Discard a session's history
pub async fn reset(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ResetRequest>, JsonRejection>,
) -> Result<Json<ResetResponse>> {
    let request = json_body(payload, body_limit(&state.config))?;

    let session_id = non_blank(request.session_id).ok_or_else(|| AppError::MissingField {
        field: "session_id".to_string(),
    })?;

    let reset = state.registry.reset(&session_id).await?;

    Ok(Json(ResetResponse { session_id, reset }))
}
