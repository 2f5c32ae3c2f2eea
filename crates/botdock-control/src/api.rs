use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::request_meta::RequestMeta;

/// JSON error body returned by every route.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub request_id: String,
}

impl ApiError {
    pub fn new(
        meta: &RequestMeta,
        status: StatusCode,
        code: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            request_id: meta.request_id.clone(),
        }
    }

    pub fn from_agent(meta: &RequestMeta, err: botdock_agent::Error) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(request_id = %meta.request_id, code = err.code(), %err, "request failed");
        }
        Self::new(meta, status, err.code(), err.to_string())
    }

    pub fn db(meta: &RequestMeta, err: sea_orm::DbErr) -> Self {
        tracing::error!(request_id = %meta.request_id, %err, "database error");
        Self::new(
            meta,
            StatusCode::INTERNAL_SERVER_ERROR,
            "db_error",
            "database error",
        )
    }

    pub fn invalid_param(meta: &RequestMeta, message: impl Into<String>) -> Self {
        Self::new(meta, StatusCode::UNPROCESSABLE_ENTITY, "invalid_param", message)
    }

    pub fn not_found(meta: &RequestMeta, message: impl Into<String>) -> Self {
        Self::new(meta, StatusCode::NOT_FOUND, "not_found", message)
    }
}

/// HTTP status for a core error.
pub fn status_for(err: &botdock_agent::Error) -> StatusCode {
    use botdock_agent::Error;

    match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidTransition { .. }
        | Error::BotActive
        | Error::TransitionInProgress
        | Error::NotRunning
        | Error::StdinBlocked => StatusCode::CONFLICT,
        Error::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        Error::Spawn(_) | Error::InvalidPayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::ForceKillRequired | Error::ProcessGone | Error::Tenant(_) | Error::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}
