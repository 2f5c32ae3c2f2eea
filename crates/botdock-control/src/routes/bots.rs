use axum::{
    Extension, Json,
    extract::{Multipart, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use botdock_db::entities::bots;
use botdock_process::{BotId, BotState, PlanLimits};
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    api::ApiError,
    audit::{self, Subject},
    auth::AuthUser,
    request_meta::RequestMeta,
    state::AppState,
};

const ENTRY_FILE_NAME: &str = "bot.py";
const REQUIREMENTS_FILE_NAME: &str = "requirements.txt";

#[derive(Debug, Serialize)]
pub struct Success {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Success {
    fn ok() -> Json<Self> {
        Json(Self {
            success: true,
            message: None,
        })
    }

    fn with_message(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: Some(message.into()),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct BotRef {
    pub bot_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateBotRequest {
    pub bot_name: String,
}

#[derive(Debug, Serialize)]
pub struct CreateBotResponse {
    pub success: bool,
    pub bot_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub bot_id: String,
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub bot_id: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: BotState,
    pub start_time: Option<String>,
    pub restart_count: u32,
    pub error_reason: Option<String>,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    /// `[timestamp, line, is_error]` triples, oldest first.
    pub logs: Vec<(String, String, bool)>,
}

#[derive(Debug, Serialize)]
pub struct ResourcesResponse {
    pub cpu: f64,
    pub ram: u64,
}

#[derive(Debug, Serialize)]
pub struct BotSummary {
    pub id: String,
    pub bot_name: String,
    pub status: BotState,
}

#[derive(Debug, Serialize)]
pub struct PlanInfoResponse {
    pub plan: String,
    pub limits: PlanLimits,
}

/// Resolves `raw` to a bot the caller owns. Foreign bots are reported as
/// missing.
fn owned_bot(
    state: &AppState,
    meta: &RequestMeta,
    user: &AuthUser,
    raw: &str,
) -> Result<BotId, ApiError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ApiError::invalid_param(meta, "bot_id is required"));
    }
    let id = BotId::from(raw);
    state
        .orchestrator
        .authorize(&id, &user.tenant_id())
        .map_err(|e| ApiError::from_agent(meta, e))?;
    Ok(id)
}

fn enforce_rate_limit(
    state: &AppState,
    meta: &RequestMeta,
    user: &AuthUser,
) -> Result<(), ApiError> {
    let key = format!("user:{}", user.user_id);
    if !state.limiter.allow(&key) {
        return Err(ApiError::new(
            meta,
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "too many requests",
        ));
    }
    Ok(())
}

pub async fn create(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    user: AuthUser,
    Json(input): Json<CreateBotRequest>,
) -> Result<Json<CreateBotResponse>, ApiError> {
    let status = state
        .orchestrator
        .create_bot(&user.tenant_id(), &input.bot_name)
        .await
        .map_err(|e| ApiError::from_agent(&meta, e))?;

    let row = bots::ActiveModel {
        id: Set(status.id.to_string()),
        user_id: Set(user.user_id),
        bot_name: Set(status.name.clone()),
        created_at: Set(chrono::Utc::now().into()),
    };
    if let Err(err) = row.insert(&*state.db).await {
        if let Err(cleanup) = state.orchestrator.delete_bot(&status.id).await {
            tracing::warn!(bot_id = %status.id, err = %cleanup, "rollback of unsaved bot failed");
        }
        return Err(ApiError::db(&meta, err));
    }

    audit::record(
        &state.db,
        &meta,
        &user,
        "bot.create",
        Subject::Bot {
            id: &status.id,
            owner: &status.owner,
        },
        Some(json!({ "bot_name": status.name })),
    )
    .await;

    Ok(Json(CreateBotResponse {
        success: true,
        bot_id: status.id.to_string(),
    }))
}

enum PayloadFile {
    Entry,
    Requirements,
}

fn classify_upload(file_name: &str) -> Option<PayloadFile> {
    match file_name {
        ENTRY_FILE_NAME => Some(PayloadFile::Entry),
        REQUIREMENTS_FILE_NAME => Some(PayloadFile::Requirements),
        _ => None,
    }
}

/// Multipart upload: a `bot_id` text field plus files named `bot.py` and/or
/// `requirements.txt`. Client file names select the slot and are never used
/// as paths.
pub async fn upload(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    user: AuthUser,
    mut multipart: Multipart,
) -> Result<Json<Success>, ApiError> {
    let bad_form = |err: axum::extract::multipart::MultipartError| {
        ApiError::invalid_param(&meta, format!("malformed upload: {err}"))
    };

    let mut bot_id = None;
    let mut entry = None;
    let mut requirements = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_form)? {
        let file_name = field.file_name().map(str::to_string);
        match file_name {
            None => {
                if field.name() == Some("bot_id") {
                    bot_id = Some(field.text().await.map_err(bad_form)?);
                }
            }
            Some(name) if name.is_empty() => continue,
            Some(name) => {
                let slot = classify_upload(&name).ok_or_else(|| {
                    ApiError::invalid_param(
                        &meta,
                        format!(
                            "invalid file type: {name}; only {REQUIREMENTS_FILE_NAME} and {ENTRY_FILE_NAME} are allowed"
                        ),
                    )
                })?;
                let data = field.bytes().await.map_err(bad_form)?;
                match slot {
                    PayloadFile::Entry => entry = Some(data),
                    PayloadFile::Requirements => requirements = Some(data),
                }
            }
        }
    }

    let raw_id = bot_id.ok_or_else(|| ApiError::invalid_param(&meta, "bot_id is required"))?;
    let id = owned_bot(&state, &meta, &user, &raw_id)?;

    state
        .orchestrator
        .upload_payload(&id, entry.as_deref(), requirements.as_deref())
        .await
        .map_err(|e| ApiError::from_agent(&meta, e))?;

    audit::record(
        &state.db,
        &meta,
        &user,
        "bot.upload",
        Subject::Bot {
            id: &id,
            owner: &user.tenant_id(),
        },
        Some(json!({
            "bot_file": entry.as_ref().map(|b| b.len()),
            "requirements": requirements.as_ref().map(|b| b.len()),
        })),
    )
    .await;

    Ok(Success::ok())
}

pub async fn start(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    user: AuthUser,
    Json(input): Json<BotRef>,
) -> Result<Json<Success>, ApiError> {
    enforce_rate_limit(&state, &meta, &user)?;
    let id = owned_bot(&state, &meta, &user, &input.bot_id)?;
    state
        .orchestrator
        .start_bot(&id)
        .await
        .map_err(|e| ApiError::from_agent(&meta, e))?;
    let owner = user.tenant_id();
    let subject = Subject::Bot { id: &id, owner: &owner };
    audit::record(&state.db, &meta, &user, "bot.start", subject, None).await;
    Ok(Success::with_message("Bot started"))
}

pub async fn stop(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    user: AuthUser,
    Json(input): Json<BotRef>,
) -> Result<Json<Success>, ApiError> {
    enforce_rate_limit(&state, &meta, &user)?;
    let id = owned_bot(&state, &meta, &user, &input.bot_id)?;
    state
        .orchestrator
        .stop_bot(&id)
        .await
        .map_err(|e| ApiError::from_agent(&meta, e))?;
    let owner = user.tenant_id();
    let subject = Subject::Bot { id: &id, owner: &owner };
    audit::record(&state.db, &meta, &user, "bot.stop", subject, None).await;
    Ok(Success::ok())
}

pub async fn restart(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    user: AuthUser,
    Json(input): Json<BotRef>,
) -> Result<Json<Success>, ApiError> {
    enforce_rate_limit(&state, &meta, &user)?;
    let id = owned_bot(&state, &meta, &user, &input.bot_id)?;
    state
        .orchestrator
        .restart_bot(&id)
        .await
        .map_err(|e| ApiError::from_agent(&meta, e))?;
    let owner = user.tenant_id();
    let subject = Subject::Bot { id: &id, owner: &owner };
    audit::record(&state.db, &meta, &user, "bot.restart", subject, None).await;
    Ok(Success::with_message("Bot restarted"))
}

pub async fn command(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    user: AuthUser,
    Json(input): Json<CommandRequest>,
) -> Result<Json<Success>, ApiError> {
    let id = owned_bot(&state, &meta, &user, &input.bot_id)?;
    let sent = state
        .orchestrator
        .send_command(&id, &input.command)
        .await
        .map_err(|e| ApiError::from_agent(&meta, e))?;
    let owner = user.tenant_id();
    let subject = Subject::Bot { id: &id, owner: &owner };
    audit::record(
        &state.db,
        &meta,
        &user,
        "bot.command",
        subject,
        Some(json!({ "command": sent })),
    )
    .await;
    Ok(Success::ok())
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    user: AuthUser,
    Json(input): Json<BotRef>,
) -> Result<Json<Success>, ApiError> {
    let id = owned_bot(&state, &meta, &user, &input.bot_id)?;
    state
        .orchestrator
        .delete_bot(&id)
        .await
        .map_err(|e| ApiError::from_agent(&meta, e))?;
    bots::Entity::delete_by_id(id.to_string())
        .exec(&*state.db)
        .await
        .map_err(|e| ApiError::db(&meta, e))?;
    let owner = user.tenant_id();
    let subject = Subject::Bot { id: &id, owner: &owner };
    audit::record(&state.db, &meta, &user, "bot.delete", subject, None).await;
    Ok(Success::ok())
}

pub async fn status(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    user: AuthUser,
    Query(q): Query<BotRef>,
) -> Result<Json<StatusResponse>, ApiError> {
    let id = owned_bot(&state, &meta, &user, &q.bot_id)?;
    let st = state
        .orchestrator
        .get_status(&id)
        .map_err(|e| ApiError::from_agent(&meta, e))?;

    Ok(Json(StatusResponse {
        status: st.state,
        start_time: st.started_at.map(|t| t.to_rfc3339()),
        restart_count: st.restart_count,
        error_reason: st.last_exit.as_ref().map(|e| e.message.clone()),
        exit_code: st.last_exit.as_ref().and_then(|e| e.exit_code),
        pid: st.pid,
    }))
}

pub async fn logs(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    user: AuthUser,
    Query(q): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let id = owned_bot(&state, &meta, &user, &q.bot_id)?;
    let entries = state
        .orchestrator
        .get_logs(&id, q.limit)
        .await
        .map_err(|e| ApiError::from_agent(&meta, e))?;

    Ok(Json(LogsResponse {
        logs: entries
            .into_iter()
            .map(|e| (e.timestamp_text(), e.line, e.is_error))
            .collect(),
    }))
}

pub async fn download_logs(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    user: AuthUser,
    Query(q): Query<BotRef>,
) -> Result<Response, ApiError> {
    let id = owned_bot(&state, &meta, &user, &q.bot_id)?;
    let body = state
        .orchestrator
        .download_logs(&id)
        .map_err(|e| ApiError::from_agent(&meta, e))?;

    let disposition = format!("attachment; filename=\"bot_{id}_logs.txt\"");
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

pub async fn resources(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    user: AuthUser,
    Query(q): Query<BotRef>,
) -> Result<Json<ResourcesResponse>, ApiError> {
    let id = owned_bot(&state, &meta, &user, &q.bot_id)?;
    let sample = state
        .orchestrator
        .get_resources(&id)
        .map_err(|e| ApiError::from_agent(&meta, e))?;

    Ok(Json(match sample {
        Some(s) => ResourcesResponse {
            cpu: s.cpu_percent,
            ram: s.memory_mb,
        },
        None => ResourcesResponse { cpu: 0.0, ram: 0 },
    }))
}

pub async fn my_bots(State(state): State<AppState>, user: AuthUser) -> Json<Vec<BotSummary>> {
    Json(
        state
            .orchestrator
            .list_bots(&user.tenant_id())
            .into_iter()
            .map(|b| BotSummary {
                id: b.id.to_string(),
                bot_name: b.name,
                status: b.state,
            })
            .collect(),
    )
}

pub async fn plan_info(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    user: AuthUser,
) -> Result<Json<PlanInfoResponse>, ApiError> {
    let tenant = state
        .orchestrator
        .quota()
        .tenant(&user.tenant_id())
        .await
        .map_err(|e| ApiError::from_agent(&meta, e))?;

    Ok(Json(PlanInfoResponse {
        plan: tenant.plan.as_str().to_string(),
        limits: tenant.plan.limits(),
    }))
}
