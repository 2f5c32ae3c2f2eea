use std::collections::HashMap;

use axum::{Extension, Json, extract::State, http::StatusCode};
use botdock_db::entities::{bots, users};
use botdock_agent::TenantSweep;
use botdock_process::{BotId, BotState, PlanTier, TenantId};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    api::ApiError,
    audit::{self, Subject},
    auth::AdminUser,
    request_meta::RequestMeta,
    state::AppState,
};

fn failed_bots(sweep: &TenantSweep) -> Vec<serde_json::Value> {
    sweep
        .failed
        .iter()
        .map(|(id, err)| json!({ "bot_id": id, "code": err.code(), "error": err.to_string() }))
        .collect()
}

#[derive(Debug, Serialize)]
pub struct AdminUserRow {
    pub id: String,
    pub username: String,
    pub role: String,
    pub plan: String,
    pub suspended: bool,
    pub created_at: String,
    pub bot_count: usize,
    pub running_count: usize,
}

#[derive(Debug, Serialize)]
pub struct AdminBotRow {
    pub id: String,
    pub bot_name: String,
    pub user_id: String,
    pub owner_username: Option<String>,
    pub status: BotState,
    pub running: bool,
    pub restart_count: u32,
    pub start_time: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ForceStopRequest {
    pub bot_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SuspendRequest {
    pub user_id: String,
    #[serde(default = "default_suspend")]
    pub suspend: bool,
}

fn default_suspend() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct UserRef {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub user_id: String,
    pub plan: String,
}

#[derive(Debug, Serialize)]
pub struct SystemStats {
    pub total_users: u64,
    pub total_bots: usize,
    pub running_bots: usize,
}

fn parse_user_id(meta: &RequestMeta, raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ApiError::invalid_param(meta, "invalid user_id"))
}

async fn find_user(
    state: &AppState,
    meta: &RequestMeta,
    id: Uuid,
) -> Result<users::Model, ApiError> {
    users::Entity::find_by_id(id)
        .one(&*state.db)
        .await
        .map_err(|e| ApiError::db(meta, e))?
        .ok_or_else(|| ApiError::not_found(meta, format!("user {id}")))
}

pub async fn users(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    _admin: AdminUser,
) -> Result<Json<Vec<AdminUserRow>>, ApiError> {
    let rows = users::Entity::find()
        .order_by_asc(users::Column::Username)
        .all(&*state.db)
        .await
        .map_err(|e| ApiError::db(&meta, e))?;

    Ok(Json(
        rows.into_iter()
            .map(|u| {
                let owned = state.orchestrator.list_bots(&TenantId(u.id.to_string()));
                AdminUserRow {
                    id: u.id.to_string(),
                    username: u.username,
                    role: u.role,
                    plan: u.plan,
                    suspended: u.suspended,
                    created_at: u.created_at.to_rfc3339(),
                    bot_count: owned.len(),
                    running_count: owned.iter().filter(|b| b.state.is_active()).count(),
                }
            })
            .collect(),
    ))
}

pub async fn bots(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    _admin: AdminUser,
) -> Result<Json<Vec<AdminBotRow>>, ApiError> {
    let names: HashMap<String, String> = users::Entity::find()
        .all(&*state.db)
        .await
        .map_err(|e| ApiError::db(&meta, e))?
        .into_iter()
        .map(|u| (u.id.to_string(), u.username))
        .collect();

    Ok(Json(
        state
            .orchestrator
            .list_all()
            .into_iter()
            .map(|b| AdminBotRow {
                owner_username: names.get(b.owner.as_str()).cloned(),
                id: b.id.to_string(),
                bot_name: b.name,
                user_id: b.owner.to_string(),
                running: b.state == BotState::Running,
                status: b.state,
                restart_count: b.restart_count,
                start_time: b.started_at.map(|t| t.to_rfc3339()),
            })
            .collect(),
    ))
}

pub async fn force_stop(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    AdminUser(admin): AdminUser,
    Json(input): Json<ForceStopRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = BotId::from(input.bot_id.trim());
    let status = state
        .orchestrator
        .force_stop_bot(&id)
        .await
        .map_err(|e| ApiError::from_agent(&meta, e))?;
    audit::record(
        &state.db,
        &meta,
        &admin,
        "admin.bot.force_stop",
        Subject::Bot {
            id: &id,
            owner: &status.owner,
        },
        None,
    )
    .await;
    Ok(Json(json!({ "success": true })))
}

pub async fn suspend_user(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    AdminUser(admin): AdminUser,
    Json(input): Json<SuspendRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = parse_user_id(&meta, &input.user_id)?;
    let row = find_user(&state, &meta, user_id).await?;

    let mut active: users::ActiveModel = row.into();
    active.suspended = Set(input.suspend);
    active
        .update(&*state.db)
        .await
        .map_err(|e| ApiError::db(&meta, e))?;

    // The flag is already stored, so a bot that fails to stop is reported
    // rather than rolling the suspension back.
    let (stopped, failed) = if input.suspend {
        let sweep = state
            .orchestrator
            .stop_tenant_bots(&TenantId(user_id.to_string()), "account suspended")
            .await;
        (sweep.done.len(), failed_bots(&sweep))
    } else {
        (0, Vec::new())
    };

    tracing::info!(
        %user_id,
        suspend = input.suspend,
        stopped,
        failed = failed.len(),
        "user suspension changed"
    );
    audit::record(
        &state.db,
        &meta,
        &admin,
        "admin.user.suspend",
        Subject::Account(user_id),
        Some(json!({
            "suspend": input.suspend,
            "stopped_bots": stopped,
            "failed_bots": failed,
        })),
    )
    .await;
    Ok(Json(json!({
        "success": true,
        "stopped_bots": stopped,
        "failed_bots": failed,
    })))
}

pub async fn delete_user(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    AdminUser(admin): AdminUser,
    Json(input): Json<UserRef>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = parse_user_id(&meta, &input.user_id)?;
    if user_id == admin.user_id {
        return Err(ApiError::invalid_param(
            &meta,
            "cannot delete your own account",
        ));
    }
    find_user(&state, &meta, user_id).await?;

    let sweep = state
        .orchestrator
        .delete_tenant_bots(&TenantId(user_id.to_string()))
        .await;
    let deleted = sweep.done.clone();

    if !sweep.is_complete() {
        // Keep the account and the rows of bots that still exist.
        if !deleted.is_empty() {
            bots::Entity::delete_many()
                .filter(bots::Column::Id.is_in(deleted.iter().map(|id| id.to_string())))
                .exec(&*state.db)
                .await
                .map_err(|e| ApiError::db(&meta, e))?;
        }
        let failed = failed_bots(&sweep);
        tracing::warn!(%user_id, deleted = deleted.len(), failed = failed.len(), "user delete incomplete");
        audit::record(
            &state.db,
            &meta,
            &admin,
            "admin.user.delete_incomplete",
            Subject::Account(user_id),
            Some(json!({ "deleted_bots": deleted, "failed_bots": failed })),
        )
        .await;
        return Err(ApiError::new(
            &meta,
            StatusCode::CONFLICT,
            "bots_remaining",
            format!(
                "{} bot(s) could not be removed; the account was kept",
                sweep.failed.len()
            ),
        ));
    }

    bots::Entity::delete_many()
        .filter(bots::Column::UserId.eq(user_id))
        .exec(&*state.db)
        .await
        .map_err(|e| ApiError::db(&meta, e))?;
    users::Entity::delete_by_id(user_id)
        .exec(&*state.db)
        .await
        .map_err(|e| ApiError::db(&meta, e))?;

    tracing::info!(%user_id, bots = deleted.len(), "user deleted");
    audit::record(
        &state.db,
        &meta,
        &admin,
        "admin.user.delete",
        Subject::Account(user_id),
        Some(json!({ "deleted_bots": deleted })),
    )
    .await;
    Ok(Json(json!({ "success": true, "deleted_bots": deleted.len() })))
}

pub async fn change_plan(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    AdminUser(admin): AdminUser,
    Json(input): Json<ChangePlanRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = parse_user_id(&meta, &input.user_id)?;
    let plan: PlanTier = input
        .plan
        .parse()
        .map_err(|e: String| ApiError::invalid_param(&meta, e))?;
    let row = find_user(&state, &meta, user_id).await?;
    let previous = row.plan.clone();

    let mut active: users::ActiveModel = row.into();
    active.plan = Set(plan.as_str().to_string());
    active
        .update(&*state.db)
        .await
        .map_err(|e| ApiError::db(&meta, e))?;

    audit::record(
        &state.db,
        &meta,
        &admin,
        "admin.user.change_plan",
        Subject::Account(user_id),
        Some(json!({ "from": previous, "to": plan.as_str() })),
    )
    .await;
    Ok(Json(json!({ "success": true, "plan": plan.as_str() })))
}

pub async fn system_stats(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    _admin: AdminUser,
) -> Result<Json<SystemStats>, ApiError> {
    let total_users = users::Entity::find()
        .count(&*state.db)
        .await
        .map_err(|e| ApiError::db(&meta, e))?;
    let counts = state.orchestrator.counts();

    Ok(Json(SystemStats {
        total_users,
        total_bots: counts.total_bots,
        running_bots: counts.running_bots,
    }))
}
