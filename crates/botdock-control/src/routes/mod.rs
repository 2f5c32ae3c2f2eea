use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};

use crate::{auth, security, state::AppState};

pub mod admin;
pub mod bots;
pub mod health;

/// Multipart framing on top of the two payload files.
const UPLOAD_OVERHEAD_BYTES: u64 = 64 * 1024;

pub fn router(state: AppState) -> Router {
    let upload_limit = state
        .orchestrator
        .config()
        .max_upload_bytes
        .saturating_mul(2)
        .saturating_add(UPLOAD_OVERHEAD_BYTES);
    let upload_limit = usize::try_from(upload_limit).unwrap_or(usize::MAX);

    let user_routes = Router::new()
        .route("/bot/create", post(bots::create))
        .route(
            "/upload",
            post(bots::upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/bot/start", post(bots::start))
        .route("/bot/stop", post(bots::stop))
        .route("/bot/restart", post(bots::restart))
        .route("/bot/command", post(bots::command))
        .route("/bot/delete", post(bots::delete))
        .route("/bot/status", get(bots::status))
        .route("/bot/logs", get(bots::logs))
        .route("/bot/logs/download", get(bots::download_logs))
        .route("/bot/resources", get(bots::resources))
        .route("/my/bots", get(bots::my_bots))
        .route("/plan/info", get(bots::plan_info));

    let admin_routes = Router::new()
        .route("/admin/users", get(admin::users))
        .route("/admin/bots", get(admin::bots))
        .route("/admin/bot/force-stop", post(admin::force_stop))
        .route("/admin/user/suspend", post(admin::suspend_user))
        .route("/admin/user/delete", post(admin::delete_user))
        .route("/admin/user/change-plan", post(admin::change_plan))
        .route("/admin/system-stats", get(admin::system_stats));

    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/auth/whoami", get(auth::whoami))
        .merge(user_routes)
        .merge(admin_routes)
        .layer(middleware::from_fn(security::csrf_and_origin))
        .layer(middleware::from_fn(security::request_id))
        .with_state(state)
}
