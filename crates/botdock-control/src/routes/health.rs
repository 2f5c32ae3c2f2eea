use axum::{Json, extract::State};
use botdock_agent::SystemCounts;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    database: bool,
    bots: SystemCounts,
}

pub async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    let database = match state.db.ping().await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(%err, "database ping failed");
            false
        }
    };

    Json(HealthzResponse {
        status: if database { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        database,
        bots: state.orchestrator.counts(),
    })
}
