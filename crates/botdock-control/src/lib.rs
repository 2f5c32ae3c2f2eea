pub mod api;
pub mod audit;
pub mod auth;
pub mod request_meta;
pub mod routes;
pub mod security;
pub mod state;
pub mod tenants;

use std::sync::Arc;

use anyhow::Context;
use botdock_agent::{AgentConfig, Orchestrator};
use botdock_db::entities::bots;
use botdock_process::{BotId, TenantId};
use sea_orm::{DatabaseConnection, EntityTrait};
use sea_orm_migration::MigratorTrait;

pub use routes::router;

use crate::{security::RateLimiter, state::AppState, tenants::DbTenants};

/// Connects, applies migrations (idempotent) and returns the handle.
pub async fn connect_and_migrate(database_url: &str) -> anyhow::Result<DatabaseConnection> {
    let db = botdock_db::connect(database_url)
        .await
        .context("connect to database")?;
    botdock_migration::Migrator::up(&db, None)
        .await
        .context("apply migrations")?;
    Ok(db)
}

/// Builds the shared state and re-registers every persisted bot (all
/// STOPPED). Must run inside a Tokio runtime.
pub async fn build_state(db: DatabaseConnection, config: AgentConfig) -> anyhow::Result<AppState> {
    let db = Arc::new(db);
    let orchestrator = Orchestrator::new(config, Arc::new(DbTenants::new(db.clone())));

    let rows = bots::Entity::find()
        .all(&*db)
        .await
        .context("load persisted bots")?;
    let mut restored = 0usize;
    for row in rows {
        let id = BotId(row.id);
        match orchestrator.restore_bot(id.clone(), TenantId(row.user_id.to_string()), row.bot_name) {
            Ok(_) => restored += 1,
            Err(err) => tracing::warn!(bot_id = %id, %err, "skipping persisted bot"),
        }
    }
    tracing::info!(restored, "bot registry restored");

    Ok(AppState {
        db,
        orchestrator,
        limiter: Arc::new(RateLimiter::from_env()),
    })
}
