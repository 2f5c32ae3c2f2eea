use std::sync::Arc;

use botdock_agent::Orchestrator;
use botdock_db::sea_orm::DatabaseConnection;

use crate::security::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub orchestrator: Orchestrator,
    /// Applies to lifecycle routes (start/stop/restart).
    pub limiter: Arc<RateLimiter>,
}
