//! Persisted accounts, bot ownership and the audit trail.

use std::time::Duration;

pub use sea_orm;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};

pub mod entities;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Opens the pool. `BOTDOCK_DB_MAX_CONNECTIONS` overrides the pool size.
/// sqlx statement logging is off.
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, sea_orm::DbErr> {
    let max_connections = std::env::var("BOTDOCK_DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .map(|v| v.clamp(1, 200))
        .unwrap_or(DEFAULT_MAX_CONNECTIONS);

    let mut opts = ConnectOptions::new(database_url.to_string());
    opts.max_connections(max_connections)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(10))
        .acquire_timeout(Duration::from_secs(10))
        .sqlx_logging(false);
    Database::connect(opts).await
}
