use std::sync::Arc;

use botdock_agent::{Error, TenantDirectory};
use botdock_db::entities::users;
use botdock_process::{PlanTier, Tenant, TenantId, TenantRole};
use sea_orm::{ActiveModelTrait, DatabaseConnection, DbErr, EntityTrait, Set};
use uuid::Uuid;

use crate::auth::AuthUser;

pub fn role_str(role: TenantRole) -> &'static str {
    match role {
        TenantRole::User => "USER",
        TenantRole::Admin => "ADMIN",
    }
}

pub fn parse_role(raw: &str) -> TenantRole {
    if raw.trim().eq_ignore_ascii_case("ADMIN") {
        TenantRole::Admin
    } else {
        TenantRole::User
    }
}

/// Unknown plan strings fall back to FREE.
pub fn tenant_from_row(row: &users::Model) -> Tenant {
    Tenant {
        id: TenantId(row.id.to_string()),
        username: row.username.clone(),
        role: parse_role(&row.role),
        plan: row.plan.parse().unwrap_or(PlanTier::Free),
        suspended: row.suspended,
    }
}

pub async fn load_user(db: &DatabaseConnection, id: Uuid) -> Result<Option<users::Model>, DbErr> {
    users::Entity::find_by_id(id).one(db).await
}

/// Inserts the tenant row for a caller seen for the first time (FREE plan)
/// and keeps username and role in step with the token afterwards.
pub async fn ensure_user(db: &DatabaseConnection, user: &AuthUser) -> Result<users::Model, DbErr> {
    let role = role_str(user.role);
    match load_user(db, user.user_id).await? {
        Some(row) if row.username == user.username && row.role == role => Ok(row),
        Some(row) => {
            let mut active: users::ActiveModel = row.into();
            active.username = Set(user.username.clone());
            active.role = Set(role.to_string());
            active.update(db).await
        }
        None => {
            let model = users::ActiveModel {
                id: Set(user.user_id),
                username: Set(user.username.clone()),
                role: Set(role.to_string()),
                plan: Set(PlanTier::Free.as_str().to_string()),
                suspended: Set(false),
                created_at: Set(chrono::Utc::now().into()),
            };
            let row = model.insert(db).await?;
            tracing::info!(user_id = %row.id, username = %row.username, "tenant provisioned");
            Ok(row)
        }
    }
}

/// Tenant directory backed by the `users` table.
#[derive(Clone)]
pub struct DbTenants {
    db: Arc<DatabaseConnection>,
}

impl DbTenants {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl TenantDirectory for DbTenants {
    async fn tenant(&self, id: &TenantId) -> botdock_agent::Result<Tenant> {
        let uuid =
            Uuid::parse_str(id.as_str()).map_err(|_| Error::NotFound(format!("tenant {id}")))?;
        let row = load_user(&self.db, uuid)
            .await
            .map_err(|e| Error::Tenant(e.to_string()))?
            .ok_or_else(|| Error::NotFound(format!("tenant {id}")))?;
        Ok(tenant_from_row(&row))
    }
}
