use sea_orm::entity::prelude::*;

/// One audited request. `bot_id` and `account_id` name what the request
/// touched; neither is a foreign key, so the trail outlives deleted bots and
/// accounts.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "audit_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub request_id: String,
    pub actor_id: Uuid,
    /// `USER` or `ADMIN` at the time of the request.
    pub actor_role: String,
    pub action: String,
    pub bot_id: Option<String>,
    pub account_id: Option<Uuid>,
    pub details: Option<Json>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
