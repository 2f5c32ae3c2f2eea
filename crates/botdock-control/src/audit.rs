use botdock_db::entities::audit_events;
use botdock_process::{BotId, TenantId};
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use uuid::Uuid;

use crate::{auth::AuthUser, request_meta::RequestMeta, tenants::role_str};

/// What an audited request acted on.
#[derive(Clone, Copy, Debug)]
pub enum Subject<'a> {
    Bot { id: &'a BotId, owner: &'a TenantId },
    Account(Uuid),
}

impl Subject<'_> {
    fn columns(&self) -> (Option<String>, Option<Uuid>) {
        match self {
            // Owners that are not account ids (static tenants) leave the
            // account column empty.
            Self::Bot { id, owner } => (
                Some(id.to_string()),
                Uuid::parse_str(owner.as_str()).ok(),
            ),
            Self::Account(id) => (None, Some(*id)),
        }
    }
}

/// Best effort: a failed insert is logged and never fails the request.
pub async fn record(
    db: &DatabaseConnection,
    meta: &RequestMeta,
    actor: &AuthUser,
    action: &str,
    subject: Subject<'_>,
    details: Option<serde_json::Value>,
) {
    let (bot_id, account_id) = subject.columns();
    let model = audit_events::ActiveModel {
        id: Set(Uuid::new_v4()),
        request_id: Set(meta.request_id.clone()),
        actor_id: Set(actor.user_id),
        actor_role: Set(role_str(actor.role).to_string()),
        action: Set(action.to_string()),
        bot_id: Set(bot_id),
        account_id: Set(account_id),
        details: Set(details),
        created_at: Set(chrono::Utc::now().into()),
    };

    if let Err(err) = model.insert(db).await {
        tracing::warn!(%err, action, request_id = %meta.request_id, "failed to write audit event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_subject_fills_both_columns() {
        let owner = Uuid::new_v4();
        let id = BotId::from("b1");
        let tenant = TenantId(owner.to_string());
        let (bot, account) = Subject::Bot { id: &id, owner: &tenant }.columns();
        assert_eq!(bot.as_deref(), Some("b1"));
        assert_eq!(account, Some(owner));

        let odd = TenantId::from("t1");
        let (_, account) = Subject::Bot { id: &id, owner: &odd }.columns();
        assert_eq!(account, None);

        assert_eq!(Subject::Account(owner).columns(), (None, Some(owner)));
    }
}
