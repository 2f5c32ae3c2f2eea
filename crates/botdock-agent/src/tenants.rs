use std::{collections::HashMap, sync::RwLock};

use botdock_process::{PlanTier, Tenant, TenantId};

use crate::error::{Error, Result};

/// Read-only view of tenant accounts. The orchestrator never creates or
/// mutates tenants; it only asks for plan and suspension state.
#[async_trait::async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn tenant(&self, id: &TenantId) -> Result<Tenant>;
}

/// In-memory directory for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticTenants {
    tenants: RwLock<HashMap<TenantId, Tenant>>,
}

impl StaticTenants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant: Tenant) {
        self.tenants
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tenant.id.clone(), tenant);
    }

    pub fn set_plan(&self, id: &TenantId, plan: PlanTier) {
        if let Some(t) = self
            .tenants
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(id)
        {
            t.plan = plan;
        }
    }

    pub fn set_suspended(&self, id: &TenantId, suspended: bool) {
        if let Some(t) = self
            .tenants
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(id)
        {
            t.suspended = suspended;
        }
    }

    pub fn remove(&self, id: &TenantId) {
        self.tenants
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

#[async_trait::async_trait]
impl TenantDirectory for StaticTenants {
    async fn tenant(&self, id: &TenantId) -> Result<Tenant> {
        self.tenants
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("tenant {id}")))
    }
}
