use std::{fmt, sync::Arc};

use botdock_process::{PlanLimits, ResourceSample, Tenant, TenantId};

use crate::{
    error::{Error, Result},
    registry::BotRegistry,
    tenants::TenantDirectory,
};

/// Active (STARTING/RUNNING/STOPPING) bots, for one tenant and process-wide.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActiveCounts {
    pub tenant: u32,
    pub global: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResourceViolation {
    Cpu { used: f64, limit: f64 },
    Memory { used_mb: u64, limit_mb: u64 },
}

impl fmt::Display for ResourceViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu { used, limit } => {
                write!(f, "CPU usage {used:.1}% exceeds limit ({limit:.0}%)")
            }
            Self::Memory { used_mb, limit_mb } => {
                write!(f, "memory usage {used_mb}MB exceeds limit ({limit_mb}MB)")
            }
        }
    }
}

/// Admission decision for one start. Pure so it can be tested without a
/// registry.
pub fn evaluate_start(tenant: &Tenant, counts: ActiveCounts, global_max_running: u32) -> Result<()> {
    if tenant.suspended {
        return Err(Error::QuotaExceeded(format!(
            "account {} is suspended",
            tenant.username
        )));
    }
    let limits = tenant.plan.limits();
    if counts.tenant >= limits.max_running {
        return Err(Error::QuotaExceeded(format!(
            "{} plan allows {} running bot(s)",
            limits.name, limits.max_running
        )));
    }
    if counts.global >= global_max_running {
        return Err(Error::QuotaExceeded(
            "server is at capacity, try again later".to_string(),
        ));
    }
    Ok(())
}

pub fn check_resources(limits: &PlanLimits, sample: &ResourceSample) -> Option<ResourceViolation> {
    if sample.cpu_percent > limits.max_cpu_percent {
        return Some(ResourceViolation::Cpu {
            used: sample.cpu_percent,
            limit: limits.max_cpu_percent,
        });
    }
    if sample.memory_mb > limits.max_ram_mb {
        return Some(ResourceViolation::Memory {
            used_mb: sample.memory_mb,
            limit_mb: limits.max_ram_mb,
        });
    }
    None
}

/// Applies plan ceilings. Holds no state of its own: tenant facts come from
/// the directory and live counts from the registry.
#[derive(Clone)]
pub struct QuotaEnforcer {
    tenants: Arc<dyn TenantDirectory>,
    global_max_running: u32,
}

impl QuotaEnforcer {
    pub fn new(tenants: Arc<dyn TenantDirectory>, global_max_running: u32) -> Self {
        Self {
            tenants,
            global_max_running,
        }
    }

    pub fn global_max_running(&self) -> u32 {
        self.global_max_running
    }

    pub async fn tenant(&self, owner: &TenantId) -> Result<Tenant> {
        self.tenants.tenant(owner).await
    }

    pub async fn limits_for(&self, owner: &TenantId) -> Result<PlanLimits> {
        Ok(self.tenant(owner).await?.plan.limits())
    }

    /// Callers must hold the registry's admission gate until the bot they
    /// admit is marked STARTING, or two starts can both pass.
    pub async fn ensure_can_start(
        &self,
        owner: &TenantId,
        registry: &BotRegistry,
    ) -> Result<PlanLimits> {
        let tenant = self.tenants.tenant(owner).await?;
        evaluate_start(&tenant, registry.active_counts(owner), self.global_max_running)?;
        Ok(tenant.plan.limits())
    }

    pub async fn can_start(&self, owner: &TenantId, registry: &BotRegistry) -> Result<bool> {
        match self.ensure_can_start(owner, registry).await {
            Ok(_) => Ok(true),
            Err(Error::QuotaExceeded(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn ensure_can_create(&self, owner: &TenantId, owned: u32) -> Result<PlanLimits> {
        let tenant = self.tenants.tenant(owner).await?;
        if tenant.suspended {
            return Err(Error::QuotaExceeded(format!(
                "account {} is suspended",
                tenant.username
            )));
        }
        let limits = tenant.plan.limits();
        if owned >= limits.max_bots {
            return Err(Error::QuotaExceeded(format!(
                "{} plan allows {} bot(s)",
                limits.name, limits.max_bots
            )));
        }
        Ok(limits)
    }

    pub async fn can_create(&self, owner: &TenantId, owned: u32) -> Result<bool> {
        match self.ensure_can_create(owner, owned).await {
            Ok(_) => Ok(true),
            Err(Error::QuotaExceeded(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use botdock_process::{PlanTier, TenantRole};
    use chrono::Utc;

    use super::*;
    use crate::tenants::StaticTenants;

    fn tenant(plan: PlanTier, suspended: bool) -> Tenant {
        Tenant {
            id: TenantId::from("t1"),
            username: "alice".to_string(),
            role: TenantRole::User,
            plan,
            suspended,
        }
    }

    #[test]
    fn free_tenant_gets_one_slot() {
        let t = tenant(PlanTier::Free, false);
        assert!(evaluate_start(&t, ActiveCounts { tenant: 0, global: 0 }, 50).is_ok());
        let err = evaluate_start(&t, ActiveCounts { tenant: 1, global: 1 }, 50).unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));
        assert!(err.to_string().contains("1 running"));
    }

    #[test]
    fn suspension_blocks_even_with_free_slots() {
        let t = tenant(PlanTier::Ultra, true);
        let err = evaluate_start(&t, ActiveCounts::default(), 50).unwrap_err();
        assert!(err.to_string().contains("suspended"));
    }

    #[test]
    fn global_ceiling_applies_across_tenants() {
        let t = tenant(PlanTier::Pro, false);
        assert!(evaluate_start(&t, ActiveCounts { tenant: 0, global: 49 }, 50).is_ok());
        assert!(evaluate_start(&t, ActiveCounts { tenant: 0, global: 50 }, 50).is_err());
    }

    #[test]
    fn resource_violations_name_the_ceiling() {
        let limits = PlanTier::Free.limits();
        let ok = ResourceSample {
            cpu_percent: 10.0,
            memory_mb: 50,
            sampled_at: Utc::now(),
        };
        assert_eq!(check_resources(&limits, &ok), None);

        let hot = ResourceSample {
            cpu_percent: 75.5,
            ..ok.clone()
        };
        let v = check_resources(&limits, &hot).unwrap();
        assert_eq!(v.to_string(), "CPU usage 75.5% exceeds limit (50%)");

        let fat = ResourceSample {
            memory_mb: 300,
            ..ok
        };
        let v = check_resources(&limits, &fat).unwrap();
        assert_eq!(v.to_string(), "memory usage 300MB exceeds limit (200MB)");
    }

    #[tokio::test]
    async fn create_respects_max_bots() {
        let dir = Arc::new(StaticTenants::new());
        dir.insert(tenant(PlanTier::Free, false));
        let quota = QuotaEnforcer::new(dir, 50);
        let id = TenantId::from("t1");
        assert!(quota.can_create(&id, 2).await.unwrap());
        assert!(!quota.can_create(&id, 3).await.unwrap());
        assert!(matches!(
            quota.can_create(&TenantId::from("ghost"), 0).await,
            Err(Error::NotFound(_))
        ));
    }
}
