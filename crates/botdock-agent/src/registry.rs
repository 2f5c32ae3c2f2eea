use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use botdock_process::{BotId, TenantId};

use crate::{
    error::{Error, Result},
    lifecycle::{BotManager, ManagerContext},
    quota::ActiveCounts,
    workspace,
};

/// Process-wide map of bot id to manager.
///
/// The map lock only guards membership. Per-bot state lives behind each
/// manager's own locks, so a slow transition never blocks lookups. Clones
/// share the same map.
#[derive(Clone, Debug)]
pub struct BotRegistry {
    bots: Arc<RwLock<HashMap<BotId, BotManager>>>,
    admission: Arc<tokio::sync::Mutex<()>>,
    ctx: Arc<ManagerContext>,
}

impl BotRegistry {
    pub fn new(ctx: Arc<ManagerContext>) -> Self {
        Self {
            bots: Arc::new(RwLock::new(HashMap::new())),
            admission: Arc::new(tokio::sync::Mutex::new(())),
            ctx,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<BotId, BotManager>> {
        self.bots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<BotId, BotManager>> {
        self.bots.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Serialises quota check and STARTING mark across all bots.
    pub async fn admission_gate(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.admission.lock().await
    }

    pub fn create(&self, owner: TenantId, name: String) -> Result<BotManager> {
        self.insert(BotId::new(), owner, name)
    }

    /// Registers a bot under a known id (startup restore). The bot starts out
    /// STOPPED regardless of what it was doing before.
    pub fn insert(&self, id: BotId, owner: TenantId, name: String) -> Result<BotManager> {
        let dir = workspace::bot_dir(&self.ctx.config.data_root, &id)?;
        let mut bots = self.write();
        if let Some(existing) = bots.get(&id) {
            return Ok(existing.clone());
        }
        let mgr = BotManager::new(id.clone(), owner, name, dir, self.ctx.clone());
        bots.insert(id, mgr.clone());
        Ok(mgr)
    }

    pub fn get(&self, id: &BotId) -> Result<BotManager> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("bot {id}")))
    }

    pub fn list_by_owner(&self, owner: &TenantId) -> Vec<BotManager> {
        let mut out: Vec<_> = self
            .read()
            .values()
            .filter(|m| m.owner() == owner)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name().cmp(b.name()).then_with(|| a.id().cmp(b.id())));
        out
    }

    pub fn list_all(&self) -> Vec<BotManager> {
        let mut out: Vec<_> = self.read().values().cloned().collect();
        out.sort_by(|a, b| {
            a.owner()
                .cmp(b.owner())
                .then_with(|| a.name().cmp(b.name()))
                .then_with(|| a.id().cmp(b.id()))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn owned_count(&self, owner: &TenantId) -> u32 {
        self.read().values().filter(|m| m.owner() == owner).count() as u32
    }

    pub fn active_counts(&self, owner: &TenantId) -> ActiveCounts {
        let bots = self.read();
        let mut counts = ActiveCounts::default();
        for mgr in bots.values() {
            if mgr.state().is_active() {
                counts.global += 1;
                if mgr.owner() == owner {
                    counts.tenant += 1;
                }
            }
        }
        counts
    }

    /// Removes a bot that holds no process. Waits for any in-flight
    /// transition first so a delete can never race a start.
    pub async fn delete(&self, id: &BotId) -> Result<BotManager> {
        let mgr = self.get(id)?;
        let _guard = mgr.lock_transition().await?;
        if mgr.state().is_active() {
            return Err(Error::BotActive);
        }
        mgr.retire();
        self.write().remove(id);
        Ok(mgr.clone())
    }
}
