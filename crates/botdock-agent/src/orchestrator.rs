use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use botdock_process::{BotId, BotStatus, LogEntry, PlanLimits, ResourceSample, TenantId};
use tokio::{sync::mpsc, task::JoinSet};

use crate::{
    config::AgentConfig,
    error::{Error, Result},
    lifecycle::{BotManager, LifecycleEvent, ManagerContext, StartKind},
    quota::QuotaEnforcer,
    registry::BotRegistry,
    tenants::TenantDirectory,
    workspace,
};

const MAX_BOT_NAME_CHARS: usize = 64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct SystemCounts {
    pub total_bots: usize,
    pub running_bots: usize,
}

/// Result of applying one operation to all of a tenant's bots.
#[derive(Debug, Default)]
pub struct TenantSweep {
    pub done: Vec<BotId>,
    pub failed: Vec<(BotId, Error)>,
}

impl TenantSweep {
    async fn collect(mut tasks: JoinSet<(BotId, Result<()>)>) -> Self {
        let mut sweep = Self::default();
        while let Some(joined) = tasks.join_next().await {
            let Ok((id, res)) = joined else {
                tracing::error!("tenant sweep task panicked");
                continue;
            };
            match res {
                Ok(()) => sweep.done.push(id),
                Err(err) => {
                    tracing::warn!(bot_id = %id, %err, "tenant sweep failed for bot");
                    sweep.failed.push((id, err));
                }
            }
        }
        sweep.done.sort();
        sweep.failed.sort_by(|a, b| a.0.cmp(&b.0));
        sweep
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct OrchestratorInner {
    ctx: Arc<ManagerContext>,
    registry: BotRegistry,
    quota: QuotaEnforcer,
    shutting_down: AtomicBool,
}

/// Entry point for every bot operation. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    /// Must be called inside a Tokio runtime: the auto-restart worker is
    /// spawned here.
    pub fn new(config: AgentConfig, tenants: Arc<dyn TenantDirectory>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let quota = QuotaEnforcer::new(tenants, config.global_max_running);
        let ctx = Arc::new(ManagerContext {
            config,
            events: events_tx,
        });
        let inner = Arc::new(OrchestratorInner {
            registry: BotRegistry::new(ctx.clone()),
            ctx,
            quota,
            shutting_down: AtomicBool::new(false),
        });
        tokio::spawn(restart_worker(Arc::downgrade(&inner), events_rx));
        Self { inner }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.ctx.config
    }

    pub fn registry(&self) -> &BotRegistry {
        &self.inner.registry
    }

    pub fn quota(&self) -> &QuotaEnforcer {
        &self.inner.quota
    }

    fn bot(&self, id: &BotId) -> Result<BotManager> {
        self.inner.registry.get(id)
    }

    /// Resolves `id` only if `owner` owns it. Foreign bots look missing.
    pub fn authorize(&self, id: &BotId, owner: &TenantId) -> Result<BotStatus> {
        let mgr = self.bot(id)?;
        if mgr.owner() != owner {
            return Err(Error::NotFound(format!("bot {id}")));
        }
        Ok(mgr.status())
    }

    pub async fn create_bot(&self, owner: &TenantId, name: &str) -> Result<BotStatus> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidPayload("bot name is required".to_string()));
        }
        if name.chars().count() > MAX_BOT_NAME_CHARS {
            return Err(Error::InvalidPayload(format!(
                "bot name is longer than {MAX_BOT_NAME_CHARS} characters"
            )));
        }

        let registry = &self.inner.registry;
        let mgr = {
            let _admission = registry.admission_gate().await;
            self.inner
                .quota
                .ensure_can_create(owner, registry.owned_count(owner))
                .await?;
            registry.create(owner.clone(), name.to_string())?
        };
        workspace::ensure_dir(mgr.workspace()).await?;
        tracing::info!(bot_id = %mgr.id(), %owner, name, "bot created");
        Ok(mgr.status())
    }

    /// Re-registers a persisted bot after a restart of the orchestrator.
    pub fn restore_bot(&self, id: BotId, owner: TenantId, name: String) -> Result<BotStatus> {
        Ok(self.inner.registry.insert(id, owner, name)?.status())
    }

    /// Replaces the bot's entry file and/or requirements file.
    pub async fn upload_payload(
        &self,
        id: &BotId,
        bot_file: Option<&[u8]>,
        requirements: Option<&[u8]>,
    ) -> Result<()> {
        if bot_file.is_none() && requirements.is_none() {
            return Err(Error::InvalidPayload("no files uploaded".to_string()));
        }
        let cfg = self.config();
        let max = cfg.max_upload_bytes;
        for (name, data) in [
            (cfg.entry_file.as_str(), bot_file),
            (cfg.requirements_file.as_str(), requirements),
        ] {
            if let Some(data) = data
                && data.len() as u64 > max
            {
                return Err(Error::InvalidPayload(format!(
                    "{name} is larger than {max} bytes"
                )));
            }
        }

        let mgr = self.bot(id)?;
        if let Some(data) = bot_file {
            workspace::write_file_atomic(mgr.workspace(), &cfg.entry_file, data).await?;
        }
        if let Some(data) = requirements {
            workspace::write_file_atomic(mgr.workspace(), &cfg.requirements_file, data).await?;
        }
        mgr.note("payload updated");
        tracing::info!(
            bot_id = %id,
            bot_file = bot_file.is_some(),
            requirements = requirements.is_some(),
            "payload uploaded"
        );
        Ok(())
    }

    pub async fn start_bot(&self, id: &BotId) -> Result<BotStatus> {
        let mgr = self.bot(id)?;
        mgr.start(&self.inner.quota, &self.inner.registry, StartKind::Manual)
            .await
    }

    pub async fn stop_bot(&self, id: &BotId) -> Result<BotStatus> {
        self.bot(id)?.stop("stopped by user").await
    }

    pub async fn restart_bot(&self, id: &BotId) -> Result<BotStatus> {
        self.bot(id)?
            .restart(&self.inner.quota, &self.inner.registry)
            .await
    }

    pub async fn send_command(&self, id: &BotId, text: &str) -> Result<String> {
        self.bot(id)?.send_command(text).await
    }

    pub fn get_status(&self, id: &BotId) -> Result<BotStatus> {
        Ok(self.bot(id)?.status())
    }

    /// Most recent log lines, capped by the owner's plan.
    pub async fn get_logs(&self, id: &BotId, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        let mgr = self.bot(id)?;
        let plan_cap = self.inner.quota.limits_for(mgr.owner()).await?.max_log_lines;
        let n = limit.map_or(plan_cap, |l| l.min(plan_cap));
        Ok(mgr.logs().tail(n))
    }

    /// Full retained history rendered one entry per line.
    pub fn download_logs(&self, id: &BotId) -> Result<String> {
        let entries = self.bot(id)?.logs().all();
        let mut out = String::new();
        for entry in &entries {
            out.push_str(&entry.render());
            out.push('\n');
        }
        Ok(out)
    }

    pub fn get_resources(&self, id: &BotId) -> Result<Option<ResourceSample>> {
        Ok(self.bot(id)?.latest_sample())
    }

    pub fn list_bots(&self, owner: &TenantId) -> Vec<BotStatus> {
        self.inner
            .registry
            .list_by_owner(owner)
            .iter()
            .map(BotManager::status)
            .collect()
    }

    pub fn list_all(&self) -> Vec<BotStatus> {
        self.inner
            .registry
            .list_all()
            .iter()
            .map(BotManager::status)
            .collect()
    }

    /// Deletes an inactive bot and its workspace.
    pub async fn delete_bot(&self, id: &BotId) -> Result<()> {
        let mgr = self.inner.registry.delete(id).await?;
        workspace::remove_dir(mgr.workspace()).await?;
        tracing::info!(bot_id = %id, owner = %mgr.owner(), "bot deleted");
        Ok(())
    }

    /// Stops the bot if it is active. Idempotent.
    pub async fn force_stop_bot(&self, id: &BotId) -> Result<BotStatus> {
        self.bot(id)?.force_stop("force-stopped by admin").await
    }

    /// Stops every active bot of `owner`. One bot failing to stop does not
    /// keep the others running; failures are logged and reported.
    pub async fn stop_tenant_bots(&self, owner: &TenantId, reason: &str) -> TenantSweep {
        let mut tasks = JoinSet::new();
        for mgr in self.inner.registry.list_by_owner(owner) {
            if !mgr.state().is_active() {
                continue;
            }
            let reason = reason.to_string();
            tasks.spawn(async move {
                let res = mgr.force_stop(&reason).await.map(|_| ());
                (mgr.id().clone(), res)
            });
        }
        let sweep = TenantSweep::collect(tasks).await;
        if !sweep.failed.is_empty() {
            tracing::warn!(%owner, failed = sweep.failed.len(), "some bots could not be stopped");
        }
        sweep
    }

    /// Stops and deletes every bot of `owner`, workspaces included. Bots that
    /// fail are left registered and reported.
    pub async fn delete_tenant_bots(&self, owner: &TenantId) -> TenantSweep {
        let mut tasks = JoinSet::new();
        for mgr in self.inner.registry.list_by_owner(owner) {
            let this = self.clone();
            tasks.spawn(async move {
                let id = mgr.id().clone();
                let res = match mgr.force_stop("account deleted").await {
                    Ok(_) => this.delete_bot(&id).await,
                    Err(err) => Err(err),
                };
                (id, res)
            });
        }
        let sweep = TenantSweep::collect(tasks).await;
        if !sweep.failed.is_empty() {
            tracing::warn!(%owner, failed = sweep.failed.len(), "some bots could not be deleted");
        }
        sweep
    }

    pub async fn plan_limits(&self, owner: &TenantId) -> Result<PlanLimits> {
        self.inner.quota.limits_for(owner).await
    }

    pub fn counts(&self) -> SystemCounts {
        let bots = self.inner.registry.list_all();
        SystemCounts {
            total_bots: bots.len(),
            running_bots: bots.iter().filter(|m| m.state().is_active()).count(),
        }
    }

    /// Stops every active bot and disables auto-restart.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);

        let mut tasks = JoinSet::new();
        for mgr in self.inner.registry.list_all() {
            if !mgr.state().is_active() {
                continue;
            }
            tasks.spawn(async move {
                if let Err(err) = mgr.force_stop("orchestrator shutting down").await {
                    tracing::warn!(bot_id = %mgr.id(), %err, "stop during shutdown failed");
                }
            });
        }
        let n = tasks.len();
        while tasks.join_next().await.is_some() {}
        tracing::info!(stopped = n, "orchestrator shut down");
    }
}

async fn restart_worker(
    inner: Weak<OrchestratorInner>,
    mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
) {
    while let Some(event) = events.recv().await {
        let LifecycleEvent::Exited {
            bot_id,
            generation,
            clean,
        } = event;

        let Some(strong) = inner.upgrade() else {
            break;
        };
        let restart = strong.ctx.config.restart;
        if strong.shutting_down.load(Ordering::Acquire) || !restart.policy.should_restart(clean) {
            continue;
        }
        let Ok(mgr) = strong.registry.get(&bot_id) else {
            continue;
        };
        let limits = match strong.quota.limits_for(mgr.owner()).await {
            Ok(l) => l,
            Err(err) => {
                tracing::warn!(bot_id = %bot_id, %err, "auto-restart skipped: tenant lookup failed");
                continue;
            }
        };
        drop(strong);

        let done = mgr.restart_count();
        if done >= limits.max_restarts {
            mgr.note(format!(
                "restart limit reached ({} on the {} plan), not restarting",
                limits.max_restarts, limits.name
            ));
            tracing::info!(bot_id = %bot_id, restarts = done, "auto-restart limit reached");
            continue;
        }

        let delay = restart.backoff(done + 1);
        mgr.note(format!(
            "restarting in {}ms (attempt {}/{})",
            delay.as_millis(),
            done + 1,
            limits.max_restarts
        ));

        let inner = inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(strong) = inner.upgrade() else {
                return;
            };
            if strong.shutting_down.load(Ordering::Acquire) {
                return;
            }
            match mgr
                .auto_restart(generation, &strong.quota, &strong.registry)
                .await
            {
                Ok(status) => {
                    tracing::info!(bot_id = %bot_id, restarts = status.restart_count, "bot auto-restarted");
                }
                Err(Error::InvalidTransition { .. }) | Err(Error::NotFound(_)) => {}
                Err(err) => {
                    mgr.note(format!("auto-restart failed: {err}"));
                    tracing::warn!(bot_id = %bot_id, %err, "auto-restart failed");
                }
            }
        });
    }
}
