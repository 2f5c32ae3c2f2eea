use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use botdock_process::{
    BotId, BotState, BotStatus, ExitReason, PlanLimits, ResourceSample, TenantId,
};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    command,
    config::AgentConfig,
    error::{Error, Result},
    log_buffer::{LogBuffer, LogSink, spawn_console_writer},
    quota::{QuotaEnforcer, check_resources},
    registry::BotRegistry,
    sampler::ResourceSampler,
    supervisor::{self, ExitInfo, ProcessHandle, SpawnSpec, Startup},
    workspace::{self, RunInfo},
};

/// Emitted when a running bot exits on its own (crash or clean exit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Exited {
        bot_id: BotId,
        generation: u64,
        clean: bool,
    },
}

/// Shared by every manager in one orchestrator.
#[derive(Debug)]
pub struct ManagerContext {
    pub config: AgentConfig,
    pub events: mpsc::UnboundedSender<LifecycleEvent>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartKind {
    Manual,
    AutoRestart,
}

#[derive(Debug)]
struct ActiveRun {
    generation: u64,
    handle: Arc<ProcessHandle>,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct Snapshot {
    state: BotState,
    started_at: Option<DateTime<Utc>>,
    last_started_at: Option<DateTime<Utc>>,
    restart_count: u32,
    last_exit: Option<ExitReason>,
    run: Option<ActiveRun>,
    generation: u64,
    /// Generation whose exit may still be followed by an automatic restart.
    restart_armed: Option<u64>,
}

#[derive(Debug)]
struct BotInner {
    id: BotId,
    owner: TenantId,
    name: String,
    workspace: PathBuf,
    ctx: Arc<ManagerContext>,
    transition: Arc<tokio::sync::Mutex<()>>,
    retired: AtomicBool,
    snapshot: Mutex<Snapshot>,
    logs: Arc<LogBuffer>,
    sample: Mutex<Option<ResourceSample>>,
    sink: Mutex<LogSink>,
}

struct LaunchFailure {
    error: Error,
    exit_code: Option<i32>,
}

impl From<Error> for LaunchFailure {
    fn from(error: Error) -> Self {
        Self {
            error,
            exit_code: None,
        }
    }
}

/// Owns one bot: its state machine, log buffer, latest sample and the
/// background tasks of the current run.
///
/// Every transition runs under `transition`; readers only take the short
/// `snapshot`/`sample` locks and never wait for a transition to finish.
#[derive(Clone, Debug)]
pub struct BotManager {
    inner: Arc<BotInner>,
}

pub type TransitionGuard = tokio::sync::OwnedMutexGuard<()>;

/// Runs a transition body on its own task, holding `guard` until it ends.
/// A caller that gives up waiting (client disconnect, timeout) does not cut
/// the transition short, so the bot always reaches a settled state.
async fn detached<T, F>(guard: TransitionGuard, body: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let task = tokio::spawn(async move {
        let _guard = guard;
        body.await
    });
    task.await
        .map_err(|err| Error::Io(std::io::Error::other(format!("transition task failed: {err}"))))?
}

fn strictly_after(prev: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match prev {
        Some(p) if now <= p => p + TimeDelta::microseconds(1),
        _ => now,
    }
}

impl BotManager {
    pub fn new(
        id: BotId,
        owner: TenantId,
        name: String,
        workspace: PathBuf,
        ctx: Arc<ManagerContext>,
    ) -> Self {
        let logs = Arc::new(LogBuffer::new(ctx.config.log_max_lines));
        Self {
            inner: Arc::new(BotInner {
                id,
                owner,
                name,
                workspace,
                transition: Arc::new(tokio::sync::Mutex::new(())),
                retired: AtomicBool::new(false),
                snapshot: Mutex::new(Snapshot {
                    state: BotState::Stopped,
                    started_at: None,
                    last_started_at: None,
                    restart_count: 0,
                    last_exit: None,
                    run: None,
                    generation: 0,
                    restart_armed: None,
                }),
                sink: Mutex::new(LogSink::new(logs.clone())),
                logs,
                sample: Mutex::new(None),
                ctx,
            }),
        }
    }

    fn snap(&self) -> MutexGuard<'_, Snapshot> {
        self.inner
            .snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn sample_slot(&self) -> MutexGuard<'_, Option<ResourceSample>> {
        self.inner.sample.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_sink(&self) -> LogSink {
        self.inner
            .sink
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn config(&self) -> &AgentConfig {
        &self.inner.ctx.config
    }

    pub fn id(&self) -> &BotId {
        &self.inner.id
    }

    pub fn owner(&self) -> &TenantId {
        &self.inner.owner
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn workspace(&self) -> &Path {
        &self.inner.workspace
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.inner.logs
    }

    pub fn state(&self) -> BotState {
        self.snap().state
    }

    pub fn generation(&self) -> u64 {
        self.snap().generation
    }

    pub fn restart_count(&self) -> u32 {
        self.snap().restart_count
    }

    pub fn latest_sample(&self) -> Option<ResourceSample> {
        self.sample_slot().clone()
    }

    pub fn status(&self) -> BotStatus {
        let s = self.snap();
        BotStatus {
            id: self.inner.id.clone(),
            owner: self.inner.owner.clone(),
            name: self.inner.name.clone(),
            state: s.state,
            started_at: s.started_at,
            pid: s.run.as_ref().map(|r| r.handle.pid()),
            restart_count: s.restart_count,
            last_exit: s.last_exit.clone(),
        }
    }

    /// Appends an orchestrator note to the bot's log.
    pub fn note(&self, message: impl AsRef<str>) {
        self.current_sink().agent(message);
    }

    pub fn is_retired(&self) -> bool {
        self.inner.retired.load(Ordering::Acquire)
    }

    /// Marks the manager deleted. Transitions queued behind the lock fail
    /// with `NotFound` once they acquire it.
    pub(crate) fn retire(&self) {
        self.inner.retired.store(true, Ordering::Release);
        self.snap().restart_armed = None;
    }

    fn not_found(&self) -> Error {
        Error::NotFound(format!("bot {}", self.inner.id))
    }

    /// Waits for the per-bot transition lock, bounded by `transition_wait`.
    pub async fn lock_transition(&self) -> Result<TransitionGuard> {
        if self.is_retired() {
            return Err(self.not_found());
        }
        let guard = tokio::time::timeout(
            self.config().transition_wait,
            self.inner.transition.clone().lock_owned(),
        )
        .await
        .map_err(|_| Error::TransitionInProgress)?;
        if self.is_retired() {
            return Err(self.not_found());
        }
        Ok(guard)
    }

    pub async fn start(
        &self,
        quota: &QuotaEnforcer,
        registry: &BotRegistry,
        kind: StartKind,
    ) -> Result<BotStatus> {
        let guard = self.lock_transition().await?;
        let (this, quota, registry) = (self.clone(), quota.clone(), registry.clone());
        detached(guard, async move { this.start_locked(&quota, &registry, kind).await }).await
    }

    pub async fn stop(&self, reason: &str) -> Result<BotStatus> {
        let guard = self.lock_transition().await?;
        let (this, reason) = (self.clone(), reason.to_string());
        detached(guard, async move { this.stop_locked(&reason).await }).await
    }

    /// Stop (when active) and start again under one hold of the lock, so no
    /// other transition can slip in between.
    pub async fn restart(&self, quota: &QuotaEnforcer, registry: &BotRegistry) -> Result<BotStatus> {
        let guard = self.lock_transition().await?;
        let (this, quota, registry) = (self.clone(), quota.clone(), registry.clone());
        detached(guard, async move {
            if this.state().is_active() {
                this.stop_locked("restart requested").await?;
            }
            this.start_locked(&quota, &registry, StartKind::Manual).await
        })
        .await
    }

    /// Like `stop`, but a bot that is already inactive is left as is and any
    /// pending automatic restart is cancelled.
    pub async fn force_stop(&self, reason: &str) -> Result<BotStatus> {
        let guard = self.lock_transition().await?;
        let (this, reason) = (self.clone(), reason.to_string());
        detached(guard, async move {
            if this.state().is_active() {
                return this.stop_locked(&reason).await;
            }
            this.snap().restart_armed = None;
            Ok(this.status())
        })
        .await
    }

    /// Restart after an unattended exit. Fires only while the bot is still in
    /// the run that produced the exit event.
    pub async fn auto_restart(
        &self,
        generation: u64,
        quota: &QuotaEnforcer,
        registry: &BotRegistry,
    ) -> Result<BotStatus> {
        let guard = self.lock_transition().await?;
        {
            let mut s = self.snap();
            if s.restart_armed != Some(generation) {
                return Err(Error::InvalidTransition {
                    op: "auto-restart",
                    state: s.state,
                });
            }
            s.restart_armed = None;
        }
        let (this, quota, registry) = (self.clone(), quota.clone(), registry.clone());
        detached(guard, async move {
            this.start_locked(&quota, &registry, StartKind::AutoRestart)
                .await
        })
        .await
    }

    pub async fn send_command(&self, text: &str) -> Result<String> {
        let handle = {
            let s = self.snap();
            if s.state != BotState::Running {
                return Err(Error::NotRunning);
            }
            s.run
                .as_ref()
                .map(|r| r.handle.clone())
                .ok_or(Error::NotRunning)?
        };
        command::deliver(
            &handle,
            &self.current_sink(),
            text,
            self.config().command_max_chars,
            self.config().command_write_timeout,
        )
        .await
    }

    async fn start_locked(
        &self,
        quota: &QuotaEnforcer,
        registry: &BotRegistry,
        kind: StartKind,
    ) -> Result<BotStatus> {
        let limits = {
            let _admission = registry.admission_gate().await;
            let state = self.state();
            if !matches!(state, BotState::Stopped | BotState::Crashed) {
                return Err(Error::InvalidTransition { op: "start", state });
            }
            let limits = quota.ensure_can_start(&self.inner.owner, registry).await?;
            self.mark_starting(kind);
            limits
        };

        match self.launch(&limits).await {
            Ok(()) => Ok(self.status()),
            Err(failure) => {
                tracing::warn!(
                    bot_id = %self.inner.id,
                    error = %failure.error,
                    "bot failed to start"
                );
                let mut s = self.snap();
                s.state = BotState::Stopped;
                s.started_at = None;
                s.run = None;
                s.last_exit = Some(ExitReason {
                    message: failure.error.to_string(),
                    exit_code: failure.exit_code,
                    at: Utc::now(),
                });
                Err(failure.error)
            }
        }
    }

    fn mark_starting(&self, kind: StartKind) {
        {
            let mut s = self.snap();
            s.state = BotState::Starting;
            s.restart_armed = None;
            match kind {
                StartKind::Manual => s.restart_count = 0,
                StartKind::AutoRestart => s.restart_count = s.restart_count.saturating_add(1),
            }
        }
        *self.sample_slot() = None;
        // Auto-restarts keep the crash output visible.
        if kind == StartKind::Manual {
            self.inner.logs.clear();
        }
    }

    async fn launch(&self, limits: &PlanLimits) -> std::result::Result<(), LaunchFailure> {
        let cfg = self.config();
        let dir = &self.inner.workspace;

        let entry = dir.join(&cfg.entry_file);
        if tokio::fs::metadata(&entry).await.is_err() {
            return Err(Error::Spawn(format!("{} not found, upload it first", cfg.entry_file)).into());
        }

        let mut sink = LogSink::new(self.inner.logs.clone());
        if cfg.persist_console_log {
            sink = sink.with_file(spawn_console_writer(
                workspace::console_log_path(dir),
                cfg.log_file_max_bytes,
                cfg.log_file_max_files,
            ));
        }
        let flood = CancellationToken::new();
        let run_sink =
            sink.clone()
                .with_flood_guard(cfg.log_flood_lines, cfg.log_flood_window, flood.clone());
        *self.inner.sink.lock().unwrap_or_else(|e| e.into_inner()) = run_sink.clone();

        supervisor::install_requirements(
            &cfg.installer,
            dir,
            &dir.join(&cfg.requirements_file),
            &sink,
            cfg.install_timeout,
        )
        .await?;

        let spec = SpawnSpec {
            program: cfg.interpreter.clone(),
            args: vec![cfg.entry_file.clone()],
            cwd: dir.clone(),
            env: vec![
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
                ("BOTDOCK_BOT_ID".to_string(), self.inner.id.to_string()),
            ],
            nofile_limit: cfg.nofile_limit,
        };
        run_sink.agent(format!("starting: {} {}", spec.program, spec.args.join(" ")));
        let handle = Arc::new(supervisor::spawn(&spec, &run_sink)?);
        let pid = handle.pid();

        let run = RunInfo {
            bot_id: self.inner.id.to_string(),
            owner: self.inner.owner.to_string(),
            started_at_unix_ms: Utc::now().timestamp_millis().max(0) as u64,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            pid: Some(pid),
            pgid: handle.pgid(),
            exec: spec.program.clone(),
            args: spec.args.clone(),
            cwd: dir.display().to_string(),
        };
        if let Err(err) = workspace::write_run_json(dir, &run).await {
            tracing::warn!(bot_id = %self.inner.id, %err, "failed to write run.json");
        }

        if let Startup::Exited(info) = handle.wait_for_startup(cfg.startup_grace).await {
            run_sink.agent_error(format!("process exited during startup ({})", info.describe()));
            return Err(LaunchFailure {
                error: Error::Spawn(format!("bot exited during startup ({})", info.describe())),
                exit_code: info.code,
            });
        }

        let cancel = CancellationToken::new();
        let generation = {
            let mut s = self.snap();
            s.generation += 1;
            let started = strictly_after(s.last_started_at);
            s.started_at = Some(started);
            s.last_started_at = Some(started);
            s.state = BotState::Running;
            s.run = Some(ActiveRun {
                generation: s.generation,
                handle: handle.clone(),
                cancel: cancel.clone(),
            });
            s.generation
        };

        tracing::info!(bot_id = %self.inner.id, owner = %self.inner.owner, pid, generation, "bot running");
        run_sink.agent(format!("running (pid {pid})"));

        self.spawn_monitor(generation, handle, cancel.clone(), flood);
        self.spawn_sampler(generation, pid, cancel, limits.clone());
        Ok(())
    }

    async fn stop_locked(&self, reason: &str) -> Result<BotStatus> {
        let run = {
            let mut s = self.snap();
            if !matches!(s.state, BotState::Running | BotState::Starting) {
                return Err(Error::InvalidTransition {
                    op: "stop",
                    state: s.state,
                });
            }
            s.state = BotState::Stopping;
            s.restart_armed = None;
            s.run.take()
        };

        let sink = self.current_sink();
        sink.agent(format!("stopping ({reason})"));
        tracing::info!(bot_id = %self.inner.id, reason, "stopping bot");

        let exit = match run {
            Some(run) => {
                run.cancel.cancel();
                Some(self.terminate(&run.handle, &sink).await)
            }
            None => None,
        };

        {
            let mut s = self.snap();
            s.state = BotState::Stopped;
            s.started_at = None;
            s.last_exit = Some(ExitReason {
                message: reason.to_string(),
                exit_code: exit.as_ref().and_then(|e| e.code),
                at: Utc::now(),
            });
        }
        *self.sample_slot() = None;
        sink.agent("stopped");
        Ok(self.status())
    }

    async fn terminate(&self, handle: &ProcessHandle, sink: &LogSink) -> ExitInfo {
        let cfg = self.config();
        match handle.terminate(cfg.stop_grace).await {
            Ok(info) => info,
            Err(_) => {
                sink.agent(format!(
                    "process ignored SIGTERM for {}ms, sending SIGKILL",
                    cfg.stop_grace.as_millis()
                ));
                match handle.force_kill(cfg.kill_wait).await {
                    Ok(info) => info,
                    Err(err) => {
                        tracing::error!(bot_id = %self.inner.id, pid = handle.pid(), %err, "bot process survived SIGKILL");
                        ExitInfo {
                            code: None,
                            signal: None,
                            runtime: Duration::ZERO,
                            error: Some(err.to_string()),
                        }
                    }
                }
            }
        }
    }

    /// Stop requested by a background task of run `generation`. A no-op if
    /// that run is already over.
    async fn stop_run(&self, generation: u64, reason: String) {
        let Ok(_guard) = self.lock_transition().await else {
            return;
        };
        let current = self.snap().run.as_ref().map(|r| r.generation);
        if current != Some(generation) {
            return;
        }
        if let Err(err) = self.stop_locked(&reason).await {
            tracing::warn!(bot_id = %self.inner.id, %err, "automatic stop failed");
        }
    }

    fn request_stop(&self, generation: u64, reason: String) {
        let this = self.clone();
        tokio::spawn(async move { this.stop_run(generation, reason).await });
    }

    fn on_exit(&self, generation: u64, info: ExitInfo) {
        let clean = info.success();
        {
            let mut s = self.snap();
            let current = s.run.as_ref().map(|r| r.generation);
            if current != Some(generation) || s.state != BotState::Running {
                return;
            }
            if let Some(run) = s.run.take() {
                run.cancel.cancel();
            }
            s.state = if clean {
                BotState::Stopped
            } else {
                BotState::Crashed
            };
            s.started_at = None;
            s.last_exit = Some(ExitReason {
                message: if clean {
                    "exited".to_string()
                } else {
                    format!("crashed: {}", info.describe())
                },
                exit_code: info.code,
                at: Utc::now(),
            });
            s.restart_armed = Some(generation);
        }

        let sink = self.current_sink();
        if clean {
            tracing::info!(bot_id = %self.inner.id, generation, "bot exited");
            sink.agent("process exited");
        } else {
            tracing::warn!(bot_id = %self.inner.id, generation, exit = %info.describe(), "bot crashed");
            sink.agent_error(format!("process {}", info.describe()));
        }

        let _ = self.inner.ctx.events.send(LifecycleEvent::Exited {
            bot_id: self.inner.id.clone(),
            generation,
            clean,
        });
    }

    fn spawn_monitor(
        &self,
        generation: u64,
        handle: Arc<ProcessHandle>,
        cancel: CancellationToken,
        flood: CancellationToken,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                info = handle.wait() => {
                    this.on_exit(generation, info);
                    return;
                }
                _ = cancel.cancelled() => return,
                _ = flood.cancelled() => {}
            }

            this.current_sink()
                .agent_error("too many error lines, stopping bot");
            this.stop_run(generation, "log flood".to_string()).await;

            // The stop may have been refused; keep watching for the exit.
            tokio::select! {
                info = handle.wait() => this.on_exit(generation, info),
                _ = cancel.cancelled() => {}
            }
        });
    }

    fn store_sample(&self, generation: u64, sample: ResourceSample) -> bool {
        let s = self.snap();
        if s.run.as_ref().map(|r| r.generation) != Some(generation) {
            return false;
        }
        *self.sample_slot() = Some(sample);
        true
    }

    fn spawn_sampler(
        &self,
        generation: u64,
        pid: u32,
        cancel: CancellationToken,
        limits: PlanLimits,
    ) {
        let this = self.clone();
        let interval = self.config().sample_interval;
        let max_strikes = self.config().violation_strikes.max(1);
        let max_runtime = self
            .config()
            .max_runtime_override
            .unwrap_or_else(|| limits.max_runtime());
        let deadline = tokio::time::Instant::now() + max_runtime;

        tokio::spawn(async move {
            let mut sampler = ResourceSampler::new(pid);
            let mut strikes = 0u32;
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let Ok(sample) = sampler.sample().await else {
                    break;
                };
                if cancel.is_cancelled() || !this.store_sample(generation, sample.clone()) {
                    break;
                }

                match check_resources(&limits, &sample) {
                    Some(violation) => {
                        strikes += 1;
                        if strikes >= max_strikes {
                            this.current_sink().agent_error(violation.to_string());
                            this.request_stop(generation, violation.to_string());
                            break;
                        }
                    }
                    None => strikes = 0,
                }

                if tokio::time::Instant::now() >= deadline {
                    this.current_sink().agent_error(format!(
                        "runtime limit reached ({}s on the {} plan)",
                        max_runtime.as_secs(),
                        limits.name
                    ));
                    this.request_stop(generation, "runtime limit reached".to_string());
                    break;
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_timestamps_strictly_increase() {
        let future = Utc::now() + TimeDelta::seconds(60);
        let next = strictly_after(Some(future));
        assert!(next > future);
        let now = strictly_after(None);
        assert!(strictly_after(Some(now)) > now);
    }

    #[tokio::test]
    async fn new_manager_is_stopped_and_rejects_commands() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(ManagerContext {
            config: AgentConfig::default(),
            events: tx,
        });
        let mgr = BotManager::new(
            BotId::from("b1"),
            TenantId::from("t1"),
            "demo".to_string(),
            PathBuf::from("/tmp/botdock-test-b1"),
            ctx,
        );
        let status = mgr.status();
        assert_eq!(status.state, BotState::Stopped);
        assert!(status.started_at.is_none());
        assert!(status.pid.is_none());
        assert!(matches!(mgr.send_command("ping").await, Err(Error::NotRunning)));
        assert!(mgr.logs().is_empty());
        assert!(matches!(
            mgr.stop("test").await,
            Err(Error::InvalidTransition { op: "stop", .. })
        ));
    }

    #[tokio::test]
    async fn retired_manager_refuses_transitions() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(ManagerContext {
            config: AgentConfig::default(),
            events: tx,
        });
        let mgr = BotManager::new(
            BotId::from("b2"),
            TenantId::from("t1"),
            "demo".to_string(),
            PathBuf::from("/tmp/botdock-test-b2"),
            ctx,
        );
        mgr.retire();
        assert!(matches!(mgr.stop("x").await, Err(Error::NotFound(_))));
    }
}
