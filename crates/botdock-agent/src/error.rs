use botdock_process::BotState;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("cannot {op} a bot in state {state}")]
    InvalidTransition { op: &'static str, state: BotState },

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("process ignored the graceful stop signal")]
    ForceKillRequired,

    #[error("process is gone")]
    ProcessGone,

    #[error("bot is not running")]
    NotRunning,

    #[error("bot is not reading its input")]
    StdinBlocked,

    #[error("bot is active; stop it before deleting")]
    BotActive,

    #[error("another lifecycle transition is in progress")]
    TransitionInProgress,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("tenant lookup failed: {0}")]
    Tenant(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code surfaced to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::Spawn(_) => "spawn_failed",
            Self::ForceKillRequired => "force_kill_required",
            Self::ProcessGone => "process_gone",
            Self::NotRunning => "not_running",
            Self::StdinBlocked => "stdin_blocked",
            Self::BotActive => "bot_active",
            Self::TransitionInProgress => "transition_in_progress",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::Tenant(_) => "tenant_error",
            Self::Io(_) => "io_error",
        }
    }
}
