use std::{path::PathBuf, time::Duration};

const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 1024 * 1024;

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string())
}

fn env_ms(name: &str, min: u64, max: u64, default: u64) -> Duration {
    Duration::from_millis(env_u64(name).map(|v| v.clamp(min, max)).unwrap_or(default))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartPolicy {
    Off,
    Always,
    OnFailure,
}

impl RestartPolicy {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "always" => Self::Always,
            "on-failure" | "on_failure" | "onfailure" => Self::OnFailure,
            _ => Self::Off,
        }
    }

    pub fn should_restart(self, clean_exit: bool) -> bool {
        match self {
            Self::Off => false,
            Self::Always => true,
            Self::OnFailure => !clean_exit,
        }
    }
}

/// Auto-restart settings. The retry ceiling comes from the tenant's plan.
#[derive(Clone, Copy, Debug)]
pub struct RestartConfig {
    pub policy: RestartPolicy,
    pub backoff_ms: u64,
    pub backoff_max_ms: u64,
}

impl RestartConfig {
    /// `attempt` is 1-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let pow = attempt.saturating_sub(1).min(30);
        let mult = 1u64.checked_shl(pow).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_ms.saturating_mul(mult).min(self.backoff_max_ms))
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::Off,
            backoff_ms: 2000,
            backoff_max_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Root for per-bot workspaces (`<data_root>/bots/<bot_id>`).
    pub data_root: PathBuf,
    pub interpreter: String,
    pub entry_file: String,
    pub requirements_file: String,
    /// Dependency installer argv; the requirements path is appended. Empty disables.
    pub installer: Vec<String>,
    pub install_timeout: Duration,
    pub max_upload_bytes: u64,

    pub log_max_lines: usize,
    pub persist_console_log: bool,
    pub log_file_max_bytes: u64,
    pub log_file_max_files: usize,
    pub log_flood_lines: usize,
    pub log_flood_window: Duration,

    pub stop_grace: Duration,
    pub kill_wait: Duration,
    pub startup_grace: Duration,
    pub transition_wait: Duration,

    pub sample_interval: Duration,
    pub violation_strikes: u32,
    pub global_max_running: u32,
    pub nofile_limit: u64,
    pub command_max_chars: usize,
    /// Upper bound on one stdin write. A bot that stops reading loses its
    /// stdin pipe when this expires.
    pub command_write_timeout: Duration,
    /// Replaces the plan's runtime ceiling when set.
    pub max_runtime_override: Option<Duration>,
    pub restart: RestartConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            interpreter: "python3".to_string(),
            entry_file: "bot.py".to_string(),
            requirements_file: "requirements.txt".to_string(),
            installer: vec!["pip".to_string(), "install".to_string(), "-r".to_string()],
            install_timeout: Duration::from_secs(300),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            persist_console_log: true,
            log_file_max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            log_file_max_files: DEFAULT_LOG_FILE_MAX_FILES,
            log_flood_lines: 100,
            log_flood_window: Duration::from_secs(60),
            stop_grace: Duration::from_secs(5),
            kill_wait: Duration::from_secs(5),
            startup_grace: Duration::from_secs(3),
            transition_wait: Duration::from_secs(30),
            sample_interval: Duration::from_secs(2),
            violation_strikes: 3,
            global_max_running: 50,
            nofile_limit: 0,
            command_max_chars: 200,
            command_write_timeout: Duration::from_secs(5),
            max_runtime_override: None,
            restart: RestartConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Defaults overridden by `BOTDOCK_*` environment variables. Out-of-range
    /// values are clamped rather than rejected.
    pub fn from_env() -> Self {
        let d = Self::default();

        let installer = match env_string("BOTDOCK_INSTALLER") {
            Some(raw) => raw.split_whitespace().map(str::to_string).collect(),
            None => d.installer.clone(),
        };

        let backoff_ms = env_u64("BOTDOCK_RESTART_BACKOFF_MS")
            .map(|v| v.clamp(100, 10 * 60 * 1000))
            .unwrap_or(d.restart.backoff_ms);
        let backoff_max_ms = env_u64("BOTDOCK_RESTART_BACKOFF_MAX_MS")
            .map(|v| v.clamp(backoff_ms, 60 * 60 * 1000))
            .unwrap_or(d.restart.backoff_max_ms.max(backoff_ms));

        Self {
            data_root: env_string("BOTDOCK_DATA_ROOT")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or(d.data_root),
            interpreter: env_string("BOTDOCK_INTERPRETER")
                .filter(|v| !v.is_empty())
                .unwrap_or(d.interpreter),
            entry_file: env_string("BOTDOCK_ENTRY_FILE")
                .filter(|v| !v.is_empty())
                .unwrap_or(d.entry_file),
            requirements_file: d.requirements_file,
            installer,
            install_timeout: env_ms("BOTDOCK_INSTALL_TIMEOUT_MS", 5_000, 60 * 60 * 1000, 300_000),
            max_upload_bytes: env_u64("BOTDOCK_MAX_UPLOAD_BYTES")
                .map(|v| v.clamp(1024, 64 * 1024 * 1024))
                .unwrap_or(d.max_upload_bytes),
            log_max_lines: env_usize("BOTDOCK_LOG_MAX_LINES")
                .map(|v| v.clamp(100, 50_000))
                .unwrap_or(d.log_max_lines),
            persist_console_log: env_string("BOTDOCK_PERSIST_CONSOLE_LOG")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
                .unwrap_or(d.persist_console_log),
            log_file_max_bytes: env_u64("BOTDOCK_LOG_FILE_MAX_BYTES")
                .map(|v| v.clamp(256 * 1024, 1024 * 1024 * 1024))
                .unwrap_or(d.log_file_max_bytes),
            log_file_max_files: env_usize("BOTDOCK_LOG_FILE_MAX_FILES")
                .map(|v| v.clamp(1, 20))
                .unwrap_or(d.log_file_max_files),
            log_flood_lines: env_usize("BOTDOCK_LOG_FLOOD_LINES")
                .map(|v| v.clamp(10, 100_000))
                .unwrap_or(d.log_flood_lines),
            log_flood_window: Duration::from_secs(
                env_u64("BOTDOCK_LOG_FLOOD_WINDOW_SEC")
                    .map(|v| v.clamp(1, 3600))
                    .unwrap_or(60),
            ),
            stop_grace: env_ms("BOTDOCK_STOP_GRACE_MS", 100, 120_000, 5000),
            kill_wait: env_ms("BOTDOCK_KILL_WAIT_MS", 100, 60_000, 5000),
            startup_grace: env_ms("BOTDOCK_STARTUP_GRACE_MS", 0, 60_000, 3000),
            transition_wait: env_ms("BOTDOCK_TRANSITION_WAIT_MS", 1000, 10 * 60 * 1000, 30_000),
            sample_interval: env_ms("BOTDOCK_RESOURCE_SAMPLE_INTERVAL_MS", 250, 60_000, 2000),
            violation_strikes: env_u64("BOTDOCK_VIOLATION_STRIKES")
                .map(|v| v.clamp(1, 100) as u32)
                .unwrap_or(d.violation_strikes),
            global_max_running: env_u64("BOTDOCK_GLOBAL_MAX_RUNNING")
                .map(|v| v.clamp(1, 100_000) as u32)
                .unwrap_or(d.global_max_running),
            nofile_limit: env_u64("BOTDOCK_NOFILE_LIMIT").unwrap_or(d.nofile_limit),
            command_max_chars: d.command_max_chars,
            command_write_timeout: env_ms("BOTDOCK_COMMAND_WRITE_TIMEOUT_MS", 100, 60_000, 5000),
            max_runtime_override: env_u64("BOTDOCK_MAX_RUNTIME_SEC")
                .filter(|v| *v > 0)
                .map(Duration::from_secs),
            restart: RestartConfig {
                policy: env_string("BOTDOCK_RESTART_POLICY")
                    .map(|v| RestartPolicy::parse(&v))
                    .unwrap_or(d.restart.policy),
                backoff_ms,
                backoff_max_ms,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_policy_parsing_accepts_aliases() {
        assert_eq!(RestartPolicy::parse("always"), RestartPolicy::Always);
        assert_eq!(RestartPolicy::parse(" On_Failure "), RestartPolicy::OnFailure);
        assert_eq!(RestartPolicy::parse("on-failure"), RestartPolicy::OnFailure);
        assert_eq!(RestartPolicy::parse("bogus"), RestartPolicy::Off);
    }

    #[test]
    fn on_failure_skips_clean_exits() {
        assert!(!RestartPolicy::OnFailure.should_restart(true));
        assert!(RestartPolicy::OnFailure.should_restart(false));
        assert!(RestartPolicy::Always.should_restart(true));
        assert!(!RestartPolicy::Off.should_restart(false));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = RestartConfig {
            policy: RestartPolicy::Always,
            backoff_ms: 1000,
            backoff_max_ms: 5000,
        };
        assert_eq!(cfg.backoff(1), Duration::from_millis(1000));
        assert_eq!(cfg.backoff(2), Duration::from_millis(2000));
        assert_eq!(cfg.backoff(3), Duration::from_millis(4000));
        assert_eq!(cfg.backoff(4), Duration::from_millis(5000));
        assert_eq!(cfg.backoff(500), Duration::from_millis(5000));
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.log_max_lines, 1000);
        assert_eq!(cfg.entry_file, "bot.py");
        assert_eq!(cfg.stop_grace, Duration::from_secs(5));
        assert_eq!(cfg.restart.policy, RestartPolicy::Off);
        assert_eq!(cfg.command_write_timeout, Duration::from_secs(5));
        assert!(cfg.max_runtime_override.is_none());
    }
}
