use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};

/// Stable bot identifier. Registry keys, workspace directories and database
/// rows all use this value.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct BotId(pub String);

impl BotId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BotId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Owner of bots. Resolved by the tenant directory, never by the core.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl BotState {
    /// States that hold (or are about to hold) an OS process and therefore
    /// count against the tenant's concurrency ceiling.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Crashed => "CRASHED",
        }
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ExitReason {
    pub message: String,
    pub exit_code: Option<i32>,
    pub at: DateTime<Utc>,
}

/// Committed snapshot of one bot, as returned to status queries.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BotStatus {
    pub id: BotId,
    pub owner: TenantId,
    pub name: String,
    pub state: BotState,
    pub started_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub last_exit: Option<ExitReason>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub line: String,
    pub is_error: bool,
}

impl LogEntry {
    pub fn timestamp_text(&self) -> String {
        self.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    /// One line of the downloadable log file.
    pub fn render(&self) -> String {
        if self.is_error {
            format!("[{}] [ERROR] {}", self.timestamp_text(), self.line)
        } else {
            format!("[{}] {}", self.timestamp_text(), self.line)
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanTier {
    Free,
    Pro,
    Ultra,
}

impl PlanTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Pro => "PRO",
            Self::Ultra => "ULTRA",
        }
    }

    pub fn limits(self) -> PlanLimits {
        match self {
            Self::Free => PlanLimits {
                name: "Free".to_string(),
                max_bots: 3,
                max_running: 1,
                max_runtime_hours: 24,
                max_restarts: 3,
                max_log_lines: 500,
                max_cpu_percent: 50.0,
                max_ram_mb: 200,
            },
            Self::Pro => PlanLimits {
                name: "Pro".to_string(),
                max_bots: 10,
                max_running: 3,
                max_runtime_hours: 72,
                max_restarts: 10,
                max_log_lines: 5000,
                max_cpu_percent: 80.0,
                max_ram_mb: 500,
            },
            Self::Ultra => PlanLimits {
                name: "Ultra".to_string(),
                max_bots: 50,
                max_running: 10,
                max_runtime_hours: 8760,
                max_restarts: 9999,
                max_log_lines: 50_000,
                max_cpu_percent: 95.0,
                max_ram_mb: 1000,
            },
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FREE" => Ok(Self::Free),
            "PRO" => Ok(Self::Pro),
            "ULTRA" => Ok(Self::Ultra),
            other => Err(format!("unknown plan: {other}")),
        }
    }
}

/// Ceilings derived from a plan tier.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PlanLimits {
    pub name: String,
    /// Bots a tenant may own.
    pub max_bots: u32,
    /// Bots a tenant may have active at once.
    pub max_running: u32,
    pub max_runtime_hours: u64,
    pub max_restarts: u32,
    pub max_log_lines: usize,
    pub max_cpu_percent: f64,
    pub max_ram_mb: u64,
}

impl PlanLimits {
    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_hours.saturating_mul(3600))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TenantRole {
    User,
    Admin,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub username: String,
    pub role: TenantRole,
    pub plan: PlanTier,
    pub suspended: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_id_is_non_empty_and_unique() {
        let a = BotId::new();
        let b = BotId::new();
        assert!(!a.0.is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn active_states_hold_a_slot() {
        assert!(BotState::Starting.is_active());
        assert!(BotState::Running.is_active());
        assert!(BotState::Stopping.is_active());
        assert!(!BotState::Stopped.is_active());
        assert!(!BotState::Crashed.is_active());
    }

    #[test]
    fn plan_tier_parses_case_insensitively() {
        assert_eq!("pro".parse::<PlanTier>().unwrap(), PlanTier::Pro);
        assert_eq!(" ULTRA ".parse::<PlanTier>().unwrap(), PlanTier::Ultra);
        assert!("gold".parse::<PlanTier>().is_err());
    }

    #[test]
    fn free_plan_allows_one_running_bot() {
        let limits = PlanTier::Free.limits();
        assert_eq!(limits.max_running, 1);
        assert!(limits.max_bots > limits.max_running);
        assert_eq!(limits.max_runtime(), Duration::from_secs(24 * 3600));
    }

    #[test]
    fn render_marks_error_lines() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T10:20:30Z")
            .unwrap()
            .with_timezone(&Utc);
        let ok = LogEntry {
            timestamp: ts,
            line: "hello".to_string(),
            is_error: false,
        };
        let err = LogEntry {
            timestamp: ts,
            line: "boom".to_string(),
            is_error: true,
        };
        assert_eq!(ok.render(), "[2024-05-01 10:20:30] hello");
        assert_eq!(err.render(), "[2024-05-01 10:20:30] [ERROR] boom");
    }

    #[test]
    fn state_serializes_uppercase() {
        let s = serde_json::to_string(&BotState::Crashed).unwrap();
        assert_eq!(s, "\"CRASHED\"");
    }
}
