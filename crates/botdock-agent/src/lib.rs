//! Bot orchestration core: process supervision, per-bot lifecycle state
//! machines, plan enforcement and the log/command pipeline.

pub mod command;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod log_buffer;
pub mod orchestrator;
pub mod quota;
pub mod registry;
pub mod sampler;
pub mod supervisor;
pub mod tenants;
pub mod workspace;

pub use config::{AgentConfig, RestartConfig, RestartPolicy};
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, SystemCounts, TenantSweep};
pub use tenants::{StaticTenants, TenantDirectory};
