pub mod audit_events;
pub mod bots;
pub mod users;
