// Common library for the cron scheduler core, shared by the daemon and tests

pub mod config;
pub mod dynamic;
pub mod errors;
pub mod events;
pub mod executor;
pub mod models;
pub mod monitor;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod trigger;
