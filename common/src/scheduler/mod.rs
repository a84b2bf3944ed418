// Scheduler core: registry, timers, and dispatch

pub mod manager;

pub use manager::SchedulerManager;
