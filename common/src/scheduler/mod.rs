// Scheduler module: per-repository timers driving the backup pipeline

pub mod engine;

pub use engine::{BackupScheduler, Scheduler};
