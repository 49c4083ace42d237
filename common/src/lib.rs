// Common library: the backup engine shared by the gitmirror binary and its tests

pub mod bootstrap;
pub mod cipher;
pub mod config;
pub mod errors;
pub mod git;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod storage;
pub mod telemetry;
pub mod webhook;
