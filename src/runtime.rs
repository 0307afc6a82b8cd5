//! Runtime glue: configuration, telemetry and the group runner.

pub mod config;
pub mod runner;
pub mod telemetry;
