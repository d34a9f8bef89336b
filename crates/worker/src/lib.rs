//! The meteomap render worker: configuration, telemetry and wiring.

pub mod app;
pub mod config;
pub mod telemetry;

pub use config::{ConfigError, WorkerConfig};
