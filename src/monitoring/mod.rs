//! Monitoring Module
//!
//! Structured logging setup for hosts embedding the engine. Counters live
//! on the engine itself (see `ValidationMetrics`).

pub mod logging;

pub use logging::{init_logging, LogFormat, LogLevel, LoggerConfig};
