//! # Utilities
//!
//! - **Logging**: tracing subscriber setup
//! - **Metrics**: atomic counters shared by pipelines and the task manager
//! - **Time**: Unix timestamps as used on the wire

pub mod logging;
pub mod metrics;
pub mod time;
