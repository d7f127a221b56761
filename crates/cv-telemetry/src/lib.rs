//! Logging and span helpers shared by the conveyor crates.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Spans**: per-run and per-story spans carrying a correlation id

pub mod logging;
pub mod tracing_setup;

pub use logging::{init_logging, init_logging_json, LogFormat};
pub use tracing_setup::{run_span, story_span};
