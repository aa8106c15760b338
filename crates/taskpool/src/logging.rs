//! Structured logging setup. The crate itself never calls this
//! implicitly — it's here for tests and downstream binaries that embed
//! the scheduler and want consistent output.
//!
//! # Environment variables
//!
//! - `LOG_FORMAT`: `json` for structured output, anything else for
//!   human-readable text (default: text).
//! - `RUST_LOG`: standard `tracing-subscriber` env filter (default: `info`).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize global logging for the given service name.
pub fn init_logging(_service_name: &str) {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .flatten_event(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_ansi(true))
            .init();
    }
}

/// Initialize logging with the crate's own name as the service name.
pub fn init_default_logging() {
    init_logging("taskpool");
}
