//! Logging setup emitting JSON lines through `tracing`.
//!
//! The numeric `log_level` knob maps onto tracing levels; `RUST_LOG` wins when set.

use tracing_subscriber::EnvFilter;

/// Map the numeric config level to a tracing directive.
pub fn level_directive(level: u8) -> &'static str {
    match level {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global JSON subscriber. Safe to call more than once.
pub fn init(level: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));
    let _ = tracing_subscriber::fmt()
        .json()
        .with_current_span(false)
        .with_target(true)
        .with_env_filter(filter)
        .try_init();
}
