//! Shared tracing/logging initialization.
//!
//! The `vprinter` binary and the integration test harnesses set up
//! `tracing_subscriber` with an env-filter and optional JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter used when neither `RUST_LOG` nor a CLI level is given.
pub const DEFAULT_FILTER: &str = "vprinter_daemon=info,vprinter_relay=info,vprinter_crypto=info";

/// Build the filter directive string for a plain level such as `"debug"`.
///
/// Applies the level to every `vprinter_*` crate so a single CLI flag
/// controls the whole stack.
pub fn filter_for_level(level: &str) -> String {
    ["vprinter_daemon", "vprinter_relay", "vprinter_crypto", "vprinter_core"]
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set.
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_for_level_covers_all_crates() {
        let filter = filter_for_level("debug");
        assert!(filter.contains("vprinter_daemon=debug"));
        assert!(filter.contains("vprinter_relay=debug"));
        assert!(filter.contains("vprinter_crypto=debug"));
        assert_eq!(filter.matches('=').count(), 4);
    }
}
