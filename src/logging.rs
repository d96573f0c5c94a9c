//! # Structured Logging Module
//!
//! Environment-aware console logging using the tracing ecosystem. Logs go to
//! stdout, which is what the container runtime collects.
//!
//! Level selection: `RUST_LOG` when set, otherwise derived from `SCAN_RELAY_ENV`
//! (`test`/`development` → debug, `production` → info). Set
//! `SCAN_RELAY_LOG_FORMAT=json` for JSON lines.
//!
//! The `log_*` helpers emit records with fixed markers (`DELIVERY`,
//! `DEAD_LETTER`, `OPERATOR_ALERT`) so that dead letters and data-loss alerts
//! can be found and replayed from the log stream.

use chrono::Utc;
use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize console logging once per process
pub fn init_tracing() {
    TRACING_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));
        let json = std::env::var("SCAN_RELAY_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let use_ansi = IsTerminal::is_terminal(&std::io::stdout());

        let console_layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(use_ansi)
                .with_filter(filter)
                .boxed()
        };

        if tracing_subscriber::registry()
            .with(console_layer)
            .try_init()
            .is_err()
        {
            tracing::debug!(
                "Global tracing subscriber already initialized; keeping the existing one"
            );
        } else {
            tracing::info!(
                environment = %environment,
                ansi_colors = use_ansi,
                json_format = json,
                "Console logging initialized"
            );
        }
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("SCAN_RELAY_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log the final state of one delivery
pub fn log_delivery_outcome(
    queue: &str,
    receipt: &str,
    attempt: u32,
    payload: &str,
    state: &str,
    detail: Option<&str>,
) {
    tracing::info!(
        queue = %queue,
        receipt = %receipt,
        attempt = attempt,
        payload = %payload,
        state = %state,
        detail = detail,
        "DELIVERY"
    );
}

/// Log a dead-lettered message with everything needed for manual replay
pub fn log_dead_letter(queue: &str, receipt: &str, attempt: u32, payload: &str, detail: &str) {
    tracing::error!(
        queue = %queue,
        receipt = %receipt,
        attempt = attempt,
        payload = %payload,
        detail = %detail,
        timestamp = %Utc::now().to_rfc3339(),
        "DEAD_LETTER"
    );
}

/// Surface a condition that needs operator attention, such as lost events
pub fn log_operator_alert(component: &str, condition: &str, payload: Option<&str>, detail: &str) {
    tracing::error!(
        component = %component,
        condition = %condition,
        payload = payload,
        detail = %detail,
        timestamp = %Utc::now().to_rfc3339(),
        "OPERATOR_ALERT"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test"), "debug");
        assert_eq!(get_log_level("development"), "debug");
        assert_eq!(get_log_level("production"), "info");
        assert_eq!(get_log_level("unknown"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_tracing();
        init_tracing();
        log_operator_alert("test", "noop", None, "init twice");
    }
}
