//! Tracing/logging initialization.
//!
//! Filter priority: `INGEST_LOG`, then `RUST_LOG`, then `info`.
//! `INGEST_LOG_FORMAT=json` switches to JSON lines. Logs go to stderr.

use tracing_subscriber::EnvFilter;

/// Project-specific filter directive variable.
pub const LOG_ENV: &str = "INGEST_LOG";

/// Output format variable (`json` or `text`).
pub const LOG_FORMAT_ENV: &str = "INGEST_LOG_FORMAT";

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let project = std::env::var(LOG_ENV).ok();
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(project.as_deref(), rust_log.as_deref());

    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|format| wants_json(&format));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let _ = if json {
        builder.json().with_target(false).try_init()
    } else {
        builder.try_init()
    };
}

/// First directive that parses wins; `info` otherwise.
fn build_filter(project: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    [project, rust_log]
        .into_iter()
        .flatten()
        .filter(|directive| !directive.trim().is_empty())
        .find_map(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn wants_json(format: &str) -> bool {
    format.trim().eq_ignore_ascii_case("json")
}
