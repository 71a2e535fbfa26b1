//! Logging initialization
//!
//! quay logs through `tracing` and never installs a subscriber on its own.
//! Applications that have no subscriber can call [`init`].

use tracing_subscriber::EnvFilter;

/// Environment variable selecting the log format (`json` or `text`)
pub const LOG_FORMAT_ENV: &str = "QUAY_LOG_FORMAT";

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`)
///
/// Writes JSON when `QUAY_LOG_FORMAT=json`. Safe to call multiple times
/// (subsequent calls are no-ops).
pub fn init() {
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    init_with(json);
}

/// Install a subscriber with an explicit format choice
pub fn init_with(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if json {
        builder.json().with_target(false).try_init()
    } else {
        builder.try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_with(false);
        init_with(true);
        init();
        tracing::info!("still logging");
    }
}
