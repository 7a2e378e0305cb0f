//! Tracing subscriber set-up.
//!
//! `RUST_LOG` takes precedence over the level passed in, so a single device can
//! be turned up without touching the configuration file:
//!
//! ```text
//! RUST_LOG=info,rust_microscope::data=trace microscope serve --config rig.toml
//! ```

use anyhow::anyhow;
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// # Errors
///
/// Fails if `level` is not a valid filter directive or if a global subscriber
/// has already been installed.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|err| anyhow!("invalid log level '{level}': {err}"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .try_init()
        .map_err(|err| anyhow!("cannot install log subscriber: {err}"))
}

/// Route logs through the test harness' captured output. Safe to call from
/// every test.
pub fn try_init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        try_init_for_tests();
        try_init_for_tests();
        assert!(init("info").is_err());
    }
}
