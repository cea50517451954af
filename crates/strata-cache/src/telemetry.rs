//! Logging setup for hosts that do not install their own subscriber

use tracing::Level;
use tracing_subscriber::fmt;

use crate::error::{CacheError, Result};

/// Parse a level name, defaulting to `INFO`
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install a stderr `fmt` subscriber
///
/// `verbose` adds targets, thread IDs and source locations. Fails if a global subscriber
/// is already set.
pub fn init_tracing(level: &str, verbose: bool) -> Result<()> {
    fmt()
        .with_max_level(parse_level(level))
        .with_target(verbose)
        .with_thread_ids(verbose)
        .with_file(verbose)
        .with_line_number(verbose)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| CacheError::Config {
            message: format!("failed to install tracing subscriber: {}", err),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("warn"), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }

    #[test]
    fn test_second_init_fails() {
        let _ = init_tracing("info", false);
        assert!(init_tracing("debug", true).is_err());
    }
}
