use std::fmt::Display;
use std::sync::{Arc, OnceLock};

use tracing_subscriber::EnvFilter;

use crate::types::DEFAULT_LOGGER_NAME;

static LOGGING_INIT: OnceLock<bool> = OnceLock::new();

/// Install the process-wide log subscriber.
///
/// `level` accepts level names (`DEBUG`, `INFO`, `WARNING`, `ERROR`,
/// `CRITICAL`) or their numeric equivalents (10..50). An absent or unknown
/// level leaves logging off. Only the first call has an effect; the return
/// value says whether a subscriber is installed.
pub fn init_logging(level: Option<&str>) -> bool {
    *LOGGING_INIT.get_or_init(|| {
        let Some(directive) = level.and_then(parse_level) else {
            return false;
        };
        let filter = EnvFilter::new(format!("mona_sdk={directive}"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .is_ok()
    })
}

/// Map a level name or number to a `tracing` level directive.
pub(crate) fn parse_level(level: &str) -> Option<&'static str> {
    let level = level.trim();
    if let Ok(n) = level.parse::<u32>() {
        return match n {
            0 => None,
            1..=10 => Some("debug"),
            11..=20 => Some("info"),
            21..=30 => Some("warn"),
            31..=50 => Some("error"),
            _ => None,
        };
    }
    match level.to_ascii_uppercase().as_str() {
        "TRACE" => Some("trace"),
        "DEBUG" => Some("debug"),
        "INFO" => Some("info"),
        "WARN" | "WARNING" => Some("warn"),
        "ERROR" | "CRITICAL" | "FATAL" => Some("error"),
        _ => None,
    }
}

/// Named logging handle handed to every client component.
///
/// Events are emitted under the `mona_sdk` target with the logger name
/// attached as the `logger` field.
#[derive(Debug, Clone)]
pub struct Logger {
    name: Arc<str>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(DEFAULT_LOGGER_NAME)
    }
}

impl Logger {
    pub fn new(name: &str) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn debug(&self, msg: impl Display) {
        tracing::debug!(logger = %self.name, "{msg}");
    }

    pub fn info(&self, msg: impl Display) {
        tracing::info!(logger = %self.name, "{msg}");
    }

    pub fn warn(&self, msg: impl Display) {
        tracing::warn!(logger = %self.name, "{msg}");
    }

    pub fn error(&self, msg: impl Display) {
        tracing::error!(logger = %self.name, "{msg}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn parses_names_and_numbers() {
        assert_eq!(parse_level("INFO"), Some("info"));
        assert_eq!(parse_level("warning"), Some("warn"));
        assert_eq!(parse_level("CRITICAL"), Some("error"));
        assert_eq!(parse_level("10"), Some("debug"));
        assert_eq!(parse_level("40"), Some("error"));
        assert_eq!(parse_level("LOUD"), None);
        assert_eq!(parse_level("0"), None);
    }

    #[test]
    #[traced_test]
    fn logger_attaches_name() {
        let logger = Logger::new("test-logger");
        logger.error("could not send batch");
        assert!(logs_contain("could not send batch"));
        assert!(logs_contain("test-logger"));
    }
}
