use std::time::Duration;

use crate::error::{MonaError, Result};
use crate::logging::Logger;

/// Fixed-delay retry policy for authentication requests.
///
/// `retries` counts the attempts after the first one, so at most
/// `retries + 1` requests are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    /// Run `attempt` until it succeeds or the retries are used up.
    ///
    /// Every `Err` from `attempt` counts as transient. On exhaustion the last
    /// error is folded into an authentication error.
    pub fn run<T>(&self, logger: &Logger, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
        let mut tries = 0;
        loop {
            match attempt() {
                Ok(value) => {
                    logger.info(format!(
                        "Got an authentication response after {tries} retries."
                    ));
                    return Ok(value);
                }
                Err(e) if tries >= self.retries => {
                    return Err(MonaError::Authentication(format!(
                        "Could not connect to authentication server. \
                         Number of retries: {tries}. Last error: {}",
                        e.message()
                    )));
                }
                Err(e) => {
                    logger.debug(format!(
                        "authentication attempt {} failed: {e}; retrying in {:?}",
                        tries + 1,
                        self.delay
                    ));
                    tries += 1;
                    std::thread::sleep(self.delay);
                }
            }
        }
    }
}
