//! Bounded retry with exponential backoff for credential fetches

use std::time::Duration;

/// Configuration for how to back off and when to give up after a failed fetch
#[derive(Clone, Debug)]
pub struct ErrorBackoffConfig {
    initial_error_delay: Duration,
    max_error_delay: Duration,
    multiplier: u32,
    max_attempts: u32,
}

impl Default for ErrorBackoffConfig {
    /// Default backoff configuration
    ///
    /// Uses an initial error delay of 100 ms with a multiplier of 2. Maximum delay is
    /// capped at 15 seconds and a refresh gives up after 3 attempts.
    fn default() -> Self {
        Self {
            initial_error_delay: Duration::from_millis(100),
            max_error_delay: Duration::from_secs(15),
            multiplier: 2,
            max_attempts: 3,
        }
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// When encountering an error for the first time, the backoff will be `initial_error_delay`.
    /// On subsequent errors, the backoff is multiplied by `multiplier`, with a cap of
    /// `max_error_delay`. No more than `max_attempts` attempts are made in total; a value
    /// of zero is treated as one.
    pub fn new(
        initial_error_delay: Duration,
        max_error_delay: Duration,
        multiplier: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_error_delay,
            max_error_delay,
            multiplier,
            max_attempts: max_attempts.max(1),
        }
    }

    /// A configuration that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// The total number of attempts allowed
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Utility trait for extending types with a backoff handler
pub trait WithBackoff {
    /// The output of providing backoff
    type Output;

    /// Applies backoff to the current value
    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output;
}

impl<T, E> WithBackoff for Result<T, E> {
    type Output = Result<T, (E, Option<Duration>)>;

    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output {
        match self {
            Ok(ok) => {
                handler.success();
                Ok(ok)
            }
            Err(err) => Err((err, handler.error())),
        }
    }
}

/// A stateful handler that tracks failed attempts within one refresh
#[derive(Debug)]
pub struct ErrorBackoffHandler {
    config: ErrorBackoffConfig,
    last_delay: Option<Duration>,
    failures: u32,
}

impl ErrorBackoffHandler {
    /// Constructs a new handler from an [`ErrorBackoffConfig`].
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self {
            config,
            last_delay: None,
            failures: 0,
        }
    }

    /// Reports a success
    ///
    /// This resets the internal delay state.
    pub fn success(&mut self) {
        self.last_delay = None;
        self.failures = 0;
    }

    /// Reports a failure and returns the delay before the next attempt
    ///
    /// Returns `None` once the configured number of attempts has been used up.
    pub fn error(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.config.max_attempts {
            return None;
        }

        let new_delay = self
            .last_delay
            .map(|s| {
                s.saturating_mul(self.config.multiplier)
                    .min(self.config.max_error_delay)
            })
            .unwrap_or(self.config.initial_error_delay);
        self.last_delay = Some(new_delay);
        Some(new_delay)
    }

    /// The number of failures reported since the last success
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl From<ErrorBackoffConfig> for ErrorBackoffHandler {
    fn from(config: ErrorBackoffConfig) -> Self {
        Self::new(config)
    }
}
