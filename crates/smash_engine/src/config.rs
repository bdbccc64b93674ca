//! Configuration for sessions.

use crate::error::{SmashError, SmashResult};
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for one session.
///
/// Passed explicitly at construction; nothing is cached process-wide.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the coordination service.
    pub host: String,
    /// Named host overrides (e.g. "staging" -> URL).
    pub host_overrides: BTreeMap<String, String>,
    /// Override to use, if any.
    pub environment: Option<String>,
    /// Delay between polls. Zero selects long polling.
    pub refresh_interval: Duration,
    /// How long the server may hold a long poll open.
    pub long_poll_timeout: Duration,
    /// Slack added to the server hold time to form the local deadline.
    pub timeout_margin: Duration,
    /// Fixed delay after a failed or timed-out poll.
    pub poll_backoff: Duration,
    /// Whether the deduper keeps an ordered history for trimming.
    pub history_tracking: bool,
}

impl SessionConfig {
    /// Creates a configuration for the given host.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            host_overrides: BTreeMap::new(),
            environment: None,
            refresh_interval: Duration::ZERO,
            long_poll_timeout: Duration::from_secs(30),
            timeout_margin: Duration::from_secs(5),
            poll_backoff: Duration::from_secs(2),
            history_tracking: true,
        }
    }

    /// Sets the refresh interval (zero selects long polling).
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Sets the long poll hold time.
    pub fn with_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout = timeout;
        self
    }

    /// Sets the local deadline margin.
    pub fn with_timeout_margin(mut self, margin: Duration) -> Self {
        self.timeout_margin = margin;
        self
    }

    /// Sets the backoff after a failed poll.
    pub fn with_poll_backoff(mut self, backoff: Duration) -> Self {
        self.poll_backoff = backoff;
        self
    }

    /// Enables or disables deduper history tracking.
    pub fn with_history_tracking(mut self, enabled: bool) -> Self {
        self.history_tracking = enabled;
        self
    }

    /// Registers a named host override.
    pub fn with_host_override(mut self, name: impl Into<String>, host: impl Into<String>) -> Self {
        self.host_overrides.insert(name.into(), host.into());
        self
    }

    /// Selects a named host override.
    pub fn with_environment(mut self, name: impl Into<String>) -> Self {
        self.environment = Some(name.into());
        self
    }

    /// Returns the host requests go to, after applying overrides.
    pub fn effective_host(&self) -> &str {
        self.environment
            .as_ref()
            .and_then(|env| self.host_overrides.get(env))
            .map(String::as_str)
            .unwrap_or(self.host.as_str())
    }

    /// Returns true when polling uses server-side long polls.
    pub fn is_long_poll(&self) -> bool {
        self.refresh_interval.is_zero()
    }

    /// Server hold time requested on each GetRows call.
    pub fn server_wait(&self) -> Duration {
        if self.is_long_poll() {
            self.long_poll_timeout
        } else {
            Duration::ZERO
        }
    }

    /// Local deadline for one GetRows call.
    pub fn request_deadline(&self) -> Duration {
        self.server_wait() + self.timeout_margin
    }

    /// Checks the configuration for inconsistent values.
    pub fn validate(&self) -> SmashResult<()> {
        if self.effective_host().trim().is_empty() {
            return Err(SmashError::validation("host must not be empty"));
        }
        if let Some(env) = &self.environment {
            if !self.host_overrides.contains_key(env) {
                return Err(SmashError::validation(format!(
                    "unknown host override `{env}`"
                )));
            }
        }
        if self.is_long_poll() && self.long_poll_timeout.is_zero() {
            return Err(SmashError::validation(
                "long polling requires a non-zero long_poll_timeout",
            ));
        }
        if self.timeout_margin.is_zero() {
            return Err(SmashError::validation(
                "timeout_margin must be non-zero so the server answers before the local deadline",
            ));
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new("https://smash.example.com")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_builder() {
        let config = SessionConfig::new("https://sync.example.com")
            .with_long_poll_timeout(Duration::from_secs(20))
            .with_timeout_margin(Duration::from_secs(2))
            .with_poll_backoff(Duration::from_millis(500))
            .with_history_tracking(false);

        assert_eq!(config.host, "https://sync.example.com");
        assert!(config.is_long_poll());
        assert_eq!(config.server_wait(), Duration::from_secs(20));
        assert_eq!(config.request_deadline(), Duration::from_secs(22));
        assert_eq!(config.poll_backoff, Duration::from_millis(500));
        assert!(!config.history_tracking);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn interval_polling_does_not_hold() {
        let config = SessionConfig::default().with_refresh_interval(Duration::from_secs(1));
        assert!(!config.is_long_poll());
        assert_eq!(config.server_wait(), Duration::ZERO);
        assert_eq!(config.request_deadline(), config.timeout_margin);
    }

    #[test]
    fn host_overrides() {
        let config = SessionConfig::new("https://prod.example.com")
            .with_host_override("staging", "https://staging.example.com");
        assert_eq!(config.effective_host(), "https://prod.example.com");

        let config = config.with_environment("staging");
        assert_eq!(config.effective_host(), "https://staging.example.com");

        let config = config.with_environment("qa");
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_margin() {
        let config = SessionConfig::default().with_timeout_margin(Duration::ZERO);
        assert!(matches!(config.validate(), Err(SmashError::Validation(_))));

        let config = SessionConfig::default().with_long_poll_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
