//! Server configuration.

use std::time::Duration;

/// Configuration for the coordination server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound on how long a GetRows call is held open.
    pub long_poll_ceiling: Duration,
    /// Maximum rows accepted by one SendRows call.
    pub max_send_batch: usize,
    /// Longest lifetime a session may be created with.
    pub max_session_lifetime: Duration,
    /// Number of most recent rows kept for cached reads.
    pub row_cache_window: usize,
}

impl ServerConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            long_poll_ceiling: Duration::from_secs(30),
            max_send_batch: 1000,
            max_session_lifetime: Duration::from_secs(smash_protocol::MAX_SESSION_LIFETIME_SECS),
            row_cache_window: 256,
        }
    }

    /// Sets the long-poll ceiling.
    pub fn with_long_poll_ceiling(mut self, ceiling: Duration) -> Self {
        self.long_poll_ceiling = ceiling;
        self
    }

    /// Sets the maximum SendRows batch size.
    pub fn with_max_send_batch(mut self, rows: usize) -> Self {
        self.max_send_batch = rows;
        self
    }

    /// Sets the maximum session lifetime.
    pub fn with_max_session_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_session_lifetime = lifetime;
        self
    }

    /// Sets the cached-read window.
    pub fn with_row_cache_window(mut self, rows: usize) -> Self {
        self.row_cache_window = rows;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.long_poll_ceiling, Duration::from_secs(30));
        assert_eq!(config.max_send_batch, 1000);
        assert_eq!(config.max_session_lifetime, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(config.row_cache_window, 256);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_long_poll_ceiling(Duration::from_millis(200))
            .with_max_send_batch(10)
            .with_max_session_lifetime(Duration::from_secs(60))
            .with_row_cache_window(4);

        assert_eq!(config.long_poll_ceiling, Duration::from_millis(200));
        assert_eq!(config.max_send_batch, 10);
        assert_eq!(config.max_session_lifetime, Duration::from_secs(60));
        assert_eq!(config.row_cache_window, 4);
    }
}
