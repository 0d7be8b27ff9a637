//! Bus-wide defaults consumed by the RPC engine

use std::time::Duration;

/// Configuration values applied to every request and responder unless
/// overridden through their configuration callbacks
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Default expiration for outgoing requests; also the window after which
    /// a caller observes a cancellation error when no reply arrives
    pub timeout: Duration,
    /// Number of unacknowledged deliveries a responder consumer may hold
    pub prefetch_count: u16,
    /// Whether outgoing request messages default to persistent delivery
    pub persistent_messages: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            prefetch_count: 50,
            persistent_messages: true,
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;

    #[test]
    fn provide_usable_defaults() {
        let config = BusConfig::default();

        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.prefetch_count, 50);
        assert!(config.persistent_messages);
    }
}
