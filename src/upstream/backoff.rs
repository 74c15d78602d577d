use std::time::Duration;

use crate::runtime_config::UpstreamConfig;

/// Capped exponential backoff for upstream reconnects.
///
/// Attempt `n` (zero-based) waits `min(base * 2^n, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            base_delay: config.reconnect_base_delay(),
            max_delay: config.reconnect_max_delay(),
            max_attempts: config.reconnect_max_attempts,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether attempt `attempt` may still be made.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }

    #[test]
    fn doubles_from_base_until_cap() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_secs(5));
        assert_eq!(p.delay_for(1), Duration::from_secs(10));
        assert_eq!(p.delay_for(2), Duration::from_secs(20));
        assert_eq!(p.delay_for(3), Duration::from_secs(40));
        assert_eq!(p.delay_for(4), Duration::from_secs(60));
        assert_eq!(p.delay_for(9), Duration::from_secs(60));
    }

    #[test]
    fn huge_attempts_saturate_at_cap() {
        let p = policy();
        assert_eq!(p.delay_for(31), Duration::from_secs(60));
        assert_eq!(p.delay_for(200), Duration::from_secs(60));
    }

    #[test]
    fn attempt_cap() {
        let p = policy();
        assert!(p.allows(0));
        assert!(p.allows(9));
        assert!(!p.allows(10));
    }

    #[test]
    fn built_from_config() {
        let p = ReconnectPolicy::from_config(&UpstreamConfig::default());
        assert_eq!(p, policy());
    }
}
