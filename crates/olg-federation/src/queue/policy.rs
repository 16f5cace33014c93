//! Bounded exponential backoff.

use olg_core::config::DeliveryConfig;

/// Retry schedule for outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const fn new(base_backoff_secs: u64, max_backoff_secs: u64, max_attempts: u32) -> Self {
        Self {
            base_backoff_secs,
            max_backoff_secs,
            max_attempts,
        }
    }

    /// Delay before the next attempt after `attempts` failed ones:
    /// `base * 2^(attempts - 1)`, capped at the maximum.
    pub fn delay_for_attempt(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1).min(63);
        let factor = 1u64 << exponent;
        self.base_backoff_secs
            .saturating_mul(factor)
            .min(self.max_backoff_secs)
    }

    /// Whether a message with this many attempts must be dead-lettered.
    pub const fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl From<&DeliveryConfig> for RetryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self::new(
            config.base_backoff_secs,
            config.max_backoff_secs,
            config.max_attempts,
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_from_base() {
        let policy = RetryPolicy::new(30, 3600, 8);
        assert_eq!(policy.delay_for_attempt(1), 30);
        assert_eq!(policy.delay_for_attempt(2), 60);
        assert_eq!(policy.delay_for_attempt(3), 120);
        assert_eq!(policy.delay_for_attempt(4), 240);
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::new(30, 3600, 8);
        assert_eq!(policy.delay_for_attempt(8), 3600);
        assert_eq!(policy.delay_for_attempt(200), 3600);
    }

    #[test]
    fn zeroth_attempt_uses_base() {
        assert_eq!(RetryPolicy::new(5, 100, 3).delay_for_attempt(0), 5);
    }

    #[test]
    fn exhaustion_at_max_attempts() {
        let policy = RetryPolicy::new(1, 10, 3);
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
        assert!(policy.is_exhausted(4));
    }

    #[test]
    fn built_from_config() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_backoff_secs, 30);
        assert_eq!(policy.max_attempts, 8);
    }
}
