//! Reconnection delay policy
//!
//! Linear backoff: the first retry waits `initial_delay_secs`, every further
//! failure adds `step_secs`, capped at `max_delay_secs`. A successful
//! connectivity check or an explicit restart resets the delay to its floor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MasterError, Result};

/// Reconnection policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay floor, used for the first retry after a success
    pub initial_delay_secs: u64,
    /// Added to the delay after every failed check
    pub step_secs: u64,
    /// Delay ceiling
    pub max_delay_secs: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_secs: 1,
            step_secs: 2,
            max_delay_secs: 60,
        }
    }
}

impl ReconnectPolicy {
    /// Create from configuration values
    pub fn from_config(initial_delay_secs: u64, step_secs: u64, max_delay_secs: u64) -> Self {
        Self {
            initial_delay_secs,
            step_secs,
            max_delay_secs,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_delay_secs == 0 {
            return Err(MasterError::config(
                "reconnect.initial_delay_secs must be greater than 0",
            ));
        }
        if self.max_delay_secs < self.initial_delay_secs {
            return Err(MasterError::config(format!(
                "reconnect.max_delay_secs ({}) is below initial_delay_secs ({})",
                self.max_delay_secs, self.initial_delay_secs
            )));
        }
        Ok(())
    }
}

/// Retry delay state of one connection
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    policy: ReconnectPolicy,
    current_secs: u64,
}

impl RetryBackoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current_secs: policy.initial_delay_secs,
        }
    }

    /// Delay to wait before the next reconnection attempt
    pub fn current(&self) -> Duration {
        Duration::from_secs(self.current_secs)
    }

    pub fn current_secs(&self) -> u64 {
        self.current_secs
    }

    /// Return the delay to use now and step the next one towards the ceiling
    pub fn advance(&mut self) -> Duration {
        let delay = self.current();
        self.current_secs = self
            .current_secs
            .saturating_add(self.policy.step_secs)
            .min(self.policy.max_delay_secs);
        debug!(
            "Retry delay {}s, next {}s",
            delay.as_secs(),
            self.current_secs
        );
        delay
    }

    /// Back to the floor after a successful check or an explicit restart
    pub fn reset(&mut self) {
        self.current_secs = self.policy.initial_delay_secs;
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff_capped() {
        let mut backoff = RetryBackoff::new(ReconnectPolicy::default());

        let delays: Vec<u64> = (0..35).map(|_| backoff.advance().as_secs()).collect();
        assert_eq!(&delays[..4], &[1, 3, 5, 7]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= 60));
        assert_eq!(*delays.last().unwrap(), 60);
    }

    #[test]
    fn test_reset_returns_to_floor() {
        let mut backoff = RetryBackoff::new(ReconnectPolicy::from_config(2, 5, 30));
        backoff.advance();
        backoff.advance();
        assert_eq!(backoff.current_secs(), 12);
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(2));
    }

    #[test]
    fn test_policy_validation() {
        assert!(ReconnectPolicy::default().validate().is_ok());
        assert!(ReconnectPolicy::from_config(0, 2, 60).validate().is_err());
        assert!(ReconnectPolicy::from_config(10, 2, 5).validate().is_err());
    }
}
