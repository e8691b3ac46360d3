//! Adaptive-backoff poll interval tracking for the runner service's task
//! claim loop (§4.5.1).
//!
//! Backs off exponentially (bounded `min_interval`..`max_interval`) when a
//! poll claims nothing, and resets to `min_interval` the moment a poll
//! claims at least one task.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub backoff_multiplier: f64,
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

/// Tracks the current poll interval across successive polls.
pub struct AdaptiveInterval {
    config: PollerConfig,
    current: Duration,
}

impl AdaptiveInterval {
    pub fn new(config: PollerConfig) -> Self {
        let current = config.min_interval;
        Self { config, current }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record the outcome of one poll and update the interval for the next.
    pub fn record(&mut self, claimed: usize) {
        if claimed == 0 {
            let next = Duration::from_secs_f64(
                self.current.as_secs_f64() * self.config.backoff_multiplier,
            );
            self.current = next.min(self.config.max_interval);
        } else {
            self.current = self.config.min_interval;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backs_off_on_empty_polls() {
        let mut poller = AdaptiveInterval::new(PollerConfig::default());
        let start = poller.current();
        poller.record(0);
        assert!(poller.current() > start);
    }

    #[test]
    fn test_resets_on_nonempty_poll() {
        let mut poller = AdaptiveInterval::new(PollerConfig::default());
        poller.record(0);
        poller.record(0);
        assert!(poller.current() > PollerConfig::default().min_interval);
        poller.record(3);
        assert_eq!(poller.current(), PollerConfig::default().min_interval);
    }

    #[test]
    fn test_backoff_caps_at_max_interval() {
        let config = PollerConfig {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(400),
            backoff_multiplier: 10.0,
            batch_size: 10,
        };
        let mut poller = AdaptiveInterval::new(config.clone());
        for _ in 0..5 {
            poller.record(0);
        }
        assert_eq!(poller.current(), config.max_interval);
    }
}
