//! Hysteresis-based backpressure for the runner service (§4.5.1).
//!
//! Tracks current in-flight task count against `max_concurrent` and stops
//! accepting new claims at a high watermark, resuming only once load drops
//! under a distinct low watermark, so the poll loop doesn't oscillate
//! claim-on/claim-off at the boundary.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq)]
pub struct BackpressureConfig {
    /// Stop accepting new claims once load ratio reaches this fraction of
    /// `max_concurrent`.
    pub high_watermark: f64,
    /// Resume accepting once load ratio falls to this fraction.
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.9,
            low_watermark: 0.7,
        }
    }
}

impl BackpressureConfig {
    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }
}

/// Thread-safe load tracker behind the runner service's poll loop.
pub struct BackpressureState {
    config: BackpressureConfig,
    current_load: AtomicUsize,
    max_concurrent: usize,
    accepting: AtomicBool,
}

impl BackpressureState {
    pub fn new(config: BackpressureConfig, max_concurrent: usize) -> Self {
        Self {
            config,
            current_load: AtomicUsize::new(0),
            max_concurrent,
            accepting: AtomicBool::new(true),
        }
    }

    /// Check whether the poll loop should keep claiming, applying
    /// hysteresis: crossing the high watermark flips to rejecting, and only
    /// crossing back under the low watermark flips back to accepting.
    pub fn should_accept(&self) -> bool {
        let load_ratio = self.load_ratio();
        let currently_accepting = self.accepting.load(Ordering::Relaxed);
        if currently_accepting {
            if load_ratio >= self.config.high_watermark {
                self.accepting.store(false, Ordering::Relaxed);
                return false;
            }
            true
        } else {
            if load_ratio <= self.config.low_watermark {
                self.accepting.store(true, Ordering::Relaxed);
                return true;
            }
            false
        }
    }

    pub fn load_ratio(&self) -> f64 {
        self.current_load.load(Ordering::Relaxed) as f64 / self.max_concurrent.max(1) as f64
    }

    pub fn current_load(&self) -> usize {
        self.current_load.load(Ordering::Relaxed)
    }

    pub fn available_slots(&self) -> usize {
        self.max_concurrent.saturating_sub(self.current_load())
    }

    pub fn task_started(&self) {
        self.current_load.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_completed(&self) {
        self.current_load.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_below_high_watermark() {
        let bp = BackpressureState::new(BackpressureConfig::default(), 10);
        for _ in 0..8 {
            bp.task_started();
        }
        assert!(bp.should_accept());
    }

    #[test]
    fn test_rejects_above_high_watermark_then_hysteresis() {
        let bp = BackpressureState::new(BackpressureConfig::default(), 10);
        for _ in 0..9 {
            bp.task_started();
        }
        assert!(!bp.should_accept());

        // Dropping to 8/10 (80%) is still above the 70% low watermark.
        bp.task_completed();
        assert!(!bp.should_accept());

        // Dropping to 7/10 (70%) crosses the low watermark.
        bp.task_completed();
        assert!(bp.should_accept());
    }

    #[test]
    fn test_available_slots() {
        let bp = BackpressureState::new(BackpressureConfig::default(), 5);
        bp.task_started();
        bp.task_started();
        assert_eq!(bp.available_slots(), 3);
    }
}
