// Circuit breaker guarding connection attempts

use log::{info, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    max_failures: u32,
    failures: u32,
    open: bool,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32) -> Self {
        CircuitBreaker {
            max_failures,
            failures: 0,
            open: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Count one connection failure. Returns true exactly when this
    /// failure tripped a previously closed circuit.
    pub fn record_failure(&mut self) -> bool {
        self.failures += 1;
        info!("Connection failure count: {}/{}", self.failures, self.max_failures);
        if self.failures > self.max_failures && !self.open {
            self.open = true;
            warn!("Circuit opened after {} consecutive failures", self.failures);
            return true;
        }
        false
    }

    /// A healthy signal (connect or pong). Clears the counter but leaves
    /// an open circuit open; only `reset` closes it.
    pub fn record_success(&mut self) {
        if self.failures > 0 {
            info!("Healthy signal, clearing failure count ({})", self.failures);
        }
        self.failures = 0;
    }

    /// Clear the counter and close the circuit. Returns whether it was open.
    pub fn reset(&mut self) -> bool {
        let was_open = self.open;
        if self.failures > 0 || was_open {
            info!("Resetting failure count ({}) and closing circuit (was open: {})", self.failures, was_open);
        }
        self.failures = 0;
        self.open = false;
        was_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_only_after_exceeding_limit() {
        let mut breaker = CircuitBreaker::new(3);
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(!breaker.is_open());
        assert!(breaker.record_failure(), "Fourth failure should open the circuit");
        assert!(breaker.is_open());
        // Further failures do not re-trip
        assert!(!breaker.record_failure());
        assert_eq!(breaker.failures(), 5);
    }

    #[test]
    fn test_success_clears_count_but_not_open_state() {
        let mut breaker = CircuitBreaker::new(1);
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_open());
        breaker.record_success();
        assert_eq!(breaker.failures(), 0);
        assert!(breaker.is_open());

        assert!(breaker.reset());
        assert!(!breaker.is_open());
        assert!(!breaker.reset());
    }
}
