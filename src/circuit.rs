// mlbreaker: Breaker state machine

use crate::config::BreakerConfig;
use std::collections::VecDeque;
use std::time::Instant;

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, all calls admitted
    Closed,
    /// Failing; calls rejected until the deadline passes
    Open,
    /// Probing recovery with a bounded number of trial calls
    HalfOpen,
}

/// Count-based circuit breaker.
///
/// Owned exclusively by the orchestrator; every transition happens under the
/// orchestrator's lock, so the machine itself is a plain struct. Admission
/// (`try_acquire`) and outcome recording (`on_result`) are separate calls
/// because the protected operation runs between them without the lock held.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    /// Sliding buffer of the last `window_size` outcomes, true = success
    outcomes: VecDeque<bool>,
    open_deadline: Option<Instant>,
    /// Trial permits not yet handed out in half-open
    half_open_remaining: u32,
    half_open_completed: u32,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let config = config.validated();
        Self {
            outcomes: VecDeque::with_capacity(config.window_size as usize),
            config,
            state: CircuitState::Closed,
            open_deadline: None,
            half_open_remaining: 0,
            half_open_completed: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn open_deadline(&self) -> Option<Instant> {
        self.open_deadline
    }

    /// Failure rate over the outcome buffer
    pub fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|s| !**s).count();
        failures as f64 / self.outcomes.len() as f64
    }

    pub fn observed_calls(&self) -> usize {
        self.outcomes.len()
    }

    /// Ask to admit one call at `now`. Returns false with no side effects
    /// when the call must be rejected.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let deadline = match self.open_deadline {
                    Some(d) => d,
                    None => return false,
                };
                if now < deadline {
                    return false;
                }
                // Cooldown elapsed: probe recovery
                self.state = CircuitState::HalfOpen;
                self.half_open_remaining = self.config.permitted_half_open_calls;
                self.half_open_completed = 0;
                self.open_deadline = None;
                self.take_half_open_permit()
            }
            CircuitState::HalfOpen => self.take_half_open_permit(),
        }
    }

    fn take_half_open_permit(&mut self) -> bool {
        if self.half_open_remaining == 0 {
            return false;
        }
        self.half_open_remaining -= 1;
        true
    }

    /// Record the outcome of an admitted call at `now` and run transitions
    pub fn on_result(&mut self, success: bool, now: Instant) {
        self.push_outcome(success);

        match self.state {
            CircuitState::Closed => {
                if self.outcomes.len() >= self.config.min_calls as usize
                    && self.failure_rate() >= self.config.failure_rate_threshold
                {
                    self.trip(now);
                }
            }
            CircuitState::HalfOpen => {
                self.half_open_completed += 1;
                if !success {
                    // A failed trial fails the recovery probe outright
                    self.trip(now);
                } else if self.half_open_remaining == 0
                    && self.half_open_completed >= self.config.permitted_half_open_calls
                {
                    // Every permitted trial succeeded
                    self.state = CircuitState::Closed;
                    self.outcomes.clear();
                    self.half_open_completed = 0;
                }
            }
            CircuitState::Open => {
                // Late completion of a call admitted before the trip; the
                // outcome is kept but cannot cause a transition.
            }
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.open_deadline = Some(now + self.config.open_state_wait);
        self.half_open_remaining = 0;
        self.half_open_completed = 0;
    }

    fn push_outcome(&mut self, success: bool) {
        if self.outcomes.len() >= self.config.window_size as usize {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    /// Build a breaker with `config` that preserves this breaker's state:
    /// an open breaker re-enters open with its deadline intact, a half-open
    /// breaker re-enters half-open with a fresh trial counter, and the
    /// outcome buffer survives, truncated from the oldest side to the new
    /// window size.
    pub fn rebuild(&self, config: BreakerConfig) -> Self {
        let config = config.validated();
        let mut outcomes = self.outcomes.clone();
        while outcomes.len() > config.window_size as usize {
            outcomes.pop_front();
        }

        let mut rebuilt = Self {
            outcomes,
            state: self.state,
            open_deadline: self.open_deadline,
            half_open_remaining: 0,
            half_open_completed: 0,
            config,
        };

        if rebuilt.state == CircuitState::HalfOpen {
            rebuilt.half_open_remaining = rebuilt.config.permitted_half_open_calls;
        }

        rebuilt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(window: u32, threshold: f64, wait_ms: u64) -> BreakerConfig {
        BreakerConfig {
            window_size: window,
            failure_rate_threshold: threshold,
            open_state_wait: Duration::from_millis(wait_ms),
            min_calls: 10,
            permitted_half_open_calls: 5,
            ..BreakerConfig::default()
        }
    }

    fn run_outcomes(breaker: &mut CircuitBreaker, outcomes: &[bool], now: Instant) {
        for &success in outcomes {
            assert!(breaker.try_acquire(now));
            breaker.on_result(success, now);
        }
    }

    #[test]
    fn test_closed_admits_everything() {
        let mut breaker = CircuitBreaker::new(config(100, 0.5, 1_000));
        let now = Instant::now();
        for _ in 0..50 {
            assert!(breaker.try_acquire(now));
            breaker.on_result(true, now);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_no_trip_below_min_calls() {
        let mut breaker = CircuitBreaker::new(config(100, 0.5, 1_000));
        let now = Instant::now();
        run_outcomes(&mut breaker, &[false; 9], now);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_trips_at_min_calls_when_threshold_met() {
        let mut breaker = CircuitBreaker::new(config(100, 0.5, 1_000));
        let now = Instant::now();

        // Six failures then four successes: rate 0.6 at the tenth record
        let outcomes = [false, false, false, false, false, false, true, true, true, true];
        run_outcomes(&mut breaker, &outcomes, now);

        assert_eq!(breaker.state(), CircuitState::Open);
        let deadline = breaker.open_deadline().expect("deadline set");
        assert_eq!(deadline, now + Duration::from_millis(1_000));
        assert!(!breaker.try_acquire(now));
    }

    #[test]
    fn test_min_calls_of_straight_failures_trips() {
        let mut breaker = CircuitBreaker::new(config(100, 0.5, 1_000));
        let now = Instant::now();
        run_outcomes(&mut breaker, &[false; 10], now);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_open_rejects_until_deadline() {
        let mut breaker = CircuitBreaker::new(config(100, 0.5, 1_000));
        let now = Instant::now();
        run_outcomes(&mut breaker, &[false; 10], now);

        // One millisecond before the deadline: still rejected
        assert!(!breaker.try_acquire(now + Duration::from_millis(999)));
        assert_eq!(breaker.state(), CircuitState::Open);

        // Past the deadline: a single probe is admitted and state moves
        assert!(breaker.try_acquire(now + Duration::from_millis(1_001)));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_admits_exactly_permitted_probes() {
        let mut breaker = CircuitBreaker::new(config(100, 0.5, 1_000));
        let now = Instant::now();
        run_outcomes(&mut breaker, &[false; 10], now);

        let later = now + Duration::from_millis(1_100);
        for _ in 0..5 {
            assert!(breaker.try_acquire(later));
        }
        // The sixth concurrent probe is rejected
        assert!(!breaker.try_acquire(later));
    }

    #[test]
    fn test_half_open_all_successes_close_and_clear() {
        let mut breaker = CircuitBreaker::new(config(100, 0.5, 1_000));
        let now = Instant::now();
        run_outcomes(&mut breaker, &[false; 10], now);

        let later = now + Duration::from_millis(1_100);
        for _ in 0..5 {
            assert!(breaker.try_acquire(later));
            breaker.on_result(true, later);
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.observed_calls(), 0);
        assert!(breaker.try_acquire(later));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut breaker = CircuitBreaker::new(config(100, 0.5, 1_000));
        let now = Instant::now();
        run_outcomes(&mut breaker, &[false; 10], now);

        let later = now + Duration::from_millis(1_100);
        assert!(breaker.try_acquire(later));
        breaker.on_result(false, later);

        assert_eq!(breaker.state(), CircuitState::Open);
        let deadline = breaker.open_deadline().expect("deadline reset");
        assert_eq!(deadline, later + Duration::from_millis(1_000));
    }

    #[test]
    fn test_outcome_buffer_bounded_by_window_size() {
        let mut breaker = CircuitBreaker::new(config(10, 0.9, 1_000));
        let now = Instant::now();
        for _ in 0..50 {
            assert!(breaker.try_acquire(now));
            breaker.on_result(true, now);
        }
        assert_eq!(breaker.observed_calls(), 10);
    }

    #[test]
    fn test_window_slides_old_failures_out() {
        let mut breaker = CircuitBreaker::new(config(10, 0.8, 1_000));
        let now = Instant::now();

        // Five failures, then enough successes to push them out
        run_outcomes(&mut breaker, &[false; 5], now);
        run_outcomes(&mut breaker, &[true; 10], now);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_rate(), 0.0);
    }

    #[test]
    fn test_rebuild_preserves_closed_state_and_buffer() {
        let mut breaker = CircuitBreaker::new(config(100, 0.5, 1_000));
        let now = Instant::now();
        run_outcomes(&mut breaker, &[true, false, true], now);

        let rebuilt = breaker.rebuild(config(50, 0.3, 5_000));
        assert_eq!(rebuilt.state(), CircuitState::Closed);
        assert_eq!(rebuilt.observed_calls(), 3);
        assert_eq!(rebuilt.config().window_size, 50);
    }

    #[test]
    fn test_rebuild_truncates_buffer_to_new_window() {
        let mut breaker = CircuitBreaker::new(config(100, 0.9, 1_000));
        let now = Instant::now();
        run_outcomes(&mut breaker, &[true; 40], now);

        let rebuilt = breaker.rebuild(config(10, 0.9, 1_000));
        assert_eq!(rebuilt.observed_calls(), 10);
    }

    #[test]
    fn test_rebuild_preserves_open_deadline() {
        let mut breaker = CircuitBreaker::new(config(100, 0.5, 10_000));
        let now = Instant::now();
        run_outcomes(&mut breaker, &[false; 10], now);
        let deadline = breaker.open_deadline().expect("deadline");

        let rebuilt = breaker.rebuild(config(50, 0.6, 20_000));
        assert_eq!(rebuilt.state(), CircuitState::Open);
        assert_eq!(rebuilt.open_deadline(), Some(deadline));

        // Still rejecting before the preserved deadline
        let mut rebuilt = rebuilt;
        assert!(!rebuilt.try_acquire(now + Duration::from_millis(1)));
    }

    #[test]
    fn test_rebuild_half_open_gets_fresh_trial_counter() {
        let mut breaker = CircuitBreaker::new(config(100, 0.5, 1_000));
        let now = Instant::now();
        run_outcomes(&mut breaker, &[false; 10], now);

        let later = now + Duration::from_millis(1_100);
        assert!(breaker.try_acquire(later));
        breaker.on_result(true, later);
        assert!(breaker.try_acquire(later));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let mut rebuilt = breaker.rebuild(config(100, 0.5, 1_000));
        assert_eq!(rebuilt.state(), CircuitState::HalfOpen);
        for _ in 0..5 {
            assert!(rebuilt.try_acquire(later));
        }
        assert!(!rebuilt.try_acquire(later));
    }
}
