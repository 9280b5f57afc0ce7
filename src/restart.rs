//! The restart tracker (C4): a pure decision function plus per-service
//! counters. See `spec.md` §3 (`RestartTracker`) and §4.3.

use crate::config::{RestartConfig, RestartPolicyKind};
use std::time::{Duration, Instant};

/// The cap on `attempts` used when computing the exponential backoff
/// exponent, preventing `2^attempts` from overflowing. See `spec.md`
/// §4.3 ("next_delay").
const MAX_BACKOFF_EXPONENT: u32 = 30;

#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicyKind,
    max_retries: u32,
    base_delay: Duration,
    delay_max: Duration,
    stability_window: Duration,
    attempts: u32,
    last_attempt: Option<Instant>,
}

impl RestartTracker {
    pub fn new(config: &RestartConfig) -> Self {
        Self {
            policy: config.policy,
            max_retries: config.max_retries,
            base_delay: config.delay,
            delay_max: config.effective_delay_max(),
            stability_window: config.stability_window,
            attempts: 0,
            last_attempt: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether another restart should be attempted given the exit code
    /// that was just observed. Pure with respect to `self`: it reads but
    /// does not mutate the attempt counter.
    pub fn should_restart(&self, exit_code: i32) -> bool {
        match self.policy {
            RestartPolicyKind::Always => self.attempts < self.max_retries,
            RestartPolicyKind::OnFailure => exit_code != 0 && self.attempts < self.max_retries,
            RestartPolicyKind::Never => false,
            // The caller short-circuits on an explicit `stop` before this
            // is ever consulted, per `spec.md` §4.3.
            RestartPolicyKind::UnlessStopped => true,
        }
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
        self.last_attempt = Some(Instant::now());
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// "A process that has been stable for `window` earns a clean retry
    /// budget" — `spec.md` §4.3.
    pub fn maybe_reset(&mut self, uptime: Duration) {
        if uptime >= self.stability_window {
            self.reset();
        }
    }

    /// `base * 2^min(attempts, 30)`, capped at `delay_max`. Always
    /// finite and non-negative.
    pub fn next_delay(&self) -> Duration {
        let exponent = self.attempts.min(MAX_BACKOFF_EXPONENT);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let scaled = self.base_delay.checked_mul(factor as u32).unwrap_or(self.delay_max);
        scaled.min(self.delay_max)
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tracker(policy: RestartPolicyKind, max_retries: u32, delay: Duration, delay_max: Option<Duration>) -> RestartTracker {
        RestartTracker::new(&RestartConfig {
            policy,
            max_retries,
            delay,
            delay_max,
            stability_window: Duration::from_secs(300),
        })
    }

    /// Scenario 1 in `spec.md` §8: policy=on_failure, max_retries=5,
    /// delay=1s, delay_max=30s -> 1s, 2s, 4s, 8s, 16s, 30s(cap).
    #[test]
    fn exponential_backoff_matches_scenario() {
        let mut t = tracker(
            RestartPolicyKind::OnFailure,
            5,
            Duration::from_secs(1),
            Some(Duration::from_secs(30)),
        );
        let expected = [1, 2, 4, 8, 16, 30];
        for expected_secs in expected {
            assert_eq!(t.next_delay(), Duration::from_secs(expected_secs));
            t.record_attempt();
        }
    }

    /// Scenario 2 in `spec.md` §8: stability_window=1m; 3 attempts; then
    /// maybe_reset(59s) keeps 3; maybe_reset(60s) resets to 0.
    #[test]
    fn stability_window_resets_after_enough_uptime() {
        let mut t = RestartTracker::new(&RestartConfig {
            policy: RestartPolicyKind::Always,
            max_retries: 10,
            delay: Duration::from_secs(1),
            delay_max: None,
            stability_window: Duration::from_secs(60),
        });
        for _ in 0..3 {
            t.record_attempt();
        }
        assert_eq!(t.attempts(), 3);
        t.maybe_reset(Duration::from_secs(59));
        assert_eq!(t.attempts(), 3);
        t.maybe_reset(Duration::from_secs(60));
        assert_eq!(t.attempts(), 0);
    }

    /// Scenario 3 in `spec.md` §8: policy=on_failure, max_retries=3.
    #[test]
    fn exhaustion_after_max_retries() {
        let mut t = tracker(RestartPolicyKind::OnFailure, 3, Duration::from_millis(1), None);
        assert!(!t.is_exhausted());
        for _ in 0..3 {
            assert!(t.should_restart(1));
            t.record_attempt();
        }
        assert!(t.is_exhausted());
        assert!(!t.should_restart(1));
    }

    /// `spec.md` §4.3's per-policy `should_restart` table, at zero prior
    /// attempts (well under any `max_retries`).
    #[rstest]
    #[case::always_clean_exit(RestartPolicyKind::Always, 0, true)]
    #[case::always_failure(RestartPolicyKind::Always, 1, true)]
    #[case::never_clean_exit(RestartPolicyKind::Never, 0, false)]
    #[case::never_failure(RestartPolicyKind::Never, 1, false)]
    #[case::on_failure_clean_exit(RestartPolicyKind::OnFailure, 0, false)]
    #[case::on_failure_failure(RestartPolicyKind::OnFailure, 1, true)]
    #[case::unless_stopped_clean_exit(RestartPolicyKind::UnlessStopped, 0, true)]
    #[case::unless_stopped_failure(RestartPolicyKind::UnlessStopped, 1, true)]
    fn should_restart_matches_policy_table(
        #[case] policy: RestartPolicyKind,
        #[case] exit_code: i32,
        #[case] expected: bool,
    ) {
        let t = tracker(policy, 5, Duration::from_secs(1), None);
        assert_eq!(t.should_restart(exit_code), expected);
    }

    #[test]
    fn delay_max_defaults_to_ten_times_base() {
        let config = RestartConfig {
            policy: RestartPolicyKind::Always,
            max_retries: 100,
            delay: Duration::from_secs(2),
            delay_max: None,
            stability_window: Duration::from_secs(300),
        };
        let mut t = RestartTracker::new(&config);
        for _ in 0..MAX_BACKOFF_EXPONENT + 5 {
            t.record_attempt();
        }
        assert_eq!(t.next_delay(), Duration::from_secs(20));
    }

    #[test]
    fn record_then_reset_zeroes_attempts() {
        let mut t = tracker(RestartPolicyKind::Always, 10, Duration::from_secs(1), None);
        for _ in 0..4 {
            t.record_attempt();
        }
        assert_eq!(t.attempts(), 4);
        t.reset();
        assert_eq!(t.attempts(), 0);
    }

    #[test]
    fn next_delay_never_exceeds_cap_even_at_huge_exponents() {
        let t = tracker(RestartPolicyKind::Always, u32::MAX, Duration::from_secs(1), Some(Duration::from_secs(60)));
        // Invariant 2 in `spec.md` §8: next_delay() is in [0, delay_max].
        assert!(t.next_delay() <= Duration::from_secs(60));
    }
}
