//! Restart policy engine. Pure decision logic: given the restart history of
//! a process and its configured policy, decide whether to restart after an
//! unexpected exit and how long to wait first.

use std::time::Duration;

use crate::process::RestartConfig;

/// Backoff never escalates past this multiple of the base delay.
pub const BACKOFF_CAP_MULTIPLIER: u64 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Re-enter `launching` after `delay`; the caller stores `next_streak`
    /// as the new consecutive-unstable-exit count.
    Restart { delay: Duration, next_streak: u32 },
    /// Crash budget exhausted; transition to `errored`.
    GiveUp,
}

/// An exit is stable when the process stayed up for at least `min_uptime`.
pub fn is_stable_exit(uptime_ms: u64, min_uptime_ms: u64) -> bool {
    uptime_ms >= min_uptime_ms
}

/// 2^streak clamped at the cap; a streak of zero means the base delay.
pub fn backoff_multiplier(streak: u32) -> u64 {
    1_u64
        .checked_shl(streak)
        .unwrap_or(u64::MAX)
        .min(BACKOFF_CAP_MULTIPLIER)
}

pub fn backoff_delay(base_delay_ms: u64, streak: u32) -> Duration {
    Duration::from_millis(base_delay_ms.saturating_mul(backoff_multiplier(streak)))
}

/// Evaluate an unexpected exit. `restart_count` is the cumulative crash
/// restart count, `unstable_streak` the consecutive unstable exits before
/// this one, `uptime_ms` how long this incarnation ran.
pub fn evaluate(
    config: &RestartConfig,
    restart_count: u32,
    unstable_streak: u32,
    uptime_ms: u64,
) -> Decision {
    if config.max_restarts != 0 && restart_count >= config.max_restarts {
        return Decision::GiveUp;
    }

    let next_streak = if is_stable_exit(uptime_ms, config.min_uptime_ms) {
        0
    } else {
        unstable_streak.saturating_add(1)
    };

    Decision::Restart {
        delay: backoff_delay(config.restart_delay_ms, next_streak),
        next_streak,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{backoff_delay, evaluate, Decision};
    use crate::process::RestartConfig;

    fn config(max_restarts: u32) -> RestartConfig {
        RestartConfig {
            max_restarts,
            restart_delay_ms: 1000,
            min_uptime_ms: 5000,
            kill_timeout_ms: 1600,
        }
    }

    #[test]
    fn unlimited_budget_never_gives_up() {
        let config = config(0);
        for restart_count in [0, 1, 100, u32::MAX] {
            let decision = evaluate(&config, restart_count, 3, 0);
            assert!(
                matches!(decision, Decision::Restart { .. }),
                "max_restarts=0 must always restart, got {decision:?} at count {restart_count}"
            );
        }
    }

    #[test]
    fn unstable_streak_doubles_delay_up_to_cap() {
        for (streak, expected_ms) in [
            (1_u32, 2000_u64),
            (2, 4000),
            (3, 8000),
            (4, 16000),
            (5, 32000),
            (6, 32000),
            (20, 32000),
        ] {
            assert_eq!(
                backoff_delay(1000, streak),
                Duration::from_millis(expected_ms),
                "streak {streak}"
            );
        }
    }

    #[test]
    fn stable_exit_resets_streak_and_uses_base_delay() {
        let config = config(0);
        let decision = evaluate(&config, 7, 12, config.min_uptime_ms + 1);
        assert_eq!(
            decision,
            Decision::Restart {
                delay: Duration::from_millis(1000),
                next_streak: 0,
            }
        );
    }

    #[test]
    fn uptime_exactly_min_uptime_counts_as_stable() {
        let config = config(0);
        match evaluate(&config, 0, 4, config.min_uptime_ms) {
            Decision::Restart { delay, next_streak } => {
                assert_eq!(delay, Duration::from_millis(1000));
                assert_eq!(next_streak, 0);
            }
            Decision::GiveUp => panic!("stable exit must restart"),
        }
    }

    #[test]
    fn budget_is_checked_before_escalation() {
        let config = config(3);
        assert!(matches!(evaluate(&config, 3, 3, 0), Decision::GiveUp));
        assert!(matches!(evaluate(&config, 4, 0, 0), Decision::GiveUp));
        assert!(matches!(
            evaluate(&config, 2, 2, 0),
            Decision::Restart { .. }
        ));
    }

    #[test]
    fn four_fast_crashes_with_budget_of_three() {
        // max_restarts=3, delay=1000, min_uptime=5000, each run dies after 1s.
        let config = config(3);
        let mut restart_count = 0_u32;
        let mut streak = 0_u32;
        let mut delays = Vec::new();

        for _ in 0..3 {
            match evaluate(&config, restart_count, streak, 1000) {
                Decision::Restart { delay, next_streak } => {
                    delays.push(delay.as_millis() as u64);
                    streak = next_streak;
                    restart_count += 1;
                }
                Decision::GiveUp => panic!("budget should not be exhausted yet"),
            }
        }

        assert_eq!(delays, vec![2000, 4000, 8000]);
        assert_eq!(restart_count, 3);
        assert!(matches!(
            evaluate(&config, restart_count, streak, 1000),
            Decision::GiveUp
        ));
    }

    #[test]
    fn zero_base_delay_restarts_immediately() {
        let config = RestartConfig {
            restart_delay_ms: 0,
            ..config(0)
        };
        match evaluate(&config, 0, 0, 0) {
            Decision::Restart { delay, .. } => assert_eq!(delay, Duration::ZERO),
            Decision::GiveUp => panic!("unexpected give-up"),
        }
    }
}
