//! Reconnection Policy
//!
//! Two-tier bounded backoff: a cycle allows `MAX_ATTEMPTS_PER_CYCLE` attempts
//! with linearly growing delays; exhausting a cycle starts the next one after
//! a fixed cooldown; exhausting `MAX_CYCLES` gives up until the user connects
//! manually. The policy also owns the pending reconnect timer so that an
//! intentional disconnect can cancel it.

use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

pub const MAX_ATTEMPTS_PER_CYCLE: u32 = 5;
pub const MAX_CYCLES: u32 = 3;
pub const ATTEMPT_DELAY_STEP: Duration = Duration::from_secs(3);
pub const CYCLE_COOLDOWN: Duration = Duration::from_secs(60);

/// Position within the retry schedule. `(0, 1)` means "no failures yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryState {
    pub attempt: u32,
    pub cycle: u32,
}

impl Default for RetryState {
    fn default() -> Self {
        Self { attempt: 0, cycle: 1 }
    }
}

/// What the controller should do after an unintentional disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reconnect after `delay`. `cooldown` is set on the first attempt of a
    /// new cycle.
    Retry {
        attempt: u32,
        cycle: u32,
        delay: Duration,
        cooldown: bool,
    },
    /// Every tier is exhausted; only a manual connect clears this.
    GiveUp,
}

/// A reconnect scheduled to run after a delay. Dropping it does not cancel
/// the timer; call [`ScheduledRetry::cancel`].
#[derive(Debug)]
pub struct ScheduledRetry {
    handle: JoinHandle<()>,
}

impl ScheduledRetry {
    pub fn cancel(self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[derive(Debug, Default)]
pub struct RetryPolicy {
    state: RetryState,
    exhausted: bool,
    pending: Option<ScheduledRetry>,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// True once every cycle has been used up.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Advances the counters for one more unintentional disconnect.
    pub fn on_failure(&mut self) -> RetryDecision {
        if self.exhausted {
            return RetryDecision::GiveUp;
        }
        let next_attempt = self.state.attempt + 1;
        if next_attempt <= MAX_ATTEMPTS_PER_CYCLE {
            self.state.attempt = next_attempt;
            return RetryDecision::Retry {
                attempt: next_attempt,
                cycle: self.state.cycle,
                delay: ATTEMPT_DELAY_STEP * next_attempt,
                cooldown: false,
            };
        }
        if self.state.cycle >= MAX_CYCLES {
            self.exhausted = true;
            return RetryDecision::GiveUp;
        }
        self.state = RetryState {
            attempt: 1,
            cycle: self.state.cycle + 1,
        };
        RetryDecision::Retry {
            attempt: 1,
            cycle: self.state.cycle,
            delay: CYCLE_COOLDOWN,
            cooldown: true,
        }
    }

    /// A handshake completed: start over.
    pub fn on_success(&mut self) {
        self.reset();
    }

    /// Clears counters and the give-up flag. Used for manual connects and
    /// authorization failures.
    pub fn reset(&mut self) {
        self.state = RetryState::default();
        self.exhausted = false;
    }

    /// Schedules `task` to run after `delay`, replacing any pending timer.
    pub fn arm<F>(&mut self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel_pending();
        debug!(?delay, "Arming reconnect timer");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        self.pending = Some(ScheduledRetry { handle });
    }

    /// Cancels the pending timer, if any. Returns whether one was pending.
    pub fn cancel_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(retry) if !retry.is_finished() => {
                debug!("Cancelled pending reconnect timer");
                retry.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|r| !r.is_finished())
    }

    /// Marks the pending timer as consumed once it has fired.
    pub fn take_fired(&mut self) {
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn initial_state_is_zero_attempts_in_cycle_one() {
        let policy = RetryPolicy::new();
        assert_eq!(policy.state(), RetryState { attempt: 0, cycle: 1 });
        assert!(!policy.is_exhausted());
    }

    #[test]
    fn first_cycle_delays_grow_linearly() {
        let mut policy = RetryPolicy::new();
        let delays: Vec<u64> = (0..5)
            .map(|_| match policy.on_failure() {
                RetryDecision::Retry { delay, cycle, cooldown, .. } => {
                    assert_eq!(cycle, 1);
                    assert!(!cooldown);
                    delay.as_secs()
                }
                RetryDecision::GiveUp => panic!("gave up too early"),
            })
            .collect();
        assert_eq!(delays, vec![3, 6, 9, 12, 15]);
    }

    #[test]
    fn sixth_failure_cools_down_into_cycle_two() {
        let mut policy = RetryPolicy::new();
        for _ in 0..5 {
            policy.on_failure();
        }
        assert_eq!(
            policy.on_failure(),
            RetryDecision::Retry {
                attempt: 1,
                cycle: 2,
                delay: CYCLE_COOLDOWN,
                cooldown: true
            }
        );
        assert_eq!(
            policy.on_failure(),
            RetryDecision::Retry {
                attempt: 2,
                cycle: 2,
                delay: Duration::from_secs(6),
                cooldown: false
            }
        );
    }

    #[test]
    fn state_after_n_failures_matches_closed_form() {
        for n in 1..=15u32 {
            let mut policy = RetryPolicy::new();
            for _ in 0..n {
                policy.on_failure();
            }
            let expected = RetryState {
                attempt: (n - 1) % 5 + 1,
                cycle: n.div_ceil(5),
            };
            assert_eq!(policy.state(), expected, "after {n} failures");
        }
    }

    #[test]
    fn gives_up_after_three_cycles_and_stays_given_up() {
        let mut policy = RetryPolicy::new();
        for _ in 0..15 {
            assert!(matches!(policy.on_failure(), RetryDecision::Retry { .. }));
        }
        assert_eq!(policy.on_failure(), RetryDecision::GiveUp);
        assert!(policy.is_exhausted());
        assert_eq!(policy.on_failure(), RetryDecision::GiveUp);
        assert_eq!(policy.state(), RetryState { attempt: 5, cycle: 3 });
    }

    #[test]
    fn success_and_manual_reset_start_over() {
        let mut policy = RetryPolicy::new();
        for _ in 0..7 {
            policy.on_failure();
        }
        policy.on_success();
        assert_eq!(policy.state(), RetryState::default());

        for _ in 0..16 {
            policy.on_failure();
        }
        assert!(policy.is_exhausted());
        policy.reset();
        assert!(!policy.is_exhausted());
        assert!(matches!(policy.on_failure(), RetryDecision::Retry { attempt: 1, cycle: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn armed_timer_fires_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let mut policy = RetryPolicy::new();
        policy.arm(Duration::from_secs(3), async move {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(policy.has_pending());

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let mut policy = RetryPolicy::new();
        policy.arm(Duration::from_secs(3), async move {
            flag.store(true, Ordering::SeqCst);
        });
        assert!(policy.cancel_pending());
        assert!(!policy.has_pending());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
