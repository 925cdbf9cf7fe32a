//! Inter-cycle sleep math and the cancellable sleep primitive shared by
//! the single-shot and polling run modes in `main`.

use std::time::Duration;

use mailsweep_helpers::shutdown::Signals;
use rand::Rng;

const MIN_SLEEP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Completed,
    Interrupted,
}

impl SleepOutcome {
    pub fn is_interrupted(self) -> bool {
        matches!(self, SleepOutcome::Interrupted)
    }
}

/// Sleeps for `duration`, cut short by either signal: a "wake" returns
/// `Completed` immediately so the next cycle starts right away; an
/// "interrupt" returns `Interrupted` so the caller can stop the loop.
pub async fn sleep_cancellable(duration: Duration, signals: &Signals) -> SleepOutcome {
    tokio::select! {
        _ = tokio::time::sleep(duration) => SleepOutcome::Completed,
        _ = signals.wake.notified() => SleepOutcome::Completed,
        _ = signals.interrupt.cancelled() => SleepOutcome::Interrupted,
    }
}

/// Draws a uniform integer number of seconds in `[0, jitter]`.
pub fn jittered(jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return Duration::ZERO;
    }
    let max_secs = jitter.as_secs().max(1);
    let draw = rand::thread_rng().gen_range(0..=max_secs);
    Duration::from_secs(draw)
}

/// `max(60, interval - elapsed) + jitter`, the next inter-cycle sleep.
pub fn next_delay(interval: Duration, elapsed: Duration, jitter: Duration) -> Duration {
    interval.saturating_sub(elapsed).max(MIN_SLEEP) + jittered(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_never_goes_below_the_floor() {
        let delay = next_delay(Duration::from_secs(30), Duration::from_secs(100), Duration::ZERO);
        assert_eq!(delay, MIN_SLEEP);
    }

    #[test]
    fn next_delay_accounts_for_elapsed_time() {
        let delay = next_delay(Duration::from_secs(300), Duration::from_secs(100), Duration::ZERO);
        assert_eq!(delay, Duration::from_secs(200));
    }

    #[test]
    fn jittered_is_bounded_by_input() {
        for _ in 0..50 {
            let draw = jittered(Duration::from_secs(10));
            assert!(draw <= Duration::from_secs(10));
        }
    }

    #[test]
    fn jittered_zero_is_always_zero() {
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn wake_signal_cuts_sleep_short() {
        let signals = Signals::new();
        let waiter = signals.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waiter.wake.notify_waiters();
        });

        let started = tokio::time::Instant::now();
        let outcome = sleep_cancellable(Duration::from_secs(3600), &signals).await;
        assert_eq!(outcome, SleepOutcome::Completed);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_signal_stops_sleep_immediately() {
        let signals = Signals::new();
        signals.interrupt.cancel();
        let outcome = sleep_cancellable(Duration::from_secs(3600), &signals).await;
        assert!(outcome.is_interrupted());
    }
}
