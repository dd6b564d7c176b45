use serde::{Deserialize, Serialize};

use crate::types::Ds;

/// Largest interval an exponential backoff grows to (one hour)
pub const DEFAULT_BACKOFF_CAP: Ds = 36000;

/// Retry scheduling primitive on the decisecond clock.
///
/// A timer is *armed* when its deadline has passed (or it has none).
/// Each call to [`BackoffTimer::backoff`] schedules the next attempt and
/// doubles the following interval, up to the configured cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffTimer {
    next: Ds,
    delta: Ds,
    cap: Ds,
}

impl Default for BackoffTimer {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_CAP)
    }
}

impl BackoffTimer {
    pub fn new(cap: Ds) -> Self {
        Self {
            next: 0,
            delta: 1,
            cap: cap.max(1),
        }
    }

    /// Clear any deadline and restart the interval sequence
    pub fn reset(&mut self) {
        self.next = 0;
        self.delta = 1;
    }

    /// Schedule the next attempt after the current interval, then grow it
    pub fn backoff(&mut self, now: Ds) {
        self.next = now.saturating_add(self.delta);
        self.delta = self.delta.saturating_mul(2).min(self.cap);
    }

    /// Schedule the next attempt after a fixed delay
    pub fn backoff_for(&mut self, now: Ds, delay: Ds) {
        self.next = now.saturating_add(delay.max(1));
        self.delta = 1;
    }

    /// Make the timer fire on the next check
    pub fn arm(&mut self) {
        self.next = 0;
        self.delta = 1;
    }

    pub fn armed(&self, now: Ds) -> bool {
        self.next == 0 || now >= self.next
    }

    /// Deciseconds until the timer fires (zero if armed)
    pub fn retry_in(&self, now: Ds) -> Ds {
        if self.armed(now) {
            0
        } else {
            self.next - now
        }
    }

    /// Interval the next call to [`BackoffTimer::backoff`] will use
    pub fn delta(&self) -> Ds {
        self.delta
    }

    /// Pull `wake_at` forward to this timer's deadline if it is earlier
    pub fn update(&self, wake_at: &mut Option<Ds>) {
        if self.next == 0 {
            return;
        }
        match wake_at {
            Some(at) if *at <= self.next => {}
            _ => *wake_at = Some(self.next),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let mut bt = BackoffTimer::new(8);
        assert!(bt.armed(5));

        bt.backoff(10);
        assert!(!bt.armed(10));
        assert!(bt.armed(11));

        bt.backoff(11);
        assert_eq!(bt.retry_in(11), 2);
        bt.backoff(13);
        assert_eq!(bt.retry_in(13), 4);
        bt.backoff(17);
        assert_eq!(bt.retry_in(17), 8);
        bt.backoff(25);
        assert_eq!(bt.retry_in(25), 8);
    }

    #[test]
    fn test_reset_and_arm() {
        let mut bt = BackoffTimer::default();
        bt.backoff(100);
        bt.backoff(101);
        assert!(!bt.armed(101));
        bt.arm();
        assert!(bt.armed(101));
        assert_eq!(bt.delta(), 1);
    }

    #[test]
    fn test_update_picks_earliest_deadline() {
        let mut a = BackoffTimer::default();
        let mut b = BackoffTimer::default();
        a.backoff_for(10, 50);
        b.backoff_for(10, 20);

        let mut wake = None;
        a.update(&mut wake);
        assert_eq!(wake, Some(60));
        b.update(&mut wake);
        assert_eq!(wake, Some(30));
        BackoffTimer::default().update(&mut wake);
        assert_eq!(wake, Some(30));
    }
}
