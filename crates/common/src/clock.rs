use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Local, NaiveDateTime};
use parking_lot::Mutex;

use crate::types::Ds;

/// Source of time for the engine.
///
/// Retry scheduling runs on a monotonic decisecond counter; debris
/// folder names need the local wall clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> Ds;

    fn local_time(&self) -> NaiveDateTime;
}

/// Wall and monotonic time of the running process
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Ds {
        // starts at 1 so an initial deadline of zero always reads as "armed"
        (self.start.elapsed().as_millis() / 100) as Ds + 1
    }

    fn local_time(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

#[derive(Debug)]
struct ManualInner {
    ds: Ds,
    time: NaiveDateTime,
}

/// Clock advanced explicitly; shared between the engine and whoever drives it.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualInner>>,
}

impl ManualClock {
    pub fn new(time: NaiveDateTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualInner { ds: 1, time })),
        }
    }

    /// Move both clocks forward by `ds` deciseconds
    pub fn advance(&self, ds: Ds) {
        let mut inner = self.inner.lock();
        inner.ds = inner.ds.saturating_add(ds);
        inner.time += Duration::milliseconds(ds as i64 * 100);
    }

    pub fn set_local_time(&self, time: NaiveDateTime) {
        self.inner.lock().time = time;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Ds {
        self.inner.lock().ds
    }

    fn local_time(&self) -> NaiveDateTime {
        self.inner.lock().time
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::NaiveDate;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap()
    }

    #[test]
    fn test_manual_clock_moves_both_clocks() {
        let clock = ManualClock::new(noon());
        assert_eq!(clock.now(), 1);

        clock.advance(36_000);
        assert_eq!(clock.now(), 36_001);
        assert_eq!(clock.local_time(), noon() + Duration::hours(1));
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new(noon());
        let other = clock.clone();
        other.advance(5);
        assert_eq!(clock.now(), 6);
    }

    #[test]
    fn test_system_clock_never_reads_zero() {
        assert!(SystemClock::new().now() >= 1);
    }
}
