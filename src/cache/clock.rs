//! Time source for cache timestamps and TTL checks.

use std::sync::Mutex;

use time::{Duration, OffsetDateTime};

use crate::util::lock::mutex_lock;

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock in UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to. Used to pin TTL boundaries in tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = mutex_lock(&self.now, "cache::clock", "advance");
        *now += by;
    }

    pub fn set(&self, to: OffsetDateTime) {
        *mutex_lock(&self.now, "cache::clock", "set") = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *mutex_lock(&self.now, "cache::clock", "now")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn manual_clock_moves_only_on_request() {
        let clock = ManualClock::new(datetime!(2024-01-01 00:00 UTC));
        assert_eq!(clock.now(), datetime!(2024-01-01 00:00 UTC));

        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), datetime!(2024-01-01 00:01:30 UTC));

        clock.set(datetime!(2025-06-01 08:00 UTC));
        assert_eq!(clock.now(), datetime!(2025-06-01 08:00 UTC));
    }
}
