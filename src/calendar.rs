use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use chrono_tz::America::New_York;
use std::sync::Mutex;

// =============================
// === Clock and Virtual Time ===
// =============================

/// A monotonic wall-clock source. Injected everywhere time is read so that tests advance
/// virtual time instead of sleeping.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
/// The real system clock.
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
/// A hand-cranked clock for tests. Starts at a fixed instant and only moves when told to.
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    #[must_use]
    /// A manual clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(Mutex::new(start))
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut t = self.0.lock().expect("clock lock poisoned");
        *t += by;
    }

    /// Jump the clock to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.0.lock().expect("clock lock poisoned") = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().expect("clock lock poisoned")
    }
}

// =======================
// === Market Calendar ===
// =======================

/// Answers "is the market open right now". Injected so tests can hold the market open
/// regardless of the (virtual) date.
pub trait MarketCalendar: Send + Sync {
    /// Whether `at` falls within regular trading hours.
    fn is_rth(&self, at: DateTime<Utc>) -> bool;

    /// Whether `at` is within RTH or within the grace tail after the close. The supervisor
    /// keeps cycling through the tail so in-flight fills complete.
    fn is_rth_or_tail(&self, at: DateTime<Utc>, tail: Duration) -> bool {
        self.is_rth(at) || self.is_rth(at - tail)
    }
}

#[derive(Debug, Default, Clone, Copy)]
/// The NYSE regular session: weekdays 09:30–16:00 US/Eastern. Exchange holidays are not
/// modeled; on a holiday no ticks arrive and every phase is a no-op.
pub struct NyseCalendar;

impl MarketCalendar for NyseCalendar {
    fn is_rth(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&New_York);
        if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        let t = local.time();
        let open = NaiveTime::from_hms_opt(9, 30, 0).expect("valid open time");
        let close = NaiveTime::from_hms_opt(16, 0, 0).expect("valid close time");
        t >= open && t < close
    }
}

#[derive(Debug, Default, Clone, Copy)]
/// A calendar with no closing bell. Used in tests and paper sessions.
pub struct AlwaysOpen;

impl MarketCalendar for AlwaysOpen {
    #[inline]
    fn is_rth(&self, _at: DateTime<Utc>) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn nyse_session_bounds() {
        let cal = NyseCalendar;
        // Wednesday 2019-01-16, 10:00 ET == 15:00 UTC.
        let mid_session = Utc.with_ymd_and_hms(2019, 1, 16, 15, 0, 0).unwrap();
        assert!(cal.is_rth(mid_session));

        // 09:00 ET is pre-open; 16:20 ET is after the close but within a 30-minute tail.
        let pre_open = Utc.with_ymd_and_hms(2019, 1, 16, 14, 0, 0).unwrap();
        assert!(!cal.is_rth(pre_open));
        let after = Utc.with_ymd_and_hms(2019, 1, 16, 21, 20, 0).unwrap();
        assert!(!cal.is_rth(after));
        assert!(cal.is_rth_or_tail(after, Duration::minutes(30)));
        assert!(!cal.is_rth_or_tail(after + Duration::minutes(20), Duration::minutes(30)));

        // Saturday.
        let weekend = Utc.with_ymd_and_hms(2019, 1, 19, 15, 0, 0).unwrap();
        assert!(!cal.is_rth(weekend));
    }

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2019, 1, 16, 15, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::seconds(90));
        assert_eq!(clock.now(), start + Duration::seconds(90));
    }
}
