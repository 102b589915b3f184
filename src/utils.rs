use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};

/// Row timestamp layout of the pulse log, microsecond precision.
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Overlay layout drawn on video frames, truncated to milliseconds.
pub const OVERLAY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(LOG_TIMESTAMP_FORMAT).to_string()
}

#[allow(dead_code)]
pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, LOG_TIMESTAMP_FORMAT)
        .with_context(|| format!("invalid log timestamp {:?}", s))
}

/// Wall-clock source for sample and frame timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall clock, matching what an operator sees on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

#[cfg(test)]
pub mod testing {
    use super::Clock;
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use std::sync::{Arc, Mutex};

    pub fn base_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_micro_opt(12, 0, 0, 0))
            .unwrap()
    }

    /// Ordered record of lifecycle calls, shared between test doubles.
    #[derive(Debug, Clone, Default)]
    pub struct StepLog(Arc<Mutex<Vec<&'static str>>>);

    impl StepLog {
        pub fn push(&self, step: &'static str) {
            self.0.lock().unwrap().push(step);
        }

        pub fn steps(&self) -> Vec<&'static str> {
            self.0.lock().unwrap().clone()
        }
    }

    /// Clock that advances by a fixed step on every read.
    pub struct SteppingClock {
        next: Mutex<NaiveDateTime>,
        step: Duration,
    }

    impl SteppingClock {
        pub fn new(start: NaiveDateTime, step: Duration) -> Self {
            SteppingClock { next: Mutex::new(start), step }
        }
    }

    impl Clock for SteppingClock {
        fn now(&self) -> NaiveDateTime {
            let mut next = self.next.lock().unwrap();
            let now = *next;
            *next = now + self.step;
            now
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_timestamp_format_is_microsecond_padded() {
        let ts = testing::base_time() + Duration::microseconds(42);
        assert_eq!(format_timestamp(&ts), "2024-03-01 12:00:00.000042");
    }

    #[test]
    fn test_timestamp_parse_is_lossless() {
        let ts = testing::base_time() + Duration::microseconds(123_456_789);
        let parsed = parse_timestamp(&format_timestamp(&ts)).unwrap();
        assert_eq!(parsed, ts);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_stepping_clock_advances() {
        let clock = testing::SteppingClock::new(testing::base_time(), Duration::milliseconds(50));
        let a = clock.now();
        let b = clock.now();
        assert_eq!(b - a, Duration::milliseconds(50));
    }
}
