//! Injectable time source.
//!
//! The manager never calls `Local::now()` directly; it goes through a
//! [`Clock`] so tests can drive TTL expiry deterministically.

use std::sync::Mutex;

use chrono::{DateTime, Duration, Local, SecondsFormat};

/// A source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current local time.
    fn now(&self) -> DateTime<Local>;

    /// Current time in Unix milliseconds.
    fn now_ms(&self) -> u64 {
        self.now().timestamp_millis().max(0) as u64
    }

    /// Current time as ISO-8601 with millisecond precision and local offset.
    fn now_iso(&self) -> String {
        self.now().to_rfc3339_opts(SecondsFormat::Millis, false)
    }
}

/// The real wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// A manually advanced clock for tests.
pub struct ManualClock {
    now: Mutex<DateTime<Local>>,
}

impl ManualClock {
    /// Start the clock at the current wall time.
    pub fn starting_now() -> Self {
        Self {
            now: Mutex::new(Local::now()),
        }
    }

    /// Advance the clock by `seconds`.
    pub fn advance_secs(&self, seconds: i64) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += Duration::seconds(seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().expect("clock lock poisoned")
    }
}
