//! Admission gate: the time window during which new claims are attempted.
//!
//! Outside the window the worker loop keeps running (heartbeats for an
//! in-flight job are unaffected) but skips claiming and merely sleeps.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;

/// Configured active-hours window, evaluated in a fixed timezone.
#[derive(Debug, Clone)]
pub struct ActiveHours {
    start_hour: u32,
    end_hour: u32,
    tz: Tz,
}

impl ActiveHours {
    pub fn new(start_hour: u32, end_hour: u32, tz: Tz) -> Self {
        Self {
            start_hour,
            end_hour,
            tz,
        }
    }

    /// Whether the gate is open right now.
    pub fn is_open(&self) -> bool {
        self.is_open_at(Utc::now())
    }

    /// Whether the gate is open at the given instant.
    ///
    /// `start == end` means always open. `start < end` is the same-day
    /// window `[start, end)`. `start > end` wraps past midnight:
    /// open when `hour >= start || hour < end`.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        if self.start_hour == self.end_hour {
            return true;
        }
        let hour = now.with_timezone(&self.tz).hour();
        if self.start_hour < self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    pub fn is_always_open(&self) -> bool {
        self.start_hour == self.end_hour
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }
}

impl std::fmt::Display for ActiveHours {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_always_open() {
            write!(f, "always open ({})", self.tz)
        } else {
            write!(
                f,
                "{:02}:00-{:02}:00 {}",
                self.start_hour, self.end_hour, self.tz
            )
        }
    }
}
