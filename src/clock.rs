//! Monotonic clock & deadline arithmetic (spec §4.C1).
//!
//! Deadlines bound the *wait for lane admission*, never execution. All
//! arithmetic here is monotonic; wall-clock time is never used.

use std::time::{Duration, Instant};

/// A point in monotonic time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn now() -> Instant {
        Instant::now()
    }

    pub fn after(duration: Duration) -> Self {
        Deadline(Instant::now() + duration)
    }

    pub fn at(instant: Instant) -> Self {
        Deadline(instant)
    }

    pub fn expired(self) -> bool {
        Instant::now() >= self.0
    }

    pub fn remaining(self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn instant(self) -> Instant {
        self.0
    }
}
