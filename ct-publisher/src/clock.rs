// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! A clock capability handed to the server and publisher so tests can control time.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

/// A source of the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> SystemTime;

    /// The time elapsed since `earlier`, or zero if `earlier` is in the future.
    fn since(&self, earlier: SystemTime) -> Duration {
        self.now().duration_since(earlier).unwrap_or_default()
    }
}

/// The system's wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Move the clock forward. All clones of this clock observe the change.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|error| error.into_inner());
        *now += by;
    }

    pub fn set(&self, to: SystemTime) {
        *self.now.lock().unwrap_or_else(|error| error.into_inner()) = to;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(|error| error.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances_all_clones() {
        let clock = FakeClock::default();
        let start = clock.now();
        let other = clock.clone();
        other.advance(Duration::from_secs(90));

        assert_eq!(clock.since(start), Duration::from_secs(90));
        assert_eq!(clock.now(), other.now());
    }

    #[test]
    fn since_future_is_zero() {
        let clock = FakeClock::default();
        let later = clock.now() + Duration::from_secs(1);
        assert_eq!(clock.since(later), Duration::ZERO);
    }
}
