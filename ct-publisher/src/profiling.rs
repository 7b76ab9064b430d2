// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Sampling of blocking events in the async runtime.
//!
//! The sampling rate is process-wide and is set once during startup, before the runtime is
//! built. When it is non-zero, [`install`] adds park/unpark hooks to the runtime builder which
//! measure how long worker threads spend blocked waiting for events. One event is sampled for
//! every `rate` nanoseconds of accumulated blocked time; events that last longer than `rate`
//! are always sampled. When the rate is zero no hooks are installed and nothing is measured.

use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

static PROFILE: BlockProfile = BlockProfile::new();

thread_local! {
    static PARKED_AT: Cell<Option<Instant>> = const { Cell::new(None) };
}

/// Counters for sampled blocking events.
#[derive(Debug)]
pub struct BlockProfile {
    rate: AtomicU64,
    events: AtomicU64,
    samples: AtomicU64,
    sampled_nanos: AtomicU64,
    // Blocked time not yet accounted for by a sample.
    credit: Mutex<u64>,
}

/// A point-in-time copy of a [`BlockProfile`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockProfileSnapshot {
    /// The sampling rate in nanoseconds; zero when sampling is off.
    pub rate: u64,
    /// The number of blocking events observed.
    pub events: u64,
    /// The number of events that were sampled.
    pub samples: u64,
    /// The total blocked time of the sampled events.
    pub sampled: Duration,
}

impl BlockProfile {
    pub const fn new() -> Self {
        Self {
            rate: AtomicU64::new(0),
            events: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            sampled_nanos: AtomicU64::new(0),
            credit: Mutex::new(0),
        }
    }

    pub fn set_rate(&self, rate: u64) {
        self.rate.store(rate, Ordering::Relaxed);
    }

    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Account for a thread having been blocked for `blocked`.
    pub fn record(&self, blocked: Duration) {
        let rate = self.rate();
        if rate == 0 {
            return;
        }
        let nanos = u64::try_from(blocked.as_nanos()).unwrap_or(u64::MAX);
        self.events.fetch_add(1, Ordering::Relaxed);

        let sampled = if nanos >= rate {
            true
        } else {
            let mut credit = self.credit.lock().unwrap_or_else(|error| error.into_inner());
            *credit += nanos;
            if *credit >= rate {
                *credit -= rate;
                true
            } else {
                false
            }
        };
        if sampled {
            self.samples.fetch_add(1, Ordering::Relaxed);
            self.sampled_nanos.fetch_add(nanos, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> BlockProfileSnapshot {
        BlockProfileSnapshot {
            rate: self.rate(),
            events: self.events.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            sampled: Duration::from_nanos(self.sampled_nanos.load(Ordering::Relaxed)),
        }
    }
}

impl Default for BlockProfile {
    fn default() -> Self {
        Self::new()
    }
}

/// Set the process-wide blocking sample rate in nanoseconds. Zero turns sampling off.
pub fn set_block_profile_rate(rate: u64) {
    PROFILE.set_rate(rate);
}

pub fn block_profile_rate() -> u64 {
    PROFILE.rate()
}

/// The process-wide profile.
pub fn block_profile() -> &'static BlockProfile {
    &PROFILE
}

/// Add the sampling hooks to a runtime builder if sampling is enabled.
pub fn install(builder: &mut tokio::runtime::Builder) -> &mut tokio::runtime::Builder {
    if block_profile_rate() == 0 {
        return builder;
    }
    builder
        .on_thread_park(|| PARKED_AT.with(|parked_at| parked_at.set(Some(Instant::now()))))
        .on_thread_unpark(|| {
            if let Some(parked_at) = PARKED_AT.with(Cell::take) {
                PROFILE.record(parked_at.elapsed());
            }
        })
}
