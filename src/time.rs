// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time representation and the monotonic counter / UTC time collaborators.
//!
//! spec.md §6 specifies a 34Q30 fixed-point time format: 34 integer bits
//! of seconds in the upper part of a signed 64-bit value, 30 fractional
//! bits in the lower part. A `counter` is a monotonic tick source with a
//! configurable frequency of at least 1 kHz.

/// Number of fractional bits in the 34Q30 time format.
pub const TIME_Q: u32 = 30;

/// A 34Q30 fixed-point timestamp (seconds in the high 34 bits, fraction
/// in the low 30 bits of a signed 64-bit integer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// The zero timestamp.
    pub const ZERO: Self = Self(0);

    /// Build a timestamp from whole seconds and a fractional part in
    /// `[0.0, 1.0)`.
    pub fn from_seconds_f64(seconds: f64) -> Self {
        Self((seconds * (1i64 << TIME_Q) as f64) as i64)
    }

    /// Convert to seconds as a floating point value.
    pub fn as_seconds_f64(self) -> f64 {
        self.0 as f64 / (1i64 << TIME_Q) as f64
    }

    /// Add a duration expressed in milliseconds, saturating on overflow.
    pub fn add_millis(self, millis: i64) -> Self {
        let ticks = (millis.saturating_mul(1i64 << TIME_Q)) / 1000;
        Self(self.0.saturating_add(ticks))
    }

    /// Signed difference `self - other`, in the same 34Q30 units.
    pub fn sub(self, other: Self) -> i64 {
        self.0.wrapping_sub(other.0)
    }
}

/// UTC / monotonic time source collaborator (spec.md §6 "Time source").
///
/// Implementations provide both the 34Q30 wall-clock-ish `timestamp` and a
/// free-running `counter` at a configurable frequency (>= 1 kHz), mirroring
/// the split between "timestamp" and "counter" described in the spec.
pub trait TimeSource {
    /// Current time in 34Q30 fixed-point format. `0` means UTC is unknown.
    fn timestamp(&self) -> Timestamp;

    /// Frequency of [`TimeSource::counter`] in Hz (>= 1000).
    fn counter_frequency(&self) -> u64;

    /// Free-running monotonic tick counter.
    fn counter(&self) -> u64;
}

/// A [`TimeSource`] driven entirely by the caller, for tests and for
/// platforms where the standard library clock is not the right source
/// (e.g. a timer peripheral read through a driver).
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now: core::cell::Cell<Timestamp>,
    ticks: core::cell::Cell<u64>,
    frequency_hz: u64,
}

impl ManualTimeSource {
    /// Create a manual time source starting at [`Timestamp::ZERO`].
    pub fn new(frequency_hz: u64) -> Self {
        Self {
            now: core::cell::Cell::new(Timestamp::ZERO),
            ticks: core::cell::Cell::new(0),
            frequency_hz,
        }
    }

    /// Advance the clock by `millis` milliseconds.
    pub fn advance_millis(&self, millis: i64) {
        self.now.set(self.now.get().add_millis(millis));
        let delta_ticks = (millis as u64).saturating_mul(self.frequency_hz) / 1000;
        self.ticks.set(self.ticks.get().saturating_add(delta_ticks));
    }

    /// Set the clock to an absolute timestamp.
    pub fn set(&self, now: Timestamp) {
        self.now.set(now);
    }
}

impl TimeSource for ManualTimeSource {
    fn timestamp(&self) -> Timestamp {
        self.now.get()
    }

    fn counter_frequency(&self) -> u64 {
        self.frequency_hz
    }

    fn counter(&self) -> u64 {
        self.ticks.get()
    }
}

/// A [`TimeSource`] backed by `std::time::SystemTime`/`Instant`, the
/// concrete collaborator a hosted (non-embedded) build uses by default.
#[derive(Debug)]
pub struct StdTimeSource {
    start: std::time::Instant,
}

impl StdTimeSource {
    /// Create a time source anchored to "now".
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

impl Default for StdTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for StdTimeSource {
    fn timestamp(&self) -> Timestamp {
        match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => Timestamp::from_seconds_f64(d.as_secs_f64()),
            Err(_) => Timestamp::ZERO,
        }
    }

    fn counter_frequency(&self) -> u64 {
        1_000_000
    }

    fn counter(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_roundtrip_seconds() {
        let t = Timestamp::from_seconds_f64(12.5);
        assert!((t.as_seconds_f64() - 12.5).abs() < 1e-6);
    }

    #[test]
    fn manual_time_source_advances() {
        let ts = ManualTimeSource::new(1000);
        let t0 = ts.timestamp();
        ts.advance_millis(100);
        let t1 = ts.timestamp();
        assert!(t1.sub(t0) > 0);
        assert_eq!(ts.counter(), 100);
    }

    #[test]
    fn timestamp_sub_is_antisymmetric() {
        let a = Timestamp::from_seconds_f64(3.0);
        let b = Timestamp::from_seconds_f64(5.0);
        assert_eq!(a.sub(b), -(b.sub(a)));
    }
}
