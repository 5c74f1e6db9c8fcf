//! Monotonic-to-epoch timestamp correlation.
//!
//! V4L2 drivers stamp buffers with `CLOCK_MONOTONIC`. The offset to wall
//! clock time is taken from the first buffer of a session, pairing its
//! driver timestamp with the wall clock at dequeue, and reused for every
//! later frame.

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock time in microseconds since the Unix epoch.
pub fn epoch_now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
}

/// Converts device monotonic timestamps to epoch time with a fixed offset.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampCorrelator {
    offset_us: Option<i64>,
}

impl TimestampCorrelator {
    /// A correlator that anchors its offset on first use.
    #[must_use]
    pub const fn new() -> Self {
        Self { offset_us: None }
    }

    /// A correlator with the offset taken from a known `(monotonic, epoch)` pair.
    #[must_use]
    pub const fn from_pair(monotonic_us: i64, epoch_us: i64) -> Self {
        Self {
            offset_us: Some(epoch_us - monotonic_us),
        }
    }

    /// The stored offset, if it has been computed.
    #[must_use]
    pub const fn offset_us(&self) -> Option<i64> {
        self.offset_us
    }

    /// Convert a device monotonic timestamp.
    ///
    /// The first call pairs `monotonic_us` with the current wall clock.
    /// The offset is never refreshed for the session.
    pub fn to_epoch(&mut self, monotonic_us: i64) -> i64 {
        let offset = *self.offset_us.get_or_insert_with(|| {
            let offset = epoch_now_us() - monotonic_us;
            tracing::debug!(offset_us = offset, "correlated device clock with wall clock");
            offset
        });
        monotonic_us + offset
    }
}
