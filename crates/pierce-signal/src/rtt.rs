//! Round-trip time estimation from `ping` / `pong` pairs
//!
//! Only one ping is outstanding at a time; a pong with nothing outstanding is
//! ignored. Samples are smoothed the way TCP smooths its RTT:
//! `srtt = 7/8 * srtt + 1/8 * sample`.

use std::time::Duration;
use tokio::time::Instant;

/// Smoothed round-trip estimate
#[derive(Debug, Clone, Copy, Default)]
pub struct RttEstimator {
    outstanding: Option<Instant>,
    smoothed: Option<Duration>,
}

impl RttEstimator {
    /// Create an estimator with no samples
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A ping went out at `at`
    ///
    /// An unanswered earlier ping is forgotten.
    pub fn ping_sent(&mut self, at: Instant) {
        self.outstanding = Some(at);
    }

    /// A pong arrived at `at`; returns the sample it produced
    pub fn pong_received(&mut self, at: Instant) -> Option<Duration> {
        let sent = self.outstanding.take()?;
        let sample = at.saturating_duration_since(sent);
        self.observe(sample);
        Some(sample)
    }

    /// Fold a sample into the estimate
    pub fn observe(&mut self, sample: Duration) {
        self.smoothed = Some(match self.smoothed {
            Some(srtt) => (srtt * 7 + sample) / 8,
            None => sample,
        });
    }

    /// Current estimate, `None` before the first sample
    #[must_use]
    pub fn smoothed(&self) -> Option<Duration> {
        self.smoothed
    }

    /// Current estimate in whole milliseconds, as carried by health reports
    #[must_use]
    pub fn smoothed_ms(&self) -> Option<u32> {
        self.smoothed
            .map(|rtt| u32::try_from(rtt.as_millis()).unwrap_or(u32::MAX))
    }
}
